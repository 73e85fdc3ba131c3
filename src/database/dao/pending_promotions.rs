//! 提升日志数据访问对象
//!
//! 记录“暂存目录即将成为正式目录”的意图，提交或回滚后删除

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::PathBuf;

use crate::plugin::PendingPromotion;

fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingPromotion> {
    let backup_path: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                Type::Text,
                format!("无效的时间格式: {}", e).into(),
            )
        })?;
    let size_bytes: i64 = row.get(7)?;

    Ok(PendingPromotion {
        plugin_id: row.get(0)?,
        operation_id: row.get(1)?,
        version: row.get(2)?,
        checksum: row.get(3)?,
        source: row.get(4)?,
        description: row.get(5)?,
        author: row.get(6)?,
        size_bytes: size_bytes.max(0) as u64,
        backup_path: backup_path.map(PathBuf::from),
        created_at,
    })
}

pub struct PendingPromotionsDao;

impl PendingPromotionsDao {
    /// 写入提升意图（同一插件只保留最新一条）
    pub fn insert(conn: &Connection, pending: &PendingPromotion) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT OR REPLACE INTO pending_promotions
             (plugin_id, operation_id, version, checksum, source, description, author,
              size_bytes, backup_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                pending.plugin_id,
                pending.operation_id,
                pending.version,
                pending.checksum,
                pending.source,
                pending.description,
                pending.author,
                pending.size_bytes as i64,
                pending
                    .backup_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                pending.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn list(conn: &Connection) -> Result<Vec<PendingPromotion>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT plugin_id, operation_id, version, checksum, source, description, author,
                    size_bytes, backup_path, created_at
             FROM pending_promotions ORDER BY plugin_id",
        )?;

        let rows = stmt.query_map([], map_row)?;
        let pending = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(pending)
    }

    pub fn delete(conn: &Connection, plugin_id: &str) -> Result<bool, rusqlite::Error> {
        let rows_affected = conn.execute(
            "DELETE FROM pending_promotions WHERE plugin_id = ?1",
            params![plugin_id],
        )?;

        Ok(rows_affected > 0)
    }
}
