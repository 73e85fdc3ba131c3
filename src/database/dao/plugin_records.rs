//! 插件记录数据访问对象
//!
//! 提供 plugin_records 表的读写。状态检查与迁移规则由注册表负责，
//! 这里只做行与 PluginRecord 之间的转换。

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::plugin::{PluginRecord, PluginState};

const SELECT_COLUMNS: &str = "SELECT id, installed_version, state, source, checksum, description,
        author, size_bytes, installed_at, updated_at, last_error
     FROM plugin_records";

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn parse_time(index: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, format!("无效的时间格式: {}", e)))
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<PluginRecord> {
    let state: String = row.get(2)?;
    let state = state
        .parse::<PluginState>()
        .map_err(|e| conversion_error(2, e))?;
    let installed_at: Option<String> = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let size_bytes: i64 = row.get(7)?;

    Ok(PluginRecord {
        id: row.get(0)?,
        installed_version: row.get(1)?,
        state,
        source: row.get(3)?,
        checksum: row.get(4)?,
        description: row.get(5)?,
        author: row.get(6)?,
        size_bytes: size_bytes.max(0) as u64,
        installed_at: installed_at
            .as_deref()
            .map(|t| parse_time(8, t))
            .transpose()?,
        updated_at: parse_time(9, &updated_at)?,
        last_error: row.get(10)?,
    })
}

pub struct PluginRecordsDao;

impl PluginRecordsDao {
    /// 插入或覆盖记录
    pub fn upsert(conn: &Connection, record: &PluginRecord) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT OR REPLACE INTO plugin_records
             (id, installed_version, state, source, checksum, description, author,
              size_bytes, installed_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.installed_version,
                record.state.as_str(),
                record.source,
                record.checksum,
                record.description,
                record.author,
                record.size_bytes as i64,
                record.installed_at.map(|t| t.to_rfc3339()),
                record.updated_at.to_rfc3339(),
                record.last_error,
            ],
        )?;

        Ok(())
    }

    /// 获取记录
    pub fn get(conn: &Connection, plugin_id: &str) -> Result<Option<PluginRecord>, rusqlite::Error> {
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![plugin_id],
            map_row,
        )
        .optional()
    }

    /// 按 id 顺序分页读取，`after` 为上一页最后一个 id
    pub fn list_page(
        conn: &Connection,
        after: Option<&str>,
        state: Option<PluginState>,
        limit: usize,
    ) -> Result<Vec<PluginRecord>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE id > ?1 AND (?2 IS NULL OR state = ?2) ORDER BY id LIMIT ?3",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                after.unwrap_or(""),
                state.map(|s| s.as_str()),
                limit as i64
            ],
            map_row,
        )?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// 列出处于瞬态的记录（启动恢复用）
    pub fn list_transient(conn: &Connection) -> Result<Vec<PluginRecord>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE state IN ('installing', 'updating', 'uninstalling') ORDER BY id",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map([], map_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// 删除记录
    pub fn delete(conn: &Connection, plugin_id: &str) -> Result<bool, rusqlite::Error> {
        let rows_affected = conn.execute(
            "DELETE FROM plugin_records WHERE id = ?1",
            params![plugin_id],
        )?;

        Ok(rows_affected > 0)
    }
}
