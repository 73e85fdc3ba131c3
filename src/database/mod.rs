//! 注册表持久化
//!
//! SQLite 数据库连接与表结构

pub mod dao;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type DbConnection = Arc<Mutex<Connection>>;

/// 打开数据库并初始化表结构（父目录由调用方创建）
///
/// 每次提交都需要在对后续读取可见前落盘，因此使用 WAL + synchronous=FULL
pub fn open_database(db_path: &Path) -> Result<DbConnection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    schema::create_tables(&conn)?;

    tracing::info!("[REGISTRY] 数据库已打开: {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// 打开内存数据库（测试和临时场景）
pub fn open_in_memory() -> Result<DbConnection, rusqlite::Error> {
    let conn = Connection::open_in_memory()?;
    schema::create_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}
