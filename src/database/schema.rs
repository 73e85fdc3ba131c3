use rusqlite::Connection;

/// 创建表结构
pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS plugin_records (
            id TEXT PRIMARY KEY,
            installed_version TEXT,
            state TEXT NOT NULL,
            source TEXT,
            checksum TEXT NOT NULL DEFAULT '',
            description TEXT,
            author TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            installed_at TEXT,
            updated_at TEXT NOT NULL,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_plugin_records_state ON plugin_records(state);

        CREATE TABLE IF NOT EXISTS pending_promotions (
            plugin_id TEXT PRIMARY KEY,
            operation_id TEXT NOT NULL,
            version TEXT NOT NULL,
            checksum TEXT NOT NULL,
            source TEXT NOT NULL,
            description TEXT,
            author TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            backup_path TEXT,
            created_at TEXT NOT NULL
        );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('plugin_records', 'pending_promotions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
