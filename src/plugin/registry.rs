//! 插件注册表
//!
//! 插件 id → PluginRecord 的持久化映射，是“已安装”状态的唯一来源。
//! 所有写入都经过 compare_and_transition：先在事务内确认记录仍处于期望状态，
//! 再应用修改。即使上层已经持有插件锁也如此，用于发现锁或恢复流程中的竞争。

use chrono::Utc;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::MutexGuard;
use thiserror::Error;

use super::state_machine::LifecycleStateMachine;
use super::types::{PendingPromotion, PluginRecord, PluginState};
use crate::database::dao::pending_promotions::PendingPromotionsDao;
use crate::database::dao::plugin_records::PluginRecordsDao;
use crate::database::{self, DbConnection};

const LIST_PAGE_SIZE: usize = 64;

/// 注册表错误
#[derive(Error, Debug)]
pub enum RegistryError {
    /// 记录已被其他操作修改
    #[error("状态冲突: 插件 {id} 期望状态 {expected}, 实际状态 {actual}")]
    StateConflict {
        id: String,
        expected: PluginState,
        actual: PluginState,
    },

    /// 调用方请求了状态机不允许的迁移
    #[error("非法的状态迁移: {from} → {to}")]
    IllegalTransition { from: PluginState, to: PluginState },

    /// 存储错误
    #[error("存储错误: {0}")]
    Storage(#[from] rusqlite::Error),

    /// 连接锁中毒
    #[error("注册表连接不可用")]
    Poisoned,
}

/// 插件注册表
#[derive(Clone)]
pub struct PluginRegistry {
    conn: DbConnection,
}

impl PluginRegistry {
    /// 使用已有连接创建注册表
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    /// 打开数据库文件
    pub fn open(db_path: &Path) -> Result<Self, RegistryError> {
        Ok(Self::new(database::open_database(db_path)?))
    }

    /// 内存注册表
    pub fn in_memory() -> Result<Self, RegistryError> {
        Ok(Self::new(database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// 获取插件记录
    ///
    /// 未知 id 返回 Absent 记录，不是错误
    pub fn get(&self, plugin_id: &str) -> Result<PluginRecord, RegistryError> {
        let conn = self.lock()?;
        Ok(PluginRecordsDao::get(&conn, plugin_id)?
            .unwrap_or_else(|| PluginRecord::absent(plugin_id)))
    }

    /// 按 id 排序列出全部记录
    pub fn list(&self) -> RecordListing {
        RecordListing::new(self.conn.clone(), None)
    }

    /// 按状态过滤列出记录
    pub fn list_by_state(&self, state: PluginState) -> RecordListing {
        RecordListing::new(self.conn.clone(), Some(state))
    }

    /// 比较并迁移
    ///
    /// 在同一事务内确认记录处于 `expected`，应用 `mutator`，再写入 `new` 状态。
    /// 非法迁移在读取记录之前就被拒绝。
    pub fn compare_and_transition<F>(
        &self,
        plugin_id: &str,
        expected: PluginState,
        new: PluginState,
        mutator: F,
    ) -> Result<PluginRecord, RegistryError>
    where
        F: FnOnce(&mut PluginRecord),
    {
        self.transition_with(plugin_id, expected, new, mutator, |_| Ok(()))
    }

    /// 写入提升意图
    ///
    /// 只允许在记录处于 Installing / Updating 时写入
    pub fn begin_promotion(&self, pending: &PendingPromotion) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let actual = PluginRecordsDao::get(&conn, &pending.plugin_id)?
            .map(|r| r.state)
            .unwrap_or_default();

        if !matches!(actual, PluginState::Installing | PluginState::Updating) {
            return Err(RegistryError::StateConflict {
                id: pending.plugin_id.clone(),
                expected: PluginState::Installing,
                actual,
            });
        }

        PendingPromotionsDao::insert(&conn, pending)?;
        Ok(())
    }

    /// 提交提升：迁移到 Installed 并在同一事务内删除提升意图
    pub fn commit_promotion<F>(
        &self,
        plugin_id: &str,
        expected: PluginState,
        mutator: F,
    ) -> Result<PluginRecord, RegistryError>
    where
        F: FnOnce(&mut PluginRecord),
    {
        self.transition_with(plugin_id, expected, PluginState::Installed, mutator, |tx| {
            PendingPromotionsDao::delete(tx, plugin_id).map(|_| ())
        })
    }

    /// 放弃提升意图（回滚后调用）
    pub fn abandon_promotion(&self, plugin_id: &str) -> Result<bool, RegistryError> {
        let conn = self.lock()?;
        Ok(PendingPromotionsDao::delete(&conn, plugin_id)?)
    }

    /// 未完成的提升意图
    pub fn pending_promotions(&self) -> Result<Vec<PendingPromotion>, RegistryError> {
        let conn = self.lock()?;
        Ok(PendingPromotionsDao::list(&conn)?)
    }

    /// 处于瞬态的记录
    pub fn transient_records(&self) -> Result<Vec<PluginRecord>, RegistryError> {
        let conn = self.lock()?;
        Ok(PluginRecordsDao::list_transient(&conn)?)
    }

    /// 删除记录（仅限 Absent）
    pub fn purge(&self, plugin_id: &str) -> Result<bool, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let Some(record) = PluginRecordsDao::get(&tx, plugin_id)? else {
            return Ok(false);
        };
        if record.state != PluginState::Absent {
            return Err(RegistryError::StateConflict {
                id: plugin_id.to_string(),
                expected: PluginState::Absent,
                actual: record.state,
            });
        }

        let deleted = PluginRecordsDao::delete(&tx, plugin_id)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// 把记录原样写回操作开始前的快照，包括 `updated_at`
    ///
    /// 记录必须仍处于 `expected`，且 `expected → snapshot.state` 是合法迁移
    pub fn revert(
        &self,
        expected: PluginState,
        snapshot: &PluginRecord,
    ) -> Result<PluginRecord, RegistryError> {
        if !LifecycleStateMachine::can_transition(expected, snapshot.state) {
            return Err(RegistryError::IllegalTransition {
                from: expected,
                to: snapshot.state,
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let actual = PluginRecordsDao::get(&tx, &snapshot.id)?
            .map(|r| r.state)
            .unwrap_or_default();
        if actual != expected {
            return Err(RegistryError::StateConflict {
                id: snapshot.id.clone(),
                expected,
                actual,
            });
        }

        PluginRecordsDao::upsert(&tx, snapshot)?;
        tx.commit()?;

        tracing::debug!("[REGISTRY] {}: {} → {} (还原)", snapshot.id, expected, snapshot.state);
        Ok(snapshot.clone())
    }

    fn transition_with<F, G>(
        &self,
        plugin_id: &str,
        expected: PluginState,
        new: PluginState,
        mutator: F,
        also: G,
    ) -> Result<PluginRecord, RegistryError>
    where
        F: FnOnce(&mut PluginRecord),
        G: FnOnce(&Connection) -> Result<(), rusqlite::Error>,
    {
        if !LifecycleStateMachine::can_transition(expected, new) {
            return Err(RegistryError::IllegalTransition { from: expected, to: new });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut record = PluginRecordsDao::get(&tx, plugin_id)?
            .unwrap_or_else(|| PluginRecord::absent(plugin_id));
        if record.state != expected {
            return Err(RegistryError::StateConflict {
                id: plugin_id.to_string(),
                expected,
                actual: record.state,
            });
        }

        mutator(&mut record);
        record.id = plugin_id.to_string();
        record.state = new;
        if new != PluginState::Failed {
            record.last_error = None;
        }
        record.updated_at = Utc::now();

        PluginRecordsDao::upsert(&tx, &record)?;
        also(&*tx)?;
        tx.commit()?;

        tracing::debug!("[REGISTRY] {}: {} → {}", plugin_id, expected, new);
        Ok(record)
    }
}

/// 惰性分页读取注册表记录
///
/// 按 id 升序逐页读取；`restart` 后从头重新读取
pub struct RecordListing {
    conn: DbConnection,
    state: Option<PluginState>,
    cursor: Option<String>,
    buffer: VecDeque<PluginRecord>,
    exhausted: bool,
}

impl RecordListing {
    fn new(conn: DbConnection, state: Option<PluginState>) -> Self {
        Self {
            conn,
            state,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// 回到开头
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), RegistryError> {
        let conn = self.conn.lock().map_err(|_| RegistryError::Poisoned)?;
        let page =
            PluginRecordsDao::list_page(&conn, self.cursor.as_deref(), self.state, LIST_PAGE_SIZE)?;

        if page.len() < LIST_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.id.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for RecordListing {
    type Item = Result<PluginRecord, RegistryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
