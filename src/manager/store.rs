//! 会话存储抽象层
//!
//! SessionManager 在这里记录每个会话的成员与状态；运行时看不到它。
//! 目前只有内存实现。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::message::{AgentProfile, SessionId};

/// 会话记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

/// 单个会话的持久化视图
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub members: Vec<AgentProfile>,
    pub active_agent_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Open,
            members: Vec::new(),
            active_agent_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m.agent_id == agent_id)
    }
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话记录
    async fn load(&self, session_id: &str) -> Option<SessionRecord>;

    /// 写入（覆盖）会话记录
    async fn save(&self, record: SessionRecord);

    /// 添加成员；已存在时返回 false
    async fn add_member(&self, session_id: &str, profile: AgentProfile) -> bool;

    /// 移除成员；不存在时返回 false
    async fn remove_member(&self, session_id: &str, agent_id: &str) -> bool;

    /// 记录活跃 Agent（下次打开时恢复）
    async fn set_active(&self, session_id: &str, agent_id: Option<String>);

    /// 标记会话状态
    async fn set_status(&self, session_id: &str, status: SessionStatus);

    /// 当前仍为 Open 的会话数
    async fn open_count(&self) -> usize;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn save(&self, mut record: SessionRecord) {
        record.updated_at = Utc::now();
        self.sessions.write().await.insert(record.session_id.clone(), record);
    }

    async fn add_member(&self, session_id: &str, profile: AgentProfile) -> bool {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id));
        if record.is_member(&profile.agent_id) {
            return false;
        }
        record.members.push(profile);
        record.updated_at = Utc::now();
        true
    }

    async fn remove_member(&self, session_id: &str, agent_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = record.members.len();
        record.members.retain(|m| m.agent_id != agent_id);
        if record.active_agent_id.as_deref() == Some(agent_id) {
            record.active_agent_id = None;
        }
        record.updated_at = Utc::now();
        record.members.len() != before
    }

    async fn set_active(&self, session_id: &str, agent_id: Option<String>) {
        if let Some(record) = self.sessions.write().await.get_mut(session_id) {
            record.active_agent_id = agent_id;
            record.updated_at = Utc::now();
        }
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(record) = self.sessions.write().await.get_mut(session_id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }

    async fn open_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|r| r.status == SessionStatus::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_remove_member() {
        let store = MemorySessionStore::new();
        assert!(store.add_member("s1", AgentProfile::new("a", "echo")).await);
        assert!(!store.add_member("s1", AgentProfile::new("a", "echo")).await);
        assert!(store.add_member("s1", AgentProfile::new("b", "echo")).await);

        let record = store.load("s1").await.unwrap();
        assert_eq!(record.members.len(), 2);

        assert!(store.remove_member("s1", "a").await);
        assert!(!store.remove_member("s1", "a").await);
        assert!(!store.remove_member("missing", "a").await);
    }

    #[tokio::test]
    async fn test_status_and_open_count() {
        let store = MemorySessionStore::new();
        store.save(SessionRecord::new("s1")).await;
        store.save(SessionRecord::new("s2")).await;
        assert_eq!(store.open_count().await, 2);

        store.set_status("s1", SessionStatus::Closed).await;
        assert_eq!(store.open_count().await, 1);
        assert_eq!(store.load("s1").await.unwrap().status, SessionStatus::Closed);
    }
}
