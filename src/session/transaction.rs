//! 事务：跨多个关联信封的编排（加入 / 移除 Agent、交接、会话开关）
//!
//! 每个事务记录已完成步骤与下一期望步骤；等待有上界，超时即以失败收场。

use std::fmt;

use tokio::time::Instant;

use super::context::SessionPhase;
use crate::message::{AgentId, Participant, TurnId, TxId};

/// 等待新成员加入期间暂存的用户输入（邀请式提及）
#[derive(Debug, Clone)]
pub struct DeferredInput {
    pub turn_id: TurnId,
    pub trace_id: Option<String>,
    pub requested_by: Participant,
    pub text: String,
    pub selection: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum TxKind {
    AddAgent {
        agent_id: AgentId,
        reason: Option<String>,
        deferred: Option<DeferredInput>,
    },
    RemoveAgent {
        agent_id: AgentId,
        reason: Option<String>,
    },
    Handover {
        from_agent: AgentId,
        to_agent: AgentId,
        summary: Option<String>,
        context_ref: Option<String>,
        reason: Option<String>,
    },
    OpenSession {
        agents: Vec<AgentId>,
    },
    CloseSession {
        reason: Option<String>,
        /// 关闭失败或超时后恢复到的阶段
        resume: SessionPhase,
    },
}

impl TxKind {
    pub fn name(&self) -> &'static str {
        match self {
            TxKind::AddAgent { .. } => "ADD_AGENT",
            TxKind::RemoveAgent { .. } => "REMOVE_AGENT",
            TxKind::Handover { .. } => "HANDOVER",
            TxKind::OpenSession { .. } => "OPEN_SESSION",
            TxKind::CloseSession { .. } => "CLOSE_SESSION",
        }
    }

    fn membership_agent(&self) -> Option<&str> {
        match self {
            TxKind::AddAgent { agent_id, .. } | TxKind::RemoveAgent { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    fn is_lifecycle(&self) -> bool {
        matches!(self, TxKind::OpenSession { .. } | TxKind::CloseSession { .. })
    }
}

/// 事务步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    /// 等待取消协议完成（确认或强制）
    CancelSpeaker,
    /// 等待 SessionManager 的终态回执
    ManagerReply,
    /// 等待前端的交接决定
    UserDecision,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub tx_id: TxId,
    pub kind: TxKind,
    pub trace_id: Option<String>,
    pub completed: Vec<TxStep>,
    pub expected: TxStep,
    /// 取消阶段由取消流程计时，此处为 None
    pub deadline: Option<Instant>,
    pub created_at: Instant,
}

impl Transaction {
    pub fn new(tx_id: TxId, kind: TxKind, trace_id: Option<String>, expected: TxStep, deadline: Option<Instant>) -> Self {
        Self {
            tx_id,
            kind,
            trace_id,
            completed: Vec::new(),
            expected,
            deadline,
            created_at: Instant::now(),
        }
    }

    /// 当前步骤完成，进入下一步
    pub fn advance(&mut self, next: TxStep, deadline: Option<Instant>) {
        self.completed.push(self.expected);
        self.expected = next;
        self.deadline = deadline;
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TxKind::AddAgent { agent_id, .. } | TxKind::RemoveAgent { agent_id, .. } => {
                write!(f, "{}({}) awaiting {:?}", self.kind.name(), agent_id, self.expected)
            }
            TxKind::Handover { from_agent, to_agent, .. } => {
                write!(f, "HANDOVER({}->{}) awaiting {:?}", from_agent, to_agent, self.expected)
            }
            _ => write!(f, "{} awaiting {:?}", self.kind.name(), self.expected),
        }
    }
}

/// 按创建顺序保存的事务表
#[derive(Debug, Default)]
pub struct TransactionTable {
    txs: Vec<Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 与新事务冲突的现存事务：同一 Agent 的成员变更、生命周期事务、交接各自至多一个
    pub fn conflicting(&self, kind: &TxKind) -> Option<&Transaction> {
        self.txs.iter().find(|tx| match (kind.membership_agent(), tx.kind.membership_agent()) {
            (Some(a), Some(b)) => a == b,
            _ => {
                (kind.is_lifecycle() && tx.kind.is_lifecycle())
                    || (matches!(kind, TxKind::Handover { .. }) && matches!(tx.kind, TxKind::Handover { .. }))
            }
        })
    }

    pub fn insert(&mut self, tx: Transaction) {
        self.txs.push(tx);
    }

    pub fn get(&self, tx_id: &str) -> Option<&Transaction> {
        self.txs.iter().find(|tx| tx.tx_id == tx_id)
    }

    pub fn get_mut(&mut self, tx_id: &str) -> Option<&mut Transaction> {
        self.txs.iter_mut().find(|tx| tx.tx_id == tx_id)
    }

    pub fn remove(&mut self, tx_id: &str) -> Option<Transaction> {
        let idx = self.txs.iter().position(|tx| tx.tx_id == tx_id)?;
        Some(self.txs.remove(idx))
    }

    /// 唯一的在途交接
    pub fn pending_handover(&self) -> Option<&Transaction> {
        self.txs
            .iter()
            .find(|tx| matches!(tx.kind, TxKind::Handover { .. }) && tx.expected == TxStep::UserDecision)
    }

    /// 正在等待某个取消协议结束的事务
    pub fn awaiting_cancel(&self) -> Vec<TxId> {
        self.txs
            .iter()
            .filter(|tx| tx.expected == TxStep::CancelSpeaker)
            .map(|tx| tx.tx_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn tx_ids(&self) -> Vec<TxId> {
        self.txs.iter().map(|tx| tx.tx_id.clone()).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.txs.iter().filter_map(|tx| tx.deadline).min()
    }

    pub fn expired(&self, now: Instant) -> Vec<TxId> {
        self.txs
            .iter()
            .filter(|tx| tx.deadline.is_some_and(|d| d <= now))
            .map(|tx| tx.tx_id.clone())
            .collect()
    }

    pub fn describe(&self) -> Vec<String> {
        self.txs.iter().map(|tx| tx.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn add(id: &str) -> TxKind {
        TxKind::AddAgent {
            agent_id: id.to_string(),
            reason: None,
            deferred: None,
        }
    }

    #[test]
    fn test_membership_conflicts_per_agent() {
        let mut table = TransactionTable::new();
        table.insert(Transaction::new("tx1".into(), add("a"), None, TxStep::ManagerReply, None));

        let remove = TxKind::RemoveAgent {
            agent_id: "a".into(),
            reason: None,
        };
        assert!(table.conflicting(&remove).is_some());
        assert!(table.conflicting(&add("b")).is_none());
        assert!(table.conflicting(&TxKind::CloseSession {
            reason: None,
            resume: SessionPhase::Open,
        }).is_none());
    }

    #[test]
    fn test_lifecycle_and_handover_are_exclusive() {
        let mut table = TransactionTable::new();
        table.insert(Transaction::new(
            "tx1".into(),
            TxKind::OpenSession { agents: vec![] },
            None,
            TxStep::ManagerReply,
            None,
        ));
        assert!(table.conflicting(&TxKind::CloseSession {
            reason: None,
            resume: SessionPhase::Open,
        }).is_some());

        let handover = TxKind::Handover {
            from_agent: "a".into(),
            to_agent: "b".into(),
            summary: None,
            context_ref: None,
            reason: None,
        };
        assert!(table.conflicting(&handover).is_none());
        table.insert(Transaction::new("tx2".into(), handover.clone(), None, TxStep::UserDecision, None));
        assert!(table.conflicting(&handover).is_some());
        assert_eq!(table.pending_handover().map(|tx| tx.tx_id.as_str()), Some("tx2"));
    }

    #[test]
    fn test_advance_records_steps() {
        let mut tx = Transaction::new(
            "tx1".into(),
            TxKind::RemoveAgent {
                agent_id: "a".into(),
                reason: None,
            },
            None,
            TxStep::CancelSpeaker,
            None,
        );
        let deadline = Instant::now() + Duration::from_secs(1);
        tx.advance(TxStep::ManagerReply, Some(deadline));
        assert_eq!(tx.completed, vec![TxStep::CancelSpeaker]);
        assert_eq!(tx.expected, TxStep::ManagerReply);
        assert_eq!(tx.to_string(), "REMOVE_AGENT(a) awaiting ManagerReply");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_transactions() {
        let mut table = TransactionTable::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        table.insert(Transaction::new("tx1".into(), add("a"), None, TxStep::ManagerReply, Some(deadline)));
        table.insert(Transaction::new(
            "tx2".into(),
            TxKind::RemoveAgent {
                agent_id: "b".into(),
                reason: None,
            },
            None,
            TxStep::CancelSpeaker,
            None,
        ));
        assert_eq!(table.next_deadline(), Some(deadline));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(table.expired(Instant::now()), vec!["tx1".to_string()]);
        assert_eq!(table.awaiting_cancel(), vec!["tx2".to_string()]);
    }
}
