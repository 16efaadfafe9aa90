//! 会话上下文：由单个 SessionRuntime 独占，外部只能看到 `SessionSnapshot` 投影

use serde::Serialize;

use super::turn::TurnStatus;
use crate::message::{AgentId, AgentProfile, SessionId, TurnId};

/// 会话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

impl SessionPhase {
    /// 是否还接受用户输入
    pub fn accepts_input(&self) -> bool {
        !matches!(self, SessionPhase::Closing | SessionPhase::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Speaker {
    agent_id: AgentId,
    turn_id: TurnId,
}

/// 会话上下文
#[derive(Debug)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    active_agent_id: Option<AgentId>,
    /// 按加入顺序
    members: Vec<AgentProfile>,
    speaking: Option<Speaker>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            phase: SessionPhase::Idle,
            active_agent_id: None,
            members: Vec::new(),
            speaking: None,
        }
    }

    pub fn active_agent_id(&self) -> Option<&AgentId> {
        self.active_agent_id.as_ref()
    }

    /// 设置活跃 Agent，返回是否真的发生了变化
    pub fn set_active(&mut self, agent_id: Option<AgentId>) -> bool {
        if self.active_agent_id == agent_id {
            return false;
        }
        self.active_agent_id = agent_id;
        true
    }

    pub fn members(&self) -> &[AgentProfile] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<AgentId> {
        self.members.iter().map(|m| m.agent_id.clone()).collect()
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m.agent_id == agent_id)
    }

    pub fn first_member(&self) -> Option<&AgentId> {
        self.members.first().map(|m| &m.agent_id)
    }

    /// 加入成员；已存在时返回 false
    pub fn add_member(&mut self, profile: AgentProfile) -> bool {
        if self.is_member(&profile.agent_id) {
            return false;
        }
        self.members.push(profile);
        true
    }

    pub fn remove_member(&mut self, agent_id: &str) -> Option<AgentProfile> {
        let idx = self.members.iter().position(|m| m.agent_id == agent_id)?;
        Some(self.members.remove(idx))
    }

    pub fn speaking_agent_id(&self) -> Option<&AgentId> {
        self.speaking.as_ref().map(|s| &s.agent_id)
    }

    pub fn speaking_turn_id(&self) -> Option<&TurnId> {
        self.speaking.as_ref().map(|s| &s.turn_id)
    }

    /// 同一时刻至多一个发言者；已被别人占用时返回 false
    pub fn start_speaking(&mut self, agent_id: &str, turn_id: &str) -> bool {
        match &self.speaking {
            Some(s) if s.agent_id != agent_id || s.turn_id != turn_id => false,
            _ => {
                self.speaking = Some(Speaker {
                    agent_id: agent_id.to_string(),
                    turn_id: turn_id.to_string(),
                });
                true
            }
        }
    }

    /// 若该轮次持有发言权则释放
    pub fn release_speaking(&mut self, turn_id: &str) -> bool {
        if self.speaking.as_ref().map(|s| s.turn_id.as_str()) == Some(turn_id) {
            self.speaking = None;
            true
        } else {
            false
        }
    }

    pub fn clear_speaking(&mut self) {
        self.speaking = None;
    }

    /// 派生：有 Agent 在发言时用户才可打断
    pub fn user_interruptible(&self) -> bool {
        self.speaking.is_some()
    }

    /// 投影为只读快照
    pub fn project(&self, turns: Vec<(TurnId, TurnStatus)>, pending_transactions: Vec<String>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            active_agent_id: self.active_agent_id.clone(),
            members: self.member_ids(),
            speaking_agent_id: self.speaking_agent_id().cloned(),
            speaking_turn_id: self.speaking_turn_id().cloned(),
            user_interruptible: self.user_interruptible(),
            turns,
            pending_transactions,
        }
    }
}

/// 对外可见的会话状态投影（通过 watch 通道发布）
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub active_agent_id: Option<AgentId>,
    pub members: Vec<AgentId>,
    pub speaking_agent_id: Option<AgentId>,
    pub speaking_turn_id: Option<TurnId>,
    pub user_interruptible: bool,
    /// 在途 + 近期终态轮次
    pub turns: Vec<(TurnId, TurnStatus)>,
    /// 未完成事务的描述
    pub pending_transactions: Vec<String>,
}

impl SessionSnapshot {
    pub fn empty(session_id: impl Into<SessionId>) -> Self {
        SessionContext::new(session_id).project(Vec::new(), Vec::new())
    }

    pub fn turn_status(&self, turn_id: &str) -> Option<TurnStatus> {
        self.turns
            .iter()
            .rev()
            .find(|(id, _)| id == turn_id)
            .map(|(_, status)| *status)
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m == agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_speaker() {
        let mut ctx = SessionContext::new("s1");
        assert!(!ctx.user_interruptible());
        assert!(ctx.start_speaking("a", "t1"));
        assert!(ctx.start_speaking("a", "t1"));
        assert!(!ctx.start_speaking("b", "t2"));
        assert_eq!(ctx.speaking_agent_id().map(String::as_str), Some("a"));
        assert!(ctx.user_interruptible());

        assert!(!ctx.release_speaking("t2"));
        assert!(ctx.release_speaking("t1"));
        assert!(ctx.speaking_agent_id().is_none());
    }

    #[test]
    fn test_membership_keeps_join_order() {
        let mut ctx = SessionContext::new("s1");
        assert!(ctx.add_member(AgentProfile::new("b", "echo")));
        assert!(ctx.add_member(AgentProfile::new("a", "echo")));
        assert!(!ctx.add_member(AgentProfile::new("a", "echo")));
        assert_eq!(ctx.first_member().map(String::as_str), Some("b"));
        assert!(ctx.remove_member("b").is_some());
        assert_eq!(ctx.member_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_switch_guard() {
        let mut ctx = SessionContext::new("s1");
        assert!(ctx.set_active(Some("a".into())));
        assert!(!ctx.set_active(Some("a".into())));
        assert!(ctx.set_active(None));
    }
}
