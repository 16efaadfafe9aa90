//! 信封：会话内通信的最小单元
//!
//! 路由元信息（sender / target / 关联 ID）放在 `Envelope` 上，业务语义放在 `Body`（按 event + subtype 打标签）。
//! `Target::Agent` 自带 target_id，因此「target=AGENT 时必须有 target_id」由类型保证。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::body::Body;

/// 会话 ID
pub type SessionId = String;
/// Agent ID
pub type AgentId = String;
/// 轮次 ID（一次用户输入周期）
pub type TurnId = String;
/// 事务 ID（多步编排）
pub type TxId = String;

/// 路由目标（「发给谁」）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "target_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    /// 会话运行时（编排器入口）
    Session,
    /// 系统服务（SessionManager 等）
    System,
    /// 前端
    Frontend,
    /// 指定 Agent
    Agent(AgentId),
    /// 所有订阅者
    Broadcast,
}

impl Target {
    pub fn agent(agent_id: impl Into<AgentId>) -> Self {
        Target::Agent(agent_id.into())
    }

    /// target_id：仅 AGENT 有
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Target::Agent(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Session => write!(f, "session"),
            Target::System => write!(f, "system"),
            Target::Frontend => write!(f, "frontend"),
            Target::Agent(id) => write!(f, "agent:{}", id),
            Target::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// 发送方角色（「谁发的」），处理器据此校验来源
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Participant {
    Frontend,
    Runtime,
    SessionManager,
    Agent(AgentId),
}

impl Participant {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Participant::Agent(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Frontend => write!(f, "frontend"),
            Participant::Runtime => write!(f, "runtime"),
            Participant::SessionManager => write!(f, "session_manager"),
            Participant::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// 高层事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    UserInput,
    AgentOutput,
    Control,
    Event,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::UserInput => "USER_INPUT",
            EventKind::AgentOutput => "AGENT_OUTPUT",
            EventKind::Control => "CONTROL",
            EventKind::Event => "EVENT",
            EventKind::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// 信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 消息唯一 ID
    pub id: String,
    /// 所属会话（总线会校验）
    pub session_id: SessionId,
    pub sender: Participant,
    #[serde(flatten)]
    pub target: Target,
    /// 请求链路 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// 轮次 ID，同一轮内不可变
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    /// 事务 ID（SessionManager 回执 / HANDOVER 确认需原样带回）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
    /// 时间戳（毫秒）
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn new(session_id: impl Into<SessionId>, sender: Participant, target: Target, body: Body) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sender,
            target,
            trace_id: None,
            turn_id: None,
            tx_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_turn(mut self, turn_id: Option<TurnId>) -> Self {
        self.turn_id = turn_id;
        self
    }

    pub fn with_tx(mut self, tx_id: Option<TxId>) -> Self {
        self.tx_id = tx_id;
        self
    }

    pub fn event(&self) -> EventKind {
        self.body.event()
    }

    pub fn subtype(&self) -> &str {
        self.body.subtype()
    }

    /// 复制一份发往新目标（转发用，保留 id 之外的全部字段）
    pub fn retarget(&self, target: Target) -> Self {
        let mut forwarded = self.clone();
        forwarded.id = uuid::Uuid::new_v4().to_string();
        forwarded.target = target;
        forwarded
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}:{} {} -> {} turn={}>",
            self.event(),
            self.subtype(),
            self.sender,
            self.target,
            self.turn_id.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::body::{Body, Control};

    #[test]
    fn test_agent_target_carries_id() {
        let target = Target::agent("writer");
        assert_eq!(target.target_id(), Some("writer"));
        assert_eq!(Target::Frontend.target_id(), None);
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::new(
            "s1",
            Participant::Runtime,
            Target::agent("writer"),
            Body::Control(Control::InputAck),
        )
        .with_turn(Some("t1".to_string()));

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["target"], "AGENT");
        assert_eq!(value["target_id"], "writer");
        assert_eq!(value["event"], "CONTROL");
        assert_eq!(value["turn_id"], "t1");

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.target, Target::agent("writer"));
        assert_eq!(back.subtype(), "INPUT_ACK");
    }
}
