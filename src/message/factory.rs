//! 消息工厂：系统内所有 publish 都经由这里构造信封
//!
//! 工厂方法即消息清单；会话 ID 在构造时绑定，避免各模块手写元信息。

use super::body::{Body, CancelRequest, Control, ErrorReport, Notice, OutputChunk, UserInput};
use super::envelope::{AgentId, Envelope, Participant, SessionId, Target, TurnId};
use crate::core::ErrorCode;

/// 绑定到单个会话的信封工厂
#[derive(Debug, Clone)]
pub struct MessageFactory {
    session_id: SessionId,
}

impl MessageFactory {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 请求链路 ID（每次用户输入一个）
    pub fn new_trace_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn new_turn_id() -> TurnId {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn new_tx_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn envelope(&self, sender: Participant, target: Target, body: Body) -> Envelope {
        Envelope::new(self.session_id.clone(), sender, target, body)
    }

    // ---------- USER_INPUT ----------

    /// 前端 → Runtime 的用户输入，自带新的 trace_id
    pub fn user_input(&self, input: UserInput) -> Envelope {
        self.envelope(Participant::Frontend, Target::Session, Body::UserInput(input))
            .with_trace(Some(Self::new_trace_id()))
    }

    // ---------- AGENT_OUTPUT ----------

    pub fn agent_output(&self, agent_id: &str, turn_id: &str, seq: u64, text: impl Into<String>, is_final: bool) -> Envelope {
        self.envelope(
            Participant::Agent(agent_id.to_string()),
            Target::Session,
            Body::AgentOutput(OutputChunk {
                text: text.into(),
                seq,
                is_final,
            }),
        )
        .with_turn(Some(turn_id.to_string()))
    }

    // ---------- CONTROL ----------

    pub fn control(&self, sender: Participant, target: Target, control: Control) -> Envelope {
        self.envelope(sender, target, Body::Control(control))
    }

    pub fn input_ack(&self, agent_id: &str, turn_id: &str) -> Envelope {
        self.control(Participant::Agent(agent_id.to_string()), Target::Session, Control::InputAck)
            .with_turn(Some(turn_id.to_string()))
    }

    pub fn cancel_ack(&self, agent_id: &str, turn_id: Option<&str>) -> Envelope {
        self.control(Participant::Agent(agent_id.to_string()), Target::Session, Control::CancelAck)
            .with_turn(turn_id.map(str::to_string))
    }

    /// Runtime → Agent 的取消请求
    pub fn cancel(&self, agent_id: &AgentId, turn_id: &str, reason: Option<String>) -> Envelope {
        self.control(
            Participant::Runtime,
            Target::Agent(agent_id.clone()),
            Control::Cancel(CancelRequest { reason }),
        )
        .with_turn(Some(turn_id.to_string()))
    }

    // ---------- EVENT ----------

    /// Runtime → 前端 的状态通知
    pub fn notice(&self, notice: Notice) -> Envelope {
        self.envelope(Participant::Runtime, Target::Frontend, Body::Event(notice))
    }

    // ---------- ERROR ----------

    pub fn error(&self, sender: Participant, target: Target, code: ErrorCode, message: impl Into<String>) -> Envelope {
        self.envelope(
            sender,
            target,
            Body::Error(ErrorReport {
                code,
                message: message.into(),
            }),
        )
    }

    /// Runtime → 前端 的错误
    pub fn frontend_error(&self, code: ErrorCode, message: impl Into<String>) -> Envelope {
        self.error(Participant::Runtime, Target::Frontend, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventKind;

    #[test]
    fn test_factory_binds_session() {
        let factory = MessageFactory::new("s1");
        let env = factory.user_input(UserInput::text("hello"));
        assert_eq!(env.session_id, "s1");
        assert_eq!(env.target, Target::Session);
        assert!(env.trace_id.is_some());
        assert_eq!(env.event(), EventKind::UserInput);
    }

    #[test]
    fn test_agent_output_carries_turn() {
        let factory = MessageFactory::new("s1");
        let env = factory.agent_output("a", "t1", 3, "done", true);
        assert_eq!(env.turn_id.as_deref(), Some("t1"));
        assert_eq!(env.sender, Participant::Agent("a".into()));
        assert_eq!(env.subtype(), "FINAL");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(MessageFactory::new_turn_id(), MessageFactory::new_turn_id());
    }
}
