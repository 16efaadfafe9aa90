//! 消息体：按 (event, subtype) 打标签的联合类型
//!
//! 每个变体都有结构化的 payload，处理器在边界处直接拿到强类型数据，不再手工解析字典。

use serde::{Deserialize, Serialize};

use super::envelope::{AgentId, EventKind};
use crate::core::ErrorCode;

/// 消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    /// 用户输入（文本或结构化选择）
    UserInput(UserInput),
    /// Agent 流式输出
    AgentOutput(OutputChunk),
    /// 控制消息
    Control(Control),
    /// 状态通知（Runtime → 前端）
    Event(Notice),
    /// 失败报告
    Error(ErrorReport),
}

impl Body {
    pub fn event(&self) -> EventKind {
        match self {
            Body::UserInput(_) => EventKind::UserInput,
            Body::AgentOutput(_) => EventKind::AgentOutput,
            Body::Control(_) => EventKind::Control,
            Body::Event(_) => EventKind::Event,
            Body::Error(_) => EventKind::Error,
        }
    }

    pub fn subtype(&self) -> &str {
        match self {
            Body::UserInput(input) => {
                if input.selection.is_some() {
                    "SELECTION"
                } else {
                    "TEXT"
                }
            }
            Body::AgentOutput(chunk) => {
                if chunk.is_final {
                    "FINAL"
                } else {
                    "CHUNK"
                }
            }
            Body::Control(control) => control.subtype(),
            Body::Event(notice) => notice.subtype(),
            Body::Error(report) => report.code.as_str(),
        }
    }
}

/// 用户输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    /// 前端显式选择的 Agent（优先于文本中的 @提及）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentioned_agent_id: Option<AgentId>,
    /// 结构化选择（例如选项卡片），原样透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<serde_json::Value>,
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mentioned_agent_id: None,
            selection: None,
        }
    }
}

/// 输出分片；每轮恰好一个 is_final
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub text: String,
    pub seq: u64,
    pub is_final: bool,
}

/// Agent 描述（SessionManager 回执中携带）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub kind: String,
    #[serde(default)]
    pub display_name: String,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<AgentId>, kind: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            display_name: agent_id.clone(),
            agent_id,
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 成员变更请求（add / remove）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 失败回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub reason: String,
}

/// CONTROL 子类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Control {
    InputAck,
    Cancel(CancelRequest),
    CancelAck,
    /// 活跃 Agent 变更；前端发送时表示用户选择
    SwitchAgent {
        #[serde(default)]
        from: Option<AgentId>,
        #[serde(default)]
        to: Option<AgentId>,
        #[serde(default)]
        reason: Option<String>,
    },

    RequestAddAgent(AgentRequest),
    AddAgentDone { profile: AgentProfile },
    AddAgentFailed(Failure),
    RequestRemoveAgent(AgentRequest),
    RemoveAgentDone { agent_id: AgentId },
    RemoveAgentFailed(Failure),

    HandoverRequest {
        to_agent: AgentId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        context_ref: Option<String>,
    },
    HandoverUiPrompt {
        from_agent: AgentId,
        to_agent: AgentId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    /// to_agent 为空时沿用请求中的目标
    HandoverConfirm {
        #[serde(default)]
        to_agent: Option<AgentId>,
    },
    HandoverReject {
        #[serde(default)]
        reason: Option<String>,
    },
    HandoverContext {
        from_agent: AgentId,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        context_ref: Option<String>,
        #[serde(default)]
        prev_output: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },

    RequestSessionOpen {
        #[serde(default)]
        agents: Vec<AgentId>,
    },
    SessionOpened {
        agents: Vec<AgentProfile>,
        #[serde(default)]
        active_agent_id: Option<AgentId>,
    },
    RequestSessionClose {
        #[serde(default)]
        reason: Option<String>,
    },
    SessionClosed,
    SessionFailed(Failure),
}

impl Control {
    pub fn subtype(&self) -> &'static str {
        match self {
            Control::InputAck => "INPUT_ACK",
            Control::Cancel(_) => "CANCEL",
            Control::CancelAck => "CANCEL_ACK",
            Control::SwitchAgent { .. } => "SWITCH_AGENT",
            Control::RequestAddAgent(_) => "REQUEST_ADD_AGENT",
            Control::AddAgentDone { .. } => "ADD_AGENT_DONE",
            Control::AddAgentFailed(_) => "ADD_AGENT_FAILED",
            Control::RequestRemoveAgent(_) => "REQUEST_REMOVE_AGENT",
            Control::RemoveAgentDone { .. } => "REMOVE_AGENT_DONE",
            Control::RemoveAgentFailed(_) => "REMOVE_AGENT_FAILED",
            Control::HandoverRequest { .. } => "HANDOVER_REQUEST",
            Control::HandoverUiPrompt { .. } => "HANDOVER_UI_PROMPT",
            Control::HandoverConfirm { .. } => "HANDOVER_CONFIRM",
            Control::HandoverReject { .. } => "HANDOVER_REJECT",
            Control::HandoverContext { .. } => "HANDOVER_CONTEXT",
            Control::RequestSessionOpen { .. } => "REQUEST_SESSION_OPEN",
            Control::SessionOpened { .. } => "SESSION_OPENED",
            Control::RequestSessionClose { .. } => "REQUEST_SESSION_CLOSE",
            Control::SessionClosed => "SESSION_CLOSED",
            Control::SessionFailed(_) => "SESSION_FAILED",
        }
    }

    /// SessionManager 的终态回执
    pub fn is_manager_reply(&self) -> bool {
        matches!(
            self,
            Control::AddAgentDone { .. }
                | Control::AddAgentFailed(_)
                | Control::RemoveAgentDone { .. }
                | Control::RemoveAgentFailed(_)
                | Control::SessionOpened { .. }
                | Control::SessionClosed
                | Control::SessionFailed(_)
        )
    }
}

/// EVENT 子类型：Runtime 发给前端的状态通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subtype", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    TurnAccepted { target_agent_id: AgentId },
    AgentStarted { agent_id: AgentId },
    /// forced=true 表示取消确认超时后的强制清理
    TurnCanceled { agent_id: AgentId, forced: bool },
    AgentAdded { profile: AgentProfile },
    AgentRemoved { agent_id: AgentId },
    ActiveAgentChanged {
        from: Option<AgentId>,
        to: Option<AgentId>,
    },
    /// 取消时没有正在发言的 Agent
    NoSpeakingAgent,
}

impl Notice {
    pub fn subtype(&self) -> &'static str {
        match self {
            Notice::TurnAccepted { .. } => "TURN_ACCEPTED",
            Notice::AgentStarted { .. } => "AGENT_STARTED",
            Notice::TurnCanceled { .. } => "TURN_CANCELED",
            Notice::AgentAdded { .. } => "AGENT_ADDED",
            Notice::AgentRemoved { .. } => "AGENT_REMOVED",
            Notice::ActiveAgentChanged { .. } => "ACTIVE_AGENT_CHANGED",
            Notice::NoSpeakingAgent => "NO_SPEAKING_AGENT",
        }
    }
}

/// ERROR 负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_names() {
        let chunk = Body::AgentOutput(OutputChunk {
            text: "hi".into(),
            seq: 0,
            is_final: false,
        });
        assert_eq!(chunk.event(), EventKind::AgentOutput);
        assert_eq!(chunk.subtype(), "CHUNK");

        let cancel = Body::Control(Control::Cancel(CancelRequest { reason: None }));
        assert_eq!(cancel.subtype(), "CANCEL");

        let err = Body::Error(ErrorReport {
            code: ErrorCode::RouteTimeout,
            message: "no ack".into(),
        });
        assert_eq!(err.subtype(), "ROUTE_TIMEOUT");
    }

    #[test]
    fn test_control_wire_format() {
        let body = Body::Control(Control::HandoverConfirm {
            to_agent: Some("b".into()),
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["event"], "CONTROL");
        assert_eq!(value["data"]["subtype"], "HANDOVER_CONFIRM");
        assert_eq!(value["data"]["payload"]["to_agent"], "b");
    }

    #[test]
    fn test_manager_reply_classification() {
        assert!(Control::SessionClosed.is_manager_reply());
        assert!(Control::RemoveAgentDone { agent_id: "a".into() }.is_manager_reply());
        assert!(!Control::CancelAck.is_manager_reply());
    }
}
