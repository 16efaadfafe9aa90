//! 错误类型：总线 / 运行时 / Agent 侧错误，以及对前端可见的错误码
//!
//! 库内部用 thiserror 枚举向上传播；跨总线的失败统一用 `ErrorCode` 表示，
//! 以 SCREAMING_SNAKE 字符串序列化，上游（Agent / SessionManager）自带的错误码原样保留在 `Upstream` 中。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息总线错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Message bus is closed")]
    Closed,

    #[error("Session mismatch: envelope {envelope} != bus {bus}")]
    SessionMismatch { envelope: String, bus: String },

    #[error("Invalid subscription filter: {0}")]
    InvalidFilter(String),
}

/// 会话运行时错误（启动 / 接线阶段）
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Agent launch failed: {0}")]
    LaunchFailed(String),
}

/// Agent 侧错误（生成输出、构建 Agent）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Unknown agent kind: {0}")]
    UnknownKind(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Agent host unavailable: {0}")]
    Unavailable(String),
}

/// 前端可见的错误码（ERROR 信封的 subtype）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// 目标 Agent 未在 T_ack 内确认输入
    RouteTimeout,
    /// 目标 Agent 未在 T_cancel 内确认取消（已强制清理）
    CancelTimeout,
    NoActiveAgent,
    AgentNotMember,
    AddAgentFailed,
    RemoveAgentFailed,
    HandoverTimeout,
    HandoverFailed,
    /// 另一个 Agent 正在发言时收到输出
    SpeakingConflict,
    /// RUNNING 的轮次长时间无输出
    OutputTimeout,
    /// 轮次因 Agent 被移除而中止
    TurnAborted,
    TransactionConflict,
    ValidationError,
    SessionClosed,
    SessionFailed,
    InternalError,
    /// 上游自带的错误码，原样转发
    Upstream(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::RouteTimeout => "ROUTE_TIMEOUT",
            ErrorCode::CancelTimeout => "CANCEL_TIMEOUT",
            ErrorCode::NoActiveAgent => "NO_ACTIVE_AGENT",
            ErrorCode::AgentNotMember => "AGENT_NOT_MEMBER",
            ErrorCode::AddAgentFailed => "ADD_AGENT_FAILED",
            ErrorCode::RemoveAgentFailed => "REMOVE_AGENT_FAILED",
            ErrorCode::HandoverTimeout => "HANDOVER_TIMEOUT",
            ErrorCode::HandoverFailed => "HANDOVER_FAILED",
            ErrorCode::SpeakingConflict => "SPEAKING_CONFLICT",
            ErrorCode::OutputTimeout => "OUTPUT_TIMEOUT",
            ErrorCode::TurnAborted => "TURN_ABORTED",
            ErrorCode::TransactionConflict => "TRANSACTION_CONFLICT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::SessionFailed => "SESSION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Upstream(code) => code.as_str(),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "ROUTE_TIMEOUT" => ErrorCode::RouteTimeout,
            "CANCEL_TIMEOUT" => ErrorCode::CancelTimeout,
            "NO_ACTIVE_AGENT" => ErrorCode::NoActiveAgent,
            "AGENT_NOT_MEMBER" => ErrorCode::AgentNotMember,
            "ADD_AGENT_FAILED" => ErrorCode::AddAgentFailed,
            "REMOVE_AGENT_FAILED" => ErrorCode::RemoveAgentFailed,
            "HANDOVER_TIMEOUT" => ErrorCode::HandoverTimeout,
            "HANDOVER_FAILED" => ErrorCode::HandoverFailed,
            "SPEAKING_CONFLICT" => ErrorCode::SpeakingConflict,
            "OUTPUT_TIMEOUT" => ErrorCode::OutputTimeout,
            "TURN_ABORTED" => ErrorCode::TurnAborted,
            "TRANSACTION_CONFLICT" => ErrorCode::TransactionConflict,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "SESSION_CLOSED" => ErrorCode::SessionClosed,
            "SESSION_FAILED" => ErrorCode::SessionFailed,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            _ => ErrorCode::Upstream(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::RouteTimeout).unwrap();
        assert_eq!(json, "\"ROUTE_TIMEOUT\"");

        let parsed: ErrorCode = serde_json::from_str("\"CANCEL_TIMEOUT\"").unwrap();
        assert_eq!(parsed, ErrorCode::CancelTimeout);
    }

    #[test]
    fn test_upstream_code_is_preserved() {
        let parsed: ErrorCode = serde_json::from_str("\"MODEL_ERROR\"").unwrap();
        assert_eq!(parsed, ErrorCode::Upstream("MODEL_ERROR".to_string()));
        assert_eq!(parsed.to_string(), "MODEL_ERROR");
    }
}
