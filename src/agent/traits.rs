//! Agent 能力抽象
//!
//! Agent 只负责「把一次输入变成一段文本流」，形状与流式 LLM 客户端一致；
//! 总线协议（ACK、分片、取消）由 `AgentWorker` 统一实现。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::core::AgentError;
use crate::message::{AgentId, SessionId, TurnId};

/// 输出文本流
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// 交接时从上一个 Agent 带过来的上下文
#[derive(Debug, Clone, Default)]
pub struct HandoverNote {
    pub from_agent: AgentId,
    pub summary: Option<String>,
    pub context_ref: Option<String>,
    pub prev_output: Option<String>,
    pub reason: Option<String>,
}

/// 一次输入
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub text: String,
    pub selection: Option<serde_json::Value>,
    /// 交接后的第一条输入会带上
    pub handover: Option<HandoverNote>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// 实现类型（对应配置中的 kind）
    fn kind(&self) -> &str;

    /// 生成流式回复
    async fn respond(&self, input: AgentInput) -> Result<OutputStream, AgentError>;
}
