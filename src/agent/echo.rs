//! EchoAgent：逐词回显输入（无需任何后端，用于演示与测试）
//!
//! 每个词之间间隔 `delay`，便于在演示中观察流式输出与取消。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use super::traits::{Agent, AgentInput, OutputStream};
use crate::core::AgentError;
use crate::message::AgentId;

#[derive(Debug, Clone)]
pub struct EchoAgent {
    agent_id: AgentId,
    delay: Duration,
}

impl EchoAgent {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            delay: Duration::from_millis(30),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn compose(&self, input: &AgentInput) -> String {
        let mut reply = format!("[{}] {}", self.agent_id, input.text.trim());
        if let Some(note) = &input.handover {
            reply = format!("[{}] (from {}) {}", self.agent_id, note.from_agent, input.text.trim());
        }
        reply
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn respond(&self, input: AgentInput) -> Result<OutputStream, AgentError> {
        let reply = self.compose(&input);
        // 保留词间空格，拼接后与原文一致
        let words: Vec<String> = reply.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.delay;

        let out = stream::unfold(words.into_iter(), move |mut words| async move {
            let word = words.next()?;
            tokio::time::sleep(delay).await;
            Some((Ok::<_, AgentError>(word), words))
        });
        Ok(Box::pin(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::traits::HandoverNote;
    use futures_util::StreamExt;

    fn input(text: &str) -> AgentInput {
        AgentInput {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            text: text.into(),
            selection: None,
            handover: None,
        }
    }

    #[tokio::test]
    async fn test_echo_streams_words() {
        let agent = EchoAgent::new("assistant").with_delay(Duration::from_millis(1));
        let pieces: Vec<String> = agent
            .respond(input("hello there"))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.concat(), "[assistant] hello there");
    }

    #[tokio::test]
    async fn test_echo_mentions_handover_source() {
        let agent = EchoAgent::new("critic").with_delay(Duration::ZERO);
        let mut req = input("go on");
        req.handover = Some(HandoverNote {
            from_agent: "writer".into(),
            ..Default::default()
        });
        let pieces: Vec<String> = agent.respond(req).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert_eq!(pieces.concat(), "[critic] (from writer) go on");
    }
}
