//! Agent 启动器：Runtime 接纳成员时把 Agent 的收件箱交给它
//!
//! - `LocalAgentLauncher`：按 kind 构造 Agent，在本进程内 spawn `AgentWorker`
//! - `ExternalAgentLauncher`：把收件箱转交给外部宿主（集成测试里手动扮演 Agent）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use super::echo::EchoAgent;
use super::traits::Agent;
use super::worker::AgentWorker;
use crate::core::AgentError;
use crate::message::{AgentProfile, MessageBus, Subscription};

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// 为新成员启动 Agent；`inbox` 已订阅 `Agent(agent_id)`
    async fn launch(&self, profile: AgentProfile, inbox: Subscription, bus: MessageBus) -> Result<(), AgentError>;
}

type Constructor = Box<dyn Fn(&AgentProfile) -> Arc<dyn Agent> + Send + Sync>;

/// kind → 构造函数
pub struct AgentFactory {
    constructors: HashMap<String, Constructor>,
}

impl AgentFactory {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 内置 `echo`
    pub fn with_builtin() -> Self {
        let mut factory = Self::empty();
        factory.register("echo", |profile| Arc::new(EchoAgent::new(profile.agent_id.clone())) as Arc<dyn Agent>);
        factory
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&AgentProfile) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_string(), Box::new(constructor));
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, profile: &AgentProfile) -> Result<Arc<dyn Agent>, AgentError> {
        self.constructors
            .get(&profile.kind)
            .map(|make| make(profile))
            .ok_or_else(|| AgentError::UnknownKind(profile.kind.clone()))
    }
}

impl Default for AgentFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// 本进程内启动
pub struct LocalAgentLauncher {
    factory: AgentFactory,
}

impl LocalAgentLauncher {
    pub fn new(factory: AgentFactory) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl AgentLauncher for LocalAgentLauncher {
    async fn launch(&self, profile: AgentProfile, inbox: Subscription, bus: MessageBus) -> Result<(), AgentError> {
        let agent = self.factory.build(&profile)?;
        info!(agent_id = %profile.agent_id, kind = %profile.kind, "launching local agent");
        let worker = AgentWorker::new(profile, agent, inbox, bus);
        tokio::spawn(worker.run());
        Ok(())
    }
}

/// 转交给外部宿主：收件箱通过 channel 送出
pub struct ExternalAgentLauncher {
    tx: mpsc::UnboundedSender<(AgentProfile, Subscription)>,
}

impl ExternalAgentLauncher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(AgentProfile, Subscription)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AgentLauncher for ExternalAgentLauncher {
    async fn launch(&self, profile: AgentProfile, inbox: Subscription, _bus: MessageBus) -> Result<(), AgentError> {
        let agent_id = profile.agent_id.clone();
        self.tx
            .send((profile, inbox))
            .map_err(|_| AgentError::Unavailable(agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, MessageFactory, Participant, Target, UserInput};

    #[test]
    fn test_factory_unknown_kind() {
        let factory = AgentFactory::with_builtin();
        assert_eq!(factory.kinds(), vec!["echo".to_string()]);
        let err = factory.build(&AgentProfile::new("x", "gpt")).err();
        assert!(matches!(err, Some(AgentError::UnknownKind(kind)) if kind == "gpt"));
    }

    #[tokio::test]
    async fn test_local_launcher_runs_worker() {
        let bus = MessageBus::new("s1");
        let mut runtime = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        let inbox = bus.subscribe("agent:a", Target::agent("a"), false).await.unwrap();

        let launcher = LocalAgentLauncher::new(AgentFactory::with_builtin());
        launcher
            .launch(AgentProfile::new("a", "echo"), inbox, bus.clone())
            .await
            .unwrap();

        let factory = MessageFactory::new("s1");
        let input = factory
            .envelope(Participant::Runtime, Target::agent("a"), Body::UserInput(UserInput::text("hi")))
            .with_turn(Some("t1".into()));
        bus.publish(input).await.unwrap();
        let ack = runtime.recv().await.unwrap();
        assert_eq!(ack.subtype(), "INPUT_ACK");
    }

    #[tokio::test]
    async fn test_external_launcher_unavailable_after_drop() {
        let bus = MessageBus::new("s1");
        let (launcher, rx) = ExternalAgentLauncher::channel();
        drop(rx);
        let inbox = bus.subscribe("agent:a", Target::agent("a"), false).await.unwrap();
        let err = launcher.launch(AgentProfile::new("a", "echo"), inbox, bus).await;
        assert!(matches!(err, Err(AgentError::Unavailable(_))));
    }
}
