//! SessionHub：多会话注册表
//!
//! 每个会话一套独立的总线 + SessionManager + 运行时 + 观察者，会话之间只共享存储与启动器。
//! `open` 只负责接线；会话何时 OPEN 由前端发 REQUEST_SESSION_OPEN 决定。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::{SessionPhase, SessionSnapshot};
use super::runtime::{SessionRuntime, SessionRuntimeHandle};
use crate::agent::{AgentFactory, AgentLauncher, LocalAgentLauncher};
use crate::config::{AppConfig, ManagerSection, ObservabilitySection, RuntimeConfig};
use crate::core::RuntimeError;
use crate::frontend::FrontendPort;
use crate::manager::{AgentCatalog, MemorySessionStore, SessionManagerService, SessionStore};
use crate::message::{MessageBus, SessionId};
use crate::observability::{EnvelopeLogger, Transcript, TranscriptRecorder};

/// 一个已接线的会话
pub struct Session {
    session_id: SessionId,
    bus: MessageBus,
    runtime: SessionRuntimeHandle,
    transcript: TranscriptRecorder,
    manager: JoinHandle<()>,
    token: CancellationToken,
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn runtime(&self) -> &SessionRuntimeHandle {
        &self.runtime
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.runtime.snapshot()
    }

    /// 新开一个前端端口
    pub async fn frontend(&self) -> Result<FrontendPort, RuntimeError> {
        Ok(FrontendPort::attach(&self.bus).await?)
    }

    pub async fn transcript(&self) -> Transcript {
        self.transcript.transcript().await
    }

    pub fn is_finished(&self) -> bool {
        self.runtime.is_finished()
    }

    /// 停止运行时与各协作者，然后关闭总线
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.runtime.wait_for(|s| s.phase == SessionPhase::Closed).await;
        self.bus.close().await;
        if !self.manager.is_finished() {
            self.manager.abort();
        }
        info!(session_id = %self.session_id, "session torn down");
    }
}

pub struct SessionHub {
    runtime: RuntimeConfig,
    manager: ManagerSection,
    observability: ObservabilitySection,
    catalog: Arc<AgentCatalog>,
    store: Arc<dyn SessionStore>,
    launcher: Arc<dyn AgentLauncher>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    shutdown: CancellationToken,
}

impl SessionHub {
    pub fn new(config: &AppConfig, launcher: Arc<dyn AgentLauncher>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            runtime: RuntimeConfig::from(&config.session),
            manager: config.manager.clone(),
            observability: config.observability.clone(),
            catalog: Arc::new(AgentCatalog::from_entries(&config.agents)),
            store,
            launcher,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 本进程 Agent + 内存存储
    pub fn from_config(config: &AppConfig) -> Self {
        let launcher = Arc::new(LocalAgentLauncher::new(AgentFactory::with_builtin()));
        Self::new(config, launcher, Arc::new(MemorySessionStore::new()))
    }

    /// 所有会话的取消都挂在这个 token 下
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn open(&self, session_id: &str) -> Result<Arc<Session>, RuntimeError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            if !existing.is_finished() {
                return Err(RuntimeError::SessionExists(session_id.to_string()));
            }
            existing.shutdown().await;
        }

        let token = self.shutdown.child_token();
        let bus = MessageBus::new(session_id);

        if self.observability.log_envelopes {
            EnvelopeLogger::spawn(&bus, token.clone()).await?;
        }
        let transcript = TranscriptRecorder::spawn(&bus, self.observability.transcript_turns, token.clone()).await?;
        let manager = SessionManagerService::spawn(
            bus.clone(),
            self.catalog.clone(),
            self.store.clone(),
            self.manager.clone(),
            token.clone(),
        )
        .await?;
        let runtime = SessionRuntime::spawn(bus.clone(), self.runtime.clone(), self.launcher.clone(), token.clone()).await?;

        let session = Arc::new(Session {
            session_id: session_id.to_string(),
            bus,
            runtime,
            transcript,
            manager,
            token,
        });
        sessions.insert(session_id.to_string(), session.clone());
        info!(session_id, "session wired");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// 强制拆除会话（不经过 SessionManager）
    pub async fn close(&self, session_id: &str) -> Result<(), RuntimeError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.to_string()))?;
        session.shutdown().await;
        Ok(())
    }

    /// 清理运行时已退出的会话（如 SESSION_CLOSED 之后），返回清理数
    pub async fn reap(&self) -> usize {
        let finished: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &finished {
            session.shutdown().await;
        }
        finished.len()
    }

    /// 拆除全部会话
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            warn!("tearing down {} open sessions", sessions.len());
        }
        for session in sessions {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.observability.log_envelopes = false;
        config
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_and_close_removes() {
        let hub = SessionHub::from_config(&config());
        let session = hub.open("s1").await.unwrap();
        assert_eq!(session.snapshot().session_id, "s1");
        assert!(matches!(hub.open("s1").await, Err(RuntimeError::SessionExists(_))));

        hub.open("s2").await.unwrap();
        assert_eq!(hub.session_ids().await, vec!["s1".to_string(), "s2".to_string()]);

        hub.close("s1").await.unwrap();
        assert!(hub.get("s1").await.is_none());
        assert!(session.bus().is_closed().await);
        assert!(matches!(hub.close("s1").await, Err(RuntimeError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_reap_collects_stopped_sessions() {
        let hub = SessionHub::from_config(&config());
        let session = hub.open("s1").await.unwrap();
        session.runtime().shutdown();
        tokio::time::timeout(Duration::from_secs(1), session.runtime().wait_for(|s| s.phase == SessionPhase::Closed))
            .await
            .unwrap();
        // 快照先于任务真正结束，稍等
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hub.reap().await, 1);
        assert!(hub.is_empty().await);
    }
}
