//! 参考 SessionManager：订阅 SYSTEM，逐条回应运行时的成员 / 生命周期请求
//!
//! 每个请求都以终态回执收场（DONE / FAILED，或 OPENED / CLOSED / FAILED），
//! 回执携带请求的 tx_id 与 trace_id，发往 SESSION。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{SessionRecord, SessionStatus, SessionStore};
use crate::config::{AgentEntry, ManagerSection};
use crate::core::BusError;
use crate::message::{
    AgentId, AgentProfile, AgentRequest, Body, Control, Envelope, Failure, MessageBus, MessageFactory, Participant,
    Subscription, Target,
};

/// Agent 目录：只能创建登记过的 Agent
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    entries: HashMap<AgentId, AgentProfile>,
}

impl AgentCatalog {
    pub fn from_entries(entries: &[AgentEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| {
                let mut profile = AgentProfile::new(e.id.clone(), e.kind.clone());
                if let Some(name) = &e.display_name {
                    profile.display_name = name.clone();
                }
                (e.id.clone(), profile)
            })
            .collect();
        Self { entries }
    }

    pub fn profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.entries.get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct SessionManagerService {
    bus: MessageBus,
    factory: MessageFactory,
    catalog: Arc<AgentCatalog>,
    store: Arc<dyn SessionStore>,
    settings: ManagerSection,
}

impl SessionManagerService {
    /// 订阅 SYSTEM 并在后台运行，直到 shutdown 或总线关闭
    pub async fn spawn(
        bus: MessageBus,
        catalog: Arc<AgentCatalog>,
        store: Arc<dyn SessionStore>,
        settings: ManagerSection,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let inbox = bus.subscribe("session_manager", Target::System, false).await?;
        let service = Self {
            factory: MessageFactory::new(bus.session_id()),
            bus,
            catalog,
            store,
            settings,
        };
        Ok(tokio::spawn(service.run(inbox, shutdown)))
    }

    async fn run(self, mut inbox: Subscription, shutdown: CancellationToken) {
        debug!(session_id = %self.factory.session_id(), "session manager started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                env = inbox.recv() => match env {
                    Some(env) => self.handle(env).await,
                    None => break,
                },
            }
        }
        self.bus.unsubscribe(inbox.handle).await;
        debug!(session_id = %self.factory.session_id(), "session manager stopped");
    }

    async fn handle(&self, env: Envelope) {
        let Body::Control(control) = &env.body else {
            return;
        };
        // SWITCH_AGENT 是广播，顺带记录活跃 Agent
        if let Control::SwitchAgent { to, .. } = control {
            if env.sender == Participant::Runtime {
                self.store.set_active(&env.session_id, to.clone()).await;
            }
            return;
        }
        if env.sender != Participant::Runtime {
            warn!("{} from {} ignored by session manager", control.subtype(), env.sender);
            return;
        }

        let reply = match control {
            Control::RequestAddAgent(req) => self.add_agent(&env.session_id, req).await,
            Control::RequestRemoveAgent(req) => self.remove_agent(&env.session_id, req).await,
            Control::RequestSessionOpen { agents } => self.open_session(&env.session_id, agents).await,
            Control::RequestSessionClose { reason } => {
                info!(session_id = %env.session_id, "closing session: {:?}", reason);
                self.store.set_status(&env.session_id, SessionStatus::Closed).await;
                Control::SessionClosed
            }
            other => {
                debug!("{} ignored by session manager", other.subtype());
                return;
            }
        };

        let out = self
            .factory
            .control(Participant::SessionManager, Target::Session, reply)
            .with_tx(env.tx_id.clone())
            .with_trace(env.trace_id.clone());
        if let Err(e) = self.bus.publish(out).await {
            warn!("session manager reply failed: {}", e);
        }
    }

    async fn add_agent(&self, session_id: &str, req: &AgentRequest) -> Control {
        let failed = |reason: String| {
            Control::AddAgentFailed(Failure {
                agent_id: Some(req.agent_id.clone()),
                reason,
            })
        };
        let Some(profile) = self.catalog.profile(&req.agent_id) else {
            return failed(format!("unknown agent {}", req.agent_id));
        };
        let record = self.store.load(session_id).await;
        if let Some(record) = &record {
            if record.members.len() >= self.settings.max_agents_per_session {
                return failed(format!(
                    "session is full ({} agents)",
                    self.settings.max_agents_per_session
                ));
            }
        }
        if !self.store.add_member(session_id, profile.clone()).await {
            return failed(format!("{} is already a member", req.agent_id));
        }
        info!(session_id, agent_id = %req.agent_id, "agent added");
        Control::AddAgentDone { profile }
    }

    async fn remove_agent(&self, session_id: &str, req: &AgentRequest) -> Control {
        if !self.store.remove_member(session_id, &req.agent_id).await {
            return Control::RemoveAgentFailed(Failure {
                agent_id: Some(req.agent_id.clone()),
                reason: format!("{} is not a member", req.agent_id),
            });
        }
        info!(session_id, agent_id = %req.agent_id, "agent removed");
        Control::RemoveAgentDone {
            agent_id: req.agent_id.clone(),
        }
    }

    /// 请求里点名的 Agent 优先；否则恢复已存的成员；都没有就用 default_agents
    async fn open_session(&self, session_id: &str, requested: &[AgentId]) -> Control {
        let stored = self.store.load(session_id).await;
        let (ids, active): (Vec<AgentId>, Option<AgentId>) = if !requested.is_empty() {
            (requested.to_vec(), None)
        } else if let Some(record) = stored.filter(|r| !r.members.is_empty()) {
            debug!(session_id, "restoring {} members", record.members.len());
            (
                record.members.iter().map(|m| m.agent_id.clone()).collect(),
                record.active_agent_id,
            )
        } else {
            (self.settings.default_agents.clone(), None)
        };

        let mut members: Vec<AgentProfile> = Vec::new();
        for id in &ids {
            match self.catalog.profile(id) {
                Some(profile) if !members.iter().any(|m| m.agent_id == *id) => members.push(profile),
                Some(_) => {}
                None => {
                    return Control::SessionFailed(Failure {
                        agent_id: Some(id.clone()),
                        reason: format!("unknown agent {}", id),
                    })
                }
            }
        }
        if members.len() > self.settings.max_agents_per_session {
            return Control::SessionFailed(Failure {
                agent_id: None,
                reason: format!("too many agents ({})", members.len()),
            });
        }

        let active = active.filter(|a| members.iter().any(|m| m.agent_id == *a));
        let mut record = SessionRecord::new(session_id);
        record.members = members.clone();
        record.active_agent_id = active.clone();
        self.store.save(record).await;
        info!(session_id, members = members.len(), "session opened");

        Control::SessionOpened {
            agents: members,
            active_agent_id: active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemorySessionStore;
    use std::time::Duration;

    fn catalog() -> Arc<AgentCatalog> {
        Arc::new(AgentCatalog::from_entries(&[
            AgentEntry {
                id: "writer".into(),
                kind: "echo".into(),
                display_name: Some("Writer".into()),
            },
            AgentEntry {
                id: "critic".into(),
                kind: "echo".into(),
                display_name: None,
            },
        ]))
    }

    async fn setup(max: usize) -> (MessageBus, Subscription, MessageFactory, Arc<MemorySessionStore>) {
        let bus = MessageBus::new("s1");
        let session = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        let store = Arc::new(MemorySessionStore::new());
        let settings = ManagerSection {
            max_agents_per_session: max,
            default_agents: vec!["writer".into()],
        };
        SessionManagerService::spawn(bus.clone(), catalog(), store.clone(), settings, CancellationToken::new())
            .await
            .unwrap();
        (bus, session, MessageFactory::new("s1"), store)
    }

    async fn request(bus: &MessageBus, session: &mut Subscription, factory: &MessageFactory, control: Control) -> Envelope {
        let env = factory
            .control(Participant::Runtime, Target::System, control)
            .with_tx(Some("tx-1".into()))
            .with_trace(Some("trace-1".into()));
        bus.publish(env).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), session.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn add(id: &str) -> Control {
        Control::RequestAddAgent(AgentRequest {
            agent_id: id.into(),
            reason: None,
        })
    }

    #[tokio::test]
    async fn test_open_uses_default_agents_and_keeps_correlation() {
        let (bus, mut session, factory, _store) = setup(8).await;
        let reply = request(&bus, &mut session, &factory, Control::RequestSessionOpen { agents: vec![] }).await;
        assert_eq!(reply.sender, Participant::SessionManager);
        assert_eq!(reply.tx_id.as_deref(), Some("tx-1"));
        assert_eq!(reply.trace_id.as_deref(), Some("trace-1"));
        match reply.body {
            Body::Control(Control::SessionOpened { agents, .. }) => {
                assert_eq!(agents.len(), 1);
                assert_eq!(agents[0].display_name, "Writer");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_duplicate_and_full() {
        let (bus, mut session, factory, _store) = setup(2).await;
        request(&bus, &mut session, &factory, Control::RequestSessionOpen { agents: vec![] }).await;

        let unknown = request(&bus, &mut session, &factory, add("ghost")).await;
        assert_eq!(unknown.subtype(), "ADD_AGENT_FAILED");

        let dup = request(&bus, &mut session, &factory, add("writer")).await;
        assert_eq!(dup.subtype(), "ADD_AGENT_FAILED");

        let ok = request(&bus, &mut session, &factory, add("critic")).await;
        assert_eq!(ok.subtype(), "ADD_AGENT_DONE");

        let remove = Control::RequestRemoveAgent(AgentRequest {
            agent_id: "critic".into(),
            reason: None,
        });
        assert_eq!(request(&bus, &mut session, &factory, remove.clone()).await.subtype(), "REMOVE_AGENT_DONE");
        assert_eq!(request(&bus, &mut session, &factory, remove).await.subtype(), "REMOVE_AGENT_FAILED");
    }

    #[tokio::test]
    async fn test_full_session_rejects_add() {
        let (bus, mut session, factory, _store) = setup(1).await;
        request(&bus, &mut session, &factory, Control::RequestSessionOpen { agents: vec![] }).await;
        let full = request(&bus, &mut session, &factory, add("critic")).await;
        match full.body {
            Body::Control(Control::AddAgentFailed(Failure { reason, .. })) => assert!(reason.contains("full")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reopen_restores_members_and_active() {
        let (bus, mut session, factory, store) = setup(8).await;
        request(&bus, &mut session, &factory, Control::RequestSessionOpen { agents: vec![] }).await;
        request(&bus, &mut session, &factory, add("critic")).await;
        store.set_active("s1", Some("critic".into())).await;
        request(&bus, &mut session, &factory, Control::RequestSessionClose { reason: None }).await;
        assert_eq!(store.open_count().await, 0);

        let reply = request(&bus, &mut session, &factory, Control::RequestSessionOpen { agents: vec![] }).await;
        match reply.body {
            Body::Control(Control::SessionOpened { agents, active_agent_id }) => {
                assert_eq!(agents.len(), 2);
                assert_eq!(active_agent_id.as_deref(), Some("critic"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
