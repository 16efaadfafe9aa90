//! 会话运行时：单会话的编排 actor
//!
//! 一个后台任务独占 SessionContext / 在途轮次 / 事务表，按 (event, subtype) 逐条处理 SESSION 收件箱。
//! 所有等待（INPUT_ACK、CANCEL_ACK、SessionManager 回执、交接决定）都是带截止时间的状态，
//! 由主循环里的计时分支统一到期处理，等待期间其它消息照常处理。
//! 每处理完一步，把只读快照投影到 watch 通道。

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{SessionContext, SessionPhase, SessionSnapshot};
use super::mention;
use super::transaction::{DeferredInput, TransactionTable};
use super::turn::{InflightTurn, TurnExpiry, TurnStatus, TurnTable};
use crate::agent::AgentLauncher;
use crate::config::{DefaultAgentPolicy, RuntimeConfig, UnknownMentionPolicy};
use crate::core::{ErrorCode, RuntimeError};
use crate::message::{
    AgentId, AgentProfile, Body, CancelRequest, Control, Envelope, ErrorReport, MessageBus, MessageFactory, Notice,
    OutputChunk, Participant, SessionId, Subscription, SubscriptionHandle, Target, TurnId, UserInput,
};

/// 快照里保留的近期终态轮次数
const SNAPSHOT_RECENT_TURNS: usize = 64;

/// 在途的取消协议
#[derive(Debug, Clone)]
pub(super) struct PendingCancel {
    pub turn_id: TurnId,
    pub agent_id: AgentId,
    pub deadline: Instant,
}

/// 会话运行时（由 `spawn` 移入后台任务）
pub struct SessionRuntime {
    pub(super) config: RuntimeConfig,
    pub(super) bus: MessageBus,
    pub(super) factory: MessageFactory,
    pub(super) ctx: SessionContext,
    pub(super) turns: TurnTable,
    pub(super) txs: TransactionTable,
    pub(super) pending_cancel: Option<PendingCancel>,
    /// 每个成员 Agent 的总线订阅（代其订阅，交给 launcher）
    pub(super) agent_subs: HashMap<AgentId, SubscriptionHandle>,
    pub(super) launcher: Arc<dyn AgentLauncher>,
    /// 每个 Agent 最近一次完整输出（交接时作为 prev_output）
    pub(super) last_outputs: HashMap<AgentId, String>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    pub(super) stopped: bool,
}

/// 运行时句柄：读快照、等待状态、停止
pub struct SessionRuntimeHandle {
    session_id: SessionId,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl SessionRuntimeHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// 等待快照满足条件；运行时已退出时返回最后一份快照
    pub async fn wait_for(&self, mut pred: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.snapshot_rx.clone();
        if let Ok(snapshot) = rx.wait_for(|s| pred(s)).await {
            return snapshot.clone();
        }
        let last = rx.borrow().clone();
        last
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待后台任务结束
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(session_id = %self.session_id, "session runtime task failed: {}", e);
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => pending::<()>().await,
    }
}

impl SessionRuntime {
    /// 订阅 SESSION 收件箱并启动 actor
    pub async fn spawn(
        bus: MessageBus,
        config: RuntimeConfig,
        launcher: Arc<dyn AgentLauncher>,
        shutdown: CancellationToken,
    ) -> Result<SessionRuntimeHandle, RuntimeError> {
        let session_id = bus.session_id().to_string();
        let inbox = bus.subscribe("session_runtime", Target::Session, false).await?;
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::empty(session_id.clone()));

        let runtime = SessionRuntime {
            turns: TurnTable::new(config.max_turn_history),
            config,
            factory: MessageFactory::new(session_id.clone()),
            ctx: SessionContext::new(session_id.clone()),
            bus,
            txs: TransactionTable::new(),
            pending_cancel: None,
            agent_subs: HashMap::new(),
            launcher,
            last_outputs: HashMap::new(),
            snapshot_tx,
            stopped: false,
        };

        let token = shutdown.clone();
        let join = tokio::spawn(runtime.run(inbox, token));
        Ok(SessionRuntimeHandle {
            session_id,
            snapshot_rx,
            shutdown,
            join,
        })
    }

    async fn run(mut self, mut inbox: Subscription, shutdown: CancellationToken) {
        info!(session_id = %self.ctx.session_id, "session runtime started");
        self.publish_snapshot();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(session_id = %self.ctx.session_id, "session runtime shutting down");
                    break;
                }
                _ = wait_deadline(deadline) => {
                    self.on_timer(Instant::now()).await;
                }
                env = inbox.recv() => match env {
                    Some(env) => self.dispatch(env).await,
                    None => {
                        debug!(session_id = %self.ctx.session_id, "session inbox closed");
                        break;
                    }
                },
            }
            self.publish_snapshot();
            if self.stopped {
                break;
            }
        }

        self.bus.unsubscribe(inbox.handle).await;
        self.detach_all().await;
        self.ctx.phase = SessionPhase::Closed;
        self.publish_snapshot();
        info!(session_id = %self.ctx.session_id, "session runtime stopped");
    }

    fn publish_snapshot(&self) {
        let snapshot = self
            .ctx
            .project(self.turns.statuses(SNAPSHOT_RECENT_TURNS), self.txs.describe());
        self.snapshot_tx.send_replace(snapshot);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.turns.next_deadline(),
            self.txs.next_deadline(),
            self.pending_cancel.as_ref().map(|c| c.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // =========================================================
    // 分发
    // =========================================================

    async fn dispatch(&mut self, env: Envelope) {
        // 自己发出的广播（SWITCH_AGENT）也会回到收件箱
        if env.sender == Participant::Runtime {
            return;
        }
        debug!(session_id = %self.ctx.session_id, "dispatch {}", env);

        match &env.body {
            Body::UserInput(input) => {
                if env.sender == Participant::Frontend {
                    self.on_user_input(&env, input).await;
                } else {
                    warn!("USER_INPUT from {} dropped", env.sender);
                }
            }
            Body::AgentOutput(chunk) => match env.sender.agent_id() {
                Some(agent_id) => {
                    let agent_id = agent_id.to_string();
                    self.on_agent_output(&env, &agent_id, chunk).await;
                }
                None => warn!("AGENT_OUTPUT from {} dropped", env.sender),
            },
            Body::Control(control) => self.on_control(&env, control).await,
            Body::Error(report) => self.on_error(&env, report).await,
            Body::Event(_) => debug!("EVENT {} ignored by runtime", env.subtype()),
        }
    }

    async fn on_control(&mut self, env: &Envelope, control: &Control) {
        match (&env.sender, control) {
            (Participant::Agent(agent_id), Control::InputAck) => {
                let agent_id = agent_id.clone();
                self.on_input_ack(env, &agent_id).await;
            }
            (Participant::Agent(agent_id), Control::CancelAck) => {
                let agent_id = agent_id.clone();
                self.on_cancel_ack(env, &agent_id).await;
            }
            (
                Participant::Agent(agent_id),
                Control::HandoverRequest {
                    to_agent,
                    reason,
                    summary,
                    context_ref,
                },
            ) => {
                let from_agent = agent_id.clone();
                self.begin_handover(
                    env,
                    from_agent,
                    to_agent.clone(),
                    summary.clone(),
                    context_ref.clone(),
                    reason.clone(),
                )
                .await;
            }

            (Participant::Frontend, Control::Cancel(CancelRequest { reason })) => {
                self.on_cancel_request(env, reason.clone()).await;
            }
            (Participant::Frontend, Control::SwitchAgent { to, .. }) => {
                self.on_switch_request(env, to.clone()).await;
            }
            (Participant::Frontend, Control::RequestAddAgent(req)) => {
                self.begin_add(req.agent_id.clone(), req.reason.clone(), env.trace_id.clone(), None)
                    .await;
            }
            (Participant::Frontend, Control::RequestRemoveAgent(req)) => {
                self.begin_remove(req.agent_id.clone(), req.reason.clone(), env.trace_id.clone())
                    .await;
            }
            (Participant::Frontend, Control::HandoverConfirm { to_agent }) => {
                self.on_handover_decision(env, Some(to_agent.clone())).await;
            }
            (Participant::Frontend, Control::HandoverReject { .. }) => {
                self.on_handover_decision(env, None).await;
            }
            (Participant::Frontend, Control::RequestSessionOpen { agents }) => {
                self.begin_open(agents.clone(), env.trace_id.clone()).await;
            }
            (Participant::Frontend, Control::RequestSessionClose { reason }) => {
                self.begin_close(reason.clone(), env.trace_id.clone()).await;
            }

            (Participant::SessionManager, reply) if reply.is_manager_reply() => {
                self.on_manager_reply(env, reply).await;
            }

            (sender, control) => {
                warn!(
                    session_id = %self.ctx.session_id,
                    "unexpected CONTROL {} from {}, dropped",
                    control.subtype(),
                    sender
                );
            }
        }
    }

    // =========================================================
    // 发布辅助
    // =========================================================

    pub(super) async fn publish(&self, env: Envelope) {
        let desc = env.to_string();
        if let Err(e) = self.bus.publish(env).await {
            warn!(session_id = %self.ctx.session_id, "publish {} failed: {}", desc, e);
        }
    }

    /// 状态通知 → 前端
    pub(super) async fn notify(&self, notice: Notice, turn_id: Option<TurnId>, trace_id: Option<String>) {
        let env = self.factory.notice(notice).with_turn(turn_id).with_trace(trace_id);
        self.publish(env).await;
    }

    /// 错误 → 前端
    pub(super) async fn report(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        turn_id: Option<TurnId>,
        trace_id: Option<String>,
    ) {
        let message = message.into();
        warn!(session_id = %self.ctx.session_id, code = %code, "{}", message);
        let env = self
            .factory
            .frontend_error(code, message)
            .with_turn(turn_id)
            .with_trace(trace_id);
        self.publish(env).await;
    }

    /// 原样转发给前端
    pub(super) async fn relay_to_frontend(&self, env: &Envelope) {
        self.publish(env.retarget(Target::Frontend)).await;
    }

    /// 切换活跃 Agent；无变化时什么也不发（状态迁移守卫）
    pub(super) async fn switch_active(
        &mut self,
        to: Option<AgentId>,
        reason: &str,
        turn_id: Option<TurnId>,
        trace_id: Option<String>,
    ) -> bool {
        let from = self.ctx.active_agent_id().cloned();
        if !self.ctx.set_active(to.clone()) {
            return false;
        }
        info!(
            session_id = %self.ctx.session_id,
            "active agent {:?} -> {:?} ({})",
            from,
            to,
            reason
        );

        let switch = self
            .factory
            .control(
                Participant::Runtime,
                Target::Broadcast,
                Control::SwitchAgent {
                    from: from.clone(),
                    to: to.clone(),
                    reason: Some(reason.to_string()),
                },
            )
            .with_turn(turn_id.clone())
            .with_trace(trace_id.clone());
        self.publish(switch).await;
        self.notify(Notice::ActiveAgentChanged { from, to }, turn_id, trace_id).await;
        true
    }

    // =========================================================
    // USER_INPUT：标准轮次 / 显式提及
    // =========================================================

    async fn on_user_input(&mut self, env: &Envelope, input: &UserInput) {
        let turn_id = env.turn_id.clone().unwrap_or_else(MessageFactory::new_turn_id);
        let trace_id = env.trace_id.clone().or_else(|| Some(MessageFactory::new_trace_id()));

        if !self.ctx.phase.accepts_input() {
            self.report(ErrorCode::SessionClosed, "session is closing", Some(turn_id), trace_id)
                .await;
            return;
        }
        if self.turns.status(&turn_id).is_some() {
            self.report(
                ErrorCode::ValidationError,
                format!("turn {} already exists", turn_id),
                Some(turn_id),
                trace_id,
            )
            .await;
            return;
        }

        let (target, text) = match mention::extract(input) {
            Some(m) if self.ctx.is_member(&m.agent_id) => {
                self.switch_active(
                    Some(m.agent_id.clone()),
                    "mention",
                    Some(turn_id.clone()),
                    trace_id.clone(),
                )
                .await;
                (m.agent_id, m.text)
            }
            Some(m) => {
                match self.config.unknown_mention {
                    UnknownMentionPolicy::Reject => {
                        self.report(
                            ErrorCode::AgentNotMember,
                            format!("agent {} is not in this session", m.agent_id),
                            Some(turn_id),
                            trace_id,
                        )
                        .await;
                    }
                    UnknownMentionPolicy::Invite => {
                        let deferred = DeferredInput {
                            turn_id,
                            trace_id: trace_id.clone(),
                            requested_by: env.sender.clone(),
                            text: m.text,
                            selection: input.selection.clone(),
                        };
                        self.begin_add(m.agent_id, Some("mention".to_string()), trace_id, Some(deferred))
                            .await;
                    }
                }
                return;
            }
            None => match self.resolve_default_target(Some(&turn_id), trace_id.as_deref()).await {
                Some(agent_id) => (agent_id, input.text.clone()),
                None => {
                    self.report(
                        ErrorCode::NoActiveAgent,
                        "no active agent to route the input to",
                        Some(turn_id),
                        trace_id,
                    )
                    .await;
                    return;
                }
            },
        };

        self.route_turn(DeferredInput {
            turn_id,
            trace_id,
            requested_by: env.sender.clone(),
            text,
            selection: input.selection.clone(),
        }, target)
        .await;
    }

    /// 默认策略给出的成员（会话打开、活跃 Agent 被移除、无活跃 Agent 的输入共用）
    pub(super) fn default_fallback(&self) -> Option<AgentId> {
        match self.config.default_agent {
            DefaultAgentPolicy::None => None,
            DefaultAgentPolicy::FirstMember => self.ctx.first_member().cloned(),
            DefaultAgentPolicy::Fixed => self
                .config
                .default_agent_id
                .clone()
                .filter(|id| self.ctx.is_member(id)),
        }
    }

    /// 未提及时的目标：活跃 Agent，否则按默认策略选一个并设为活跃
    async fn resolve_default_target(&mut self, turn_id: Option<&str>, trace_id: Option<&str>) -> Option<AgentId> {
        if let Some(active) = self.ctx.active_agent_id() {
            if self.ctx.is_member(active) {
                return Some(active.clone());
            }
        }
        let fallback = self.default_fallback()?;
        self.switch_active(
            Some(fallback.clone()),
            "default_agent",
            turn_id.map(str::to_string),
            trace_id.map(str::to_string),
        )
        .await;
        Some(fallback)
    }

    /// 登记在途轮次，通知前端已受理，再把输入定向发给目标 Agent
    pub(super) async fn route_turn(&mut self, input: DeferredInput, agent_id: AgentId) {
        let DeferredInput {
            turn_id,
            trace_id,
            requested_by,
            text,
            selection,
        } = input;

        self.turns.insert(InflightTurn::new(
            turn_id.clone(),
            trace_id.clone(),
            requested_by,
            agent_id.clone(),
            self.config.input_ack_timeout,
        ));
        debug!(session_id = %self.ctx.session_id, turn_id = %turn_id, "route turn to {}", agent_id);

        self.notify(
            Notice::TurnAccepted {
                target_agent_id: agent_id.clone(),
            },
            Some(turn_id.clone()),
            trace_id.clone(),
        )
        .await;

        let routed = self
            .factory
            .envelope(
                Participant::Runtime,
                Target::Agent(agent_id),
                Body::UserInput(UserInput {
                    text,
                    mentioned_agent_id: None,
                    selection,
                }),
            )
            .with_turn(Some(turn_id))
            .with_trace(trace_id);
        self.publish(routed).await;
    }

    async fn on_input_ack(&mut self, env: &Envelope, agent_id: &str) {
        let Some(turn_id) = env.turn_id.as_deref() else {
            warn!("INPUT_ACK from {} without turn_id", agent_id);
            return;
        };
        let idle = self.config.output_idle_timeout;
        let Some(turn) = self.turns.get_mut(turn_id) else {
            debug!(turn_id, "late INPUT_ACK discarded");
            return;
        };
        if turn.target_agent_id != agent_id {
            warn!(turn_id, "INPUT_ACK from {} but turn targets {}", agent_id, turn.target_agent_id);
            return;
        }
        if turn.mark_running(idle) {
            let trace_id = turn.trace_id.clone();
            self.notify(
                Notice::AgentStarted {
                    agent_id: agent_id.to_string(),
                },
                Some(turn_id.to_string()),
                trace_id,
            )
            .await;
        }
    }

    // =========================================================
    // AGENT_OUTPUT
    // =========================================================

    async fn on_agent_output(&mut self, env: &Envelope, agent_id: &str, chunk: &OutputChunk) {
        let Some(turn_id) = env.turn_id.clone() else {
            warn!("AGENT_OUTPUT from {} without turn_id, discarded", agent_id);
            return;
        };

        let Some(turn) = self.turns.get(&turn_id) else {
            debug!(turn_id = %turn_id, "output for unknown or finished turn discarded");
            return;
        };
        if turn.target_agent_id != agent_id {
            warn!(turn_id = %turn_id, "output from {} but turn targets {}", agent_id, turn.target_agent_id);
            return;
        }
        if turn.cancel_requested {
            debug!(turn_id = %turn_id, "output after CANCEL discarded");
            return;
        }
        if turn.status != TurnStatus::Running {
            warn!(turn_id = %turn_id, "output before INPUT_ACK discarded");
            return;
        }
        let trace_id = turn.trace_id.clone();

        if !self.ctx.start_speaking(agent_id, &turn_id) {
            // 每个轮次只报一次，之后的分片静默丢弃
            let first = self
                .turns
                .get_mut(&turn_id)
                .is_some_and(|t| !std::mem::replace(&mut t.conflict_reported, true));
            if !first {
                debug!(turn_id = %turn_id, "output from {} discarded, floor is taken", agent_id);
                return;
            }
            let holder = self.ctx.speaking_agent_id().cloned().unwrap_or_default();
            self.report(
                ErrorCode::SpeakingConflict,
                format!("{} is speaking, output from {} discarded", holder, agent_id),
                Some(turn_id),
                trace_id,
            )
            .await;
            return;
        }

        let idle = self.config.output_idle_timeout;
        if let Some(turn) = self.turns.get_mut(&turn_id) {
            turn.record_output(&chunk.text, idle);
        }
        self.relay_to_frontend(env).await;

        if chunk.is_final {
            self.ctx.release_speaking(&turn_id);
            if let Some(turn) = self.turns.finish(&turn_id, TurnStatus::Completed) {
                debug!(turn_id = %turn_id, "turn completed");
                self.last_outputs.insert(agent_id.to_string(), turn.output);
            }
        }
    }

    // =========================================================
    // CANCEL
    // =========================================================

    async fn on_cancel_request(&mut self, env: &Envelope, reason: Option<String>) {
        if self.pending_cancel.is_some() {
            debug!("cancel already in progress");
            return;
        }
        let speaking = self
            .ctx
            .speaking_agent_id()
            .cloned()
            .zip(self.ctx.speaking_turn_id().cloned());
        match speaking {
            Some((agent_id, turn_id)) => self.start_cancel(agent_id, turn_id, reason).await,
            None => {
                self.notify(Notice::NoSpeakingAgent, env.turn_id.clone(), env.trace_id.clone())
                    .await
            }
        }
    }

    /// 发出 CANCEL；从这一刻起该轮次的输出全部丢弃
    pub(super) async fn start_cancel(&mut self, agent_id: AgentId, turn_id: TurnId, reason: Option<String>) {
        let trace_id = match self.turns.get_mut(&turn_id) {
            Some(turn) => {
                turn.cancel_requested = true;
                turn.trace_id.clone()
            }
            None => None,
        };
        info!(session_id = %self.ctx.session_id, turn_id = %turn_id, "cancel {}", agent_id);

        let cancel = self
            .factory
            .cancel(&agent_id, &turn_id, reason)
            .with_trace(trace_id);
        self.pending_cancel = Some(PendingCancel {
            turn_id,
            agent_id,
            deadline: Instant::now() + self.config.cancel_ack_timeout,
        });
        self.publish(cancel).await;
    }

    async fn on_cancel_ack(&mut self, env: &Envelope, agent_id: &str) {
        let matches = self.pending_cancel.as_ref().is_some_and(|c| {
            c.agent_id == agent_id && env.turn_id.as_deref().map_or(true, |t| t == c.turn_id)
        });
        if matches {
            self.complete_cancel(false).await;
        } else {
            debug!("CANCEL_ACK from {} does not match a pending cancel", agent_id);
        }
    }

    /// 结束取消协议（确认或强制），然后推进等待它的事务
    async fn complete_cancel(&mut self, forced: bool) {
        let Some(cancel) = self.pending_cancel.take() else {
            return;
        };
        self.ctx.release_speaking(&cancel.turn_id);
        let trace_id = self
            .turns
            .finish(&cancel.turn_id, TurnStatus::Canceled)
            .and_then(|t| t.trace_id);

        if forced {
            self.report(
                ErrorCode::CancelTimeout,
                format!("{} did not acknowledge CANCEL, turn force-canceled", cancel.agent_id),
                Some(cancel.turn_id.clone()),
                trace_id.clone(),
            )
            .await;
        }
        self.notify(
            Notice::TurnCanceled {
                agent_id: cancel.agent_id.clone(),
                forced,
            },
            Some(cancel.turn_id.clone()),
            trace_id,
        )
        .await;

        for tx_id in self.txs.awaiting_cancel() {
            self.resume_after_cancel(&tx_id).await;
        }
    }

    // =========================================================
    // SWITCH_AGENT（前端选择）
    // =========================================================

    async fn on_switch_request(&mut self, env: &Envelope, to: Option<AgentId>) {
        match to {
            Some(agent_id) if self.ctx.is_member(&agent_id) => {
                self.switch_active(Some(agent_id), "user_select", env.turn_id.clone(), env.trace_id.clone())
                    .await;
            }
            Some(agent_id) => {
                self.report(
                    ErrorCode::AgentNotMember,
                    format!("agent {} is not in this session", agent_id),
                    env.turn_id.clone(),
                    env.trace_id.clone(),
                )
                .await;
            }
            None => {
                self.report(
                    ErrorCode::ValidationError,
                    "SWITCH_AGENT requires a target agent",
                    env.turn_id.clone(),
                    env.trace_id.clone(),
                )
                .await;
            }
        }
    }

    // =========================================================
    // ERROR 转发
    // =========================================================

    async fn on_error(&mut self, env: &Envelope, report: &ErrorReport) {
        match &env.sender {
            Participant::Agent(agent_id) => {
                self.relay_to_frontend(env).await;
                let Some(turn_id) = env.turn_id.as_deref() else {
                    return;
                };
                let owns_turn = self
                    .turns
                    .get(turn_id)
                    .is_some_and(|t| t.target_agent_id == *agent_id && !t.cancel_requested);
                if owns_turn {
                    debug!(turn_id, "turn failed by agent error {}", report.code);
                    self.ctx.release_speaking(turn_id);
                    self.turns.finish(turn_id, TurnStatus::Failed);
                }
            }
            Participant::SessionManager => self.relay_to_frontend(env).await,
            other => warn!("ERROR {} from {} dropped", report.code, other),
        }
    }

    // =========================================================
    // 计时
    // =========================================================

    async fn on_timer(&mut self, now: Instant) {
        if self.pending_cancel.as_ref().is_some_and(|c| c.deadline <= now) {
            self.complete_cancel(true).await;
        }

        for (turn_id, why) in self.turns.expired(now) {
            let (code, message) = match why {
                TurnExpiry::AckTimeout => (ErrorCode::RouteTimeout, "agent did not acknowledge the input"),
                TurnExpiry::OutputIdle => (ErrorCode::OutputTimeout, "agent stopped producing output"),
            };
            self.fail_turn(&turn_id, code, message).await;
        }

        for tx_id in self.txs.expired(now) {
            self.expire_transaction(&tx_id).await;
        }
    }

    /// 轮次进入 FAILED 并报告；已终态时不重复报告
    pub(super) async fn fail_turn(&mut self, turn_id: &str, code: ErrorCode, message: &str) {
        if let Some(turn) = self.turns.finish(turn_id, TurnStatus::Failed) {
            self.ctx.release_speaking(turn_id);
            self.report(
                code,
                format!("{} ({})", message, turn.target_agent_id),
                Some(turn.turn_id),
                turn.trace_id,
            )
            .await;
        }
    }

    // =========================================================
    // Agent 接入 / 断开
    // =========================================================

    /// 代 Agent 订阅 AGENT(id) 并交给 launcher
    pub(super) async fn attach_agent(&mut self, profile: &AgentProfile) -> Result<(), RuntimeError> {
        if self.agent_subs.contains_key(&profile.agent_id) {
            return Ok(());
        }
        let inbox = self
            .bus
            .subscribe(
                format!("agent:{}", profile.agent_id),
                Target::Agent(profile.agent_id.clone()),
                false,
            )
            .await?;
        let handle = inbox.handle;
        if let Err(e) = self.launcher.launch(profile.clone(), inbox, self.bus.clone()).await {
            self.bus.unsubscribe(handle).await;
            return Err(RuntimeError::LaunchFailed(e.to_string()));
        }
        self.agent_subs.insert(profile.agent_id.clone(), handle);
        info!(session_id = %self.ctx.session_id, "agent {} attached", profile.agent_id);
        Ok(())
    }

    /// 取消订阅；Agent 的收件箱随之关闭
    pub(super) async fn detach_agent(&mut self, agent_id: &str) {
        if let Some(handle) = self.agent_subs.remove(agent_id) {
            self.bus.unsubscribe(handle).await;
            info!(session_id = %self.ctx.session_id, "agent {} detached", agent_id);
        }
    }

    async fn detach_all(&mut self) {
        let ids: Vec<AgentId> = self.agent_subs.keys().cloned().collect();
        for agent_id in ids {
            self.detach_agent(&agent_id).await;
        }
        self.ctx.clear_speaking();
    }
}
