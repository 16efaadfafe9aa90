//! 多步事务：加入 / 移除 Agent、Agent 发起的交接、会话打开 / 关闭
//!
//! 与 SessionManager 之间是带 tx_id 的请求 / 回执对；回执超时按失败收场，本地状态不变。

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::context::SessionPhase;
use super::mention;
use super::runtime::SessionRuntime;
use super::transaction::{DeferredInput, Transaction, TxKind, TxStep};
use crate::core::ErrorCode;
use crate::message::{
    AgentId, AgentProfile, AgentRequest, Control, Envelope, Failure, MessageFactory, Notice, Participant, Target,
    TxId,
};

impl SessionRuntime {
    fn manager_deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.config.manager_reply_timeout)
    }

    /// 冲突时报告并返回 true
    async fn reject_conflict(&self, kind: &TxKind, trace_id: Option<String>) -> bool {
        let Some(existing) = self.txs.conflicting(kind) else {
            return false;
        };
        let message = format!("{} conflicts with pending {}", kind.name(), existing);
        self.report(ErrorCode::TransactionConflict, message, None, trace_id).await;
        true
    }

    /// 按事务类型发出 SessionManager 请求
    async fn send_manager_request(&self, tx: &Transaction) {
        let control = match &tx.kind {
            TxKind::AddAgent { agent_id, reason, .. } => Control::RequestAddAgent(AgentRequest {
                agent_id: agent_id.clone(),
                reason: reason.clone(),
            }),
            TxKind::RemoveAgent { agent_id, reason } => Control::RequestRemoveAgent(AgentRequest {
                agent_id: agent_id.clone(),
                reason: reason.clone(),
            }),
            TxKind::OpenSession { agents } => Control::RequestSessionOpen { agents: agents.clone() },
            TxKind::CloseSession { reason, .. } => Control::RequestSessionClose { reason: reason.clone() },
            TxKind::Handover { .. } => return,
        };
        debug!(session_id = %self.ctx.session_id, tx_id = %tx.tx_id, "{} -> session manager", control.subtype());
        let env = self
            .factory
            .control(Participant::Runtime, Target::System, control)
            .with_tx(Some(tx.tx_id.clone()))
            .with_trace(tx.trace_id.clone());
        self.publish(env).await;
    }

    /// 发出请求并等待回执
    async fn start_manager_tx(&mut self, kind: TxKind, trace_id: Option<String>) {
        let tx = Transaction::new(
            MessageFactory::new_tx_id(),
            kind,
            trace_id,
            TxStep::ManagerReply,
            self.manager_deadline(),
        );
        self.send_manager_request(&tx).await;
        self.txs.insert(tx);
    }

    /// 当前发言者（若是 agent_id 或任意发言者）
    fn speaker_matching(&self, agent_id: Option<&str>) -> Option<(AgentId, String)> {
        let speaker = self.ctx.speaking_agent_id()?;
        if agent_id.is_some_and(|id| id != speaker) {
            return None;
        }
        Some((speaker.clone(), self.ctx.speaking_turn_id()?.clone()))
    }

    // =========================================================
    // 加入
    // =========================================================

    pub(super) async fn begin_add(
        &mut self,
        agent_id: AgentId,
        reason: Option<String>,
        trace_id: Option<String>,
        deferred: Option<DeferredInput>,
    ) {
        let turn_id = deferred.as_ref().map(|d| d.turn_id.clone());
        if !mention::is_valid_agent_id(&agent_id) {
            self.report(
                ErrorCode::ValidationError,
                format!("invalid agent id {:?}", agent_id),
                turn_id,
                trace_id,
            )
            .await;
            return;
        }
        if self.ctx.is_member(&agent_id) {
            self.report(
                ErrorCode::AddAgentFailed,
                format!("agent {} is already in this session", agent_id),
                turn_id,
                trace_id,
            )
            .await;
            return;
        }

        let kind = TxKind::AddAgent {
            agent_id,
            reason,
            deferred,
        };
        if self.reject_conflict(&kind, trace_id.clone()).await {
            return;
        }
        self.start_manager_tx(kind, trace_id).await;
    }

    async fn complete_add(&mut self, profile: AgentProfile, deferred: Option<DeferredInput>, trace_id: Option<String>) {
        let turn_id = deferred.as_ref().map(|d| d.turn_id.clone());
        if let Err(e) = self.attach_agent(&profile).await {
            self.report(
                ErrorCode::AddAgentFailed,
                format!("agent {} could not be started: {}", profile.agent_id, e),
                turn_id,
                trace_id,
            )
            .await;
            return;
        }

        let agent_id = profile.agent_id.clone();
        self.ctx.add_member(profile.clone());
        info!(session_id = %self.ctx.session_id, "agent {} joined", agent_id);
        self.notify(Notice::AgentAdded { profile }, turn_id.clone(), trace_id.clone())
            .await;

        // 邀请式提及：切换后再路由被暂存的输入
        if let Some(input) = deferred {
            if !self.ctx.phase.accepts_input() {
                self.report(ErrorCode::SessionClosed, "session is closing", turn_id, trace_id)
                    .await;
                return;
            }
            self.switch_active(
                Some(agent_id.clone()),
                "mention",
                Some(input.turn_id.clone()),
                input.trace_id.clone(),
            )
            .await;
            self.route_turn(input, agent_id).await;
        }
    }

    // =========================================================
    // 移除
    // =========================================================

    pub(super) async fn begin_remove(&mut self, agent_id: AgentId, reason: Option<String>, trace_id: Option<String>) {
        if !self.ctx.is_member(&agent_id) {
            self.report(
                ErrorCode::AgentNotMember,
                format!("agent {} is not in this session", agent_id),
                None,
                trace_id,
            )
            .await;
            return;
        }

        let kind = TxKind::RemoveAgent {
            agent_id: agent_id.clone(),
            reason,
        };
        if self.reject_conflict(&kind, trace_id.clone()).await {
            return;
        }

        // 正在发言：先跑完取消协议，再请求移除
        let cancelling_it = self.pending_cancel.as_ref().is_some_and(|c| c.agent_id == agent_id);
        let speaker = self.speaker_matching(Some(agent_id.as_str()));
        if cancelling_it || speaker.is_some() {
            self.hold_for_cancel(kind, trace_id, speaker).await;
        } else {
            self.start_manager_tx(kind, trace_id).await;
        }
    }

    async fn complete_remove(&mut self, agent_id: &str, trace_id: Option<String>) {
        self.detach_agent(agent_id).await;
        self.ctx.remove_member(agent_id);
        self.last_outputs.remove(agent_id);
        if self.pending_cancel.as_ref().is_some_and(|c| c.agent_id == agent_id) {
            self.pending_cancel = None;
        }

        for turn_id in self.turns.live_for_agent(agent_id) {
            self.fail_turn(&turn_id, ErrorCode::TurnAborted, "agent left the session").await;
        }

        // 涉及该 Agent 的交接一并作废
        let stale_handover = self.txs.pending_handover().and_then(|tx| match &tx.kind {
            TxKind::Handover { from_agent, to_agent, .. } if from_agent == agent_id || to_agent == agent_id => {
                Some(tx.tx_id.clone())
            }
            _ => None,
        });
        if let Some(tx_id) = stale_handover {
            self.txs.remove(&tx_id);
            self.report(
                ErrorCode::HandoverFailed,
                format!("handover aborted, {} left the session", agent_id),
                None,
                trace_id.clone(),
            )
            .await;
        }

        if self.ctx.active_agent_id().map(String::as_str) == Some(agent_id) {
            let fallback = self.default_fallback();
            self.switch_active(fallback, "agent_removed", None, trace_id.clone()).await;
        }

        info!(session_id = %self.ctx.session_id, "agent {} left", agent_id);
        self.notify(
            Notice::AgentRemoved {
                agent_id: agent_id.to_string(),
            },
            None,
            trace_id,
        )
        .await;
    }

    // =========================================================
    // 交接
    // =========================================================

    pub(super) async fn begin_handover(
        &mut self,
        env: &Envelope,
        from_agent: AgentId,
        to_agent: AgentId,
        summary: Option<String>,
        context_ref: Option<String>,
        reason: Option<String>,
    ) {
        let trace_id = env.trace_id.clone();
        if !self.ctx.is_member(&from_agent) {
            warn!("HANDOVER_REQUEST from non-member {} dropped", from_agent);
            return;
        }
        let refusal = if from_agent == to_agent {
            Some((ErrorCode::ValidationError, format!("{} cannot hand over to itself", from_agent)))
        } else if !self.ctx.is_member(&to_agent) {
            Some((ErrorCode::HandoverFailed, format!("agent {} is not in this session", to_agent)))
        } else {
            self.txs.pending_handover().map(|existing| {
                (
                    ErrorCode::TransactionConflict,
                    format!("HANDOVER conflicts with pending {}", existing),
                )
            })
        };
        if let Some((code, message)) = refusal {
            self.report(code, message.clone(), None, trace_id.clone()).await;
            self.notify_handover_rejected(&from_agent, env.tx_id.clone(), trace_id, message)
                .await;
            return;
        }

        let tx_id = env.tx_id.clone().unwrap_or_else(MessageFactory::new_tx_id);
        let prompt = self
            .factory
            .control(
                Participant::Runtime,
                Target::Frontend,
                Control::HandoverUiPrompt {
                    from_agent: from_agent.clone(),
                    to_agent: to_agent.clone(),
                    reason: reason.clone(),
                    summary: summary.clone(),
                },
            )
            .with_tx(Some(tx_id.clone()))
            .with_trace(trace_id.clone());
        info!(session_id = %self.ctx.session_id, tx_id = %tx_id, "handover {} -> {} requested", from_agent, to_agent);

        self.txs.insert(Transaction::new(
            tx_id,
            TxKind::Handover {
                from_agent,
                to_agent,
                summary,
                context_ref,
                reason,
            },
            trace_id,
            TxStep::UserDecision,
            Some(Instant::now() + self.config.handover_decision_timeout),
        ));
        self.publish(prompt).await;
    }

    /// 前端决定；confirm 为 None 表示拒绝。未带 tx_id 时匹配唯一的在途交接
    pub(super) async fn on_handover_decision(&mut self, env: &Envelope, confirm: Option<Option<AgentId>>) {
        let tx_id = match env.tx_id.clone() {
            Some(tx_id) => Some(tx_id),
            None => self.txs.pending_handover().map(|tx| tx.tx_id.clone()),
        };
        let is_handover = tx_id
            .as_deref()
            .and_then(|id| self.txs.get(id))
            .is_some_and(|tx| matches!(tx.kind, TxKind::Handover { .. }));
        let tx = if is_handover {
            tx_id.as_deref().and_then(|id| self.txs.remove(id))
        } else {
            None
        };
        let Some(tx) = tx else {
            self.report(
                ErrorCode::ValidationError,
                "no pending handover to decide",
                None,
                env.trace_id.clone(),
            )
            .await;
            return;
        };
        let TxKind::Handover {
            from_agent,
            to_agent,
            summary,
            context_ref,
            reason,
        } = tx.kind
        else {
            return;
        };

        let Some(override_to) = confirm else {
            info!(session_id = %self.ctx.session_id, tx_id = %tx.tx_id, "handover rejected by user");
            self.notify_handover_rejected(&from_agent, Some(tx.tx_id), tx.trace_id, "rejected by user".to_string())
                .await;
            return;
        };

        let target = override_to.unwrap_or(to_agent);
        if !self.ctx.is_member(&target) {
            let message = format!("agent {} is not in this session", target);
            self.report(ErrorCode::HandoverFailed, message.clone(), None, tx.trace_id.clone())
                .await;
            self.notify_handover_rejected(&from_agent, Some(tx.tx_id), tx.trace_id, message)
                .await;
            return;
        }

        self.switch_active(Some(target.clone()), "handover", None, tx.trace_id.clone())
            .await;
        let context = self
            .factory
            .control(
                Participant::Runtime,
                Target::Agent(target.clone()),
                Control::HandoverContext {
                    prev_output: self.last_outputs.get(&from_agent).cloned(),
                    from_agent,
                    summary,
                    context_ref,
                    reason,
                },
            )
            .with_tx(Some(tx.tx_id.clone()))
            .with_trace(tx.trace_id);
        info!(session_id = %self.ctx.session_id, tx_id = %tx.tx_id, "handover to {} confirmed", target);
        self.publish(context).await;
    }

    /// 告知发起交接的 Agent：未被接受
    async fn notify_handover_rejected(
        &self,
        from_agent: &str,
        tx_id: Option<TxId>,
        trace_id: Option<String>,
        reason: String,
    ) {
        let env = self
            .factory
            .control(
                Participant::Runtime,
                Target::Agent(from_agent.to_string()),
                Control::HandoverReject { reason: Some(reason) },
            )
            .with_tx(tx_id)
            .with_trace(trace_id);
        self.publish(env).await;
    }

    // =========================================================
    // 会话打开 / 关闭
    // =========================================================

    pub(super) async fn begin_open(&mut self, agents: Vec<AgentId>, trace_id: Option<String>) {
        if self.ctx.phase != SessionPhase::Idle {
            self.report(
                ErrorCode::ValidationError,
                format!("session cannot be opened in phase {:?}", self.ctx.phase),
                None,
                trace_id,
            )
            .await;
            return;
        }
        let kind = TxKind::OpenSession { agents };
        if self.reject_conflict(&kind, trace_id.clone()).await {
            return;
        }
        self.ctx.phase = SessionPhase::Opening;
        self.start_manager_tx(kind, trace_id).await;
    }

    pub(super) async fn begin_close(&mut self, reason: Option<String>, trace_id: Option<String>) {
        if !self.ctx.phase.accepts_input() {
            self.report(ErrorCode::SessionClosed, "session is already closing", None, trace_id)
                .await;
            return;
        }
        let kind = TxKind::CloseSession {
            reason,
            resume: self.ctx.phase,
        };
        if self.reject_conflict(&kind, trace_id.clone()).await {
            return;
        }
        self.ctx.phase = SessionPhase::Closing;

        let speaker = self.speaker_matching(None);
        if self.pending_cancel.is_some() || speaker.is_some() {
            self.hold_for_cancel(kind, trace_id, speaker).await;
        } else {
            self.start_manager_tx(kind, trace_id).await;
        }
    }

    async fn complete_open(&mut self, env: &Envelope, profiles: &[AgentProfile], active: Option<AgentId>) {
        for profile in profiles {
            if self.ctx.is_member(&profile.agent_id) {
                continue;
            }
            match self.attach_agent(profile).await {
                Ok(()) => {
                    self.ctx.add_member(profile.clone());
                }
                Err(e) => {
                    self.report(
                        ErrorCode::AddAgentFailed,
                        format!("agent {} could not be started: {}", profile.agent_id, e),
                        None,
                        env.trace_id.clone(),
                    )
                    .await;
                }
            }
        }
        self.ctx.phase = SessionPhase::Open;
        info!(session_id = %self.ctx.session_id, members = ?self.ctx.member_ids(), "session opened");
        self.relay_to_frontend(env).await;

        let active = active
            .filter(|id| self.ctx.is_member(id))
            .or_else(|| self.default_fallback());
        if active.is_some() {
            self.switch_active(active, "session_opened", None, env.trace_id.clone())
                .await;
        }
    }

    /// 关闭完成：中止在途轮次与事务，停止 actor
    async fn complete_close(&mut self, env: &Envelope) {
        self.ctx.phase = SessionPhase::Closed;
        for turn_id in self.turns.live_ids() {
            self.fail_turn(&turn_id, ErrorCode::SessionClosed, "session closed").await;
        }
        for tx_id in self.txs.tx_ids() {
            self.expire_transaction(&tx_id).await;
        }
        self.pending_cancel = None;
        self.relay_to_frontend(env).await;
        info!(session_id = %self.ctx.session_id, "session closed");
        self.stopped = true;
    }

    // =========================================================
    // 回执 / 推进 / 超时
    // =========================================================

    /// 把事务挂在取消协议之后；没有在途取消时发起一个
    async fn hold_for_cancel(&mut self, kind: TxKind, trace_id: Option<String>, speaker: Option<(AgentId, String)>) {
        let tx_id = MessageFactory::new_tx_id();
        debug!(session_id = %self.ctx.session_id, tx_id = %tx_id, "{} waits for cancel", kind.name());
        self.txs
            .insert(Transaction::new(tx_id, kind, trace_id, TxStep::CancelSpeaker, None));
        if self.pending_cancel.is_none() {
            if let Some((agent_id, turn_id)) = speaker {
                self.start_cancel(agent_id, turn_id, Some("interrupted".to_string()))
                    .await;
            }
        }
    }

    /// 取消协议结束后继续：发出 SessionManager 请求
    pub(super) async fn resume_after_cancel(&mut self, tx_id: &str) {
        let deadline = self.manager_deadline();
        let Some(tx) = self.txs.get_mut(tx_id) else {
            return;
        };
        tx.advance(TxStep::ManagerReply, deadline);
        let tx = tx.clone();
        self.send_manager_request(&tx).await;
    }

    pub(super) async fn on_manager_reply(&mut self, env: &Envelope, reply: &Control) {
        let Some(tx_id) = env.tx_id.as_deref() else {
            warn!("{} without tx_id dropped", reply.subtype());
            return;
        };
        let matches = self.txs.get(tx_id).is_some_and(|tx| {
            tx.expected == TxStep::ManagerReply
                && matches!(
                    (&tx.kind, reply),
                    (TxKind::AddAgent { .. }, Control::AddAgentDone { .. } | Control::AddAgentFailed(_))
                        | (
                            TxKind::RemoveAgent { .. },
                            Control::RemoveAgentDone { .. } | Control::RemoveAgentFailed(_)
                        )
                        | (
                            TxKind::OpenSession { .. },
                            Control::SessionOpened { .. } | Control::SessionFailed(_)
                        )
                        | (
                            TxKind::CloseSession { .. },
                            Control::SessionClosed | Control::SessionFailed(_)
                        )
                )
        });
        if !matches {
            debug!(tx_id, "{} does not match a pending transaction, dropped", reply.subtype());
            return;
        }
        let Some(tx) = self.txs.remove(tx_id) else {
            return;
        };
        let trace_id = tx.trace_id.clone();

        match (tx.kind, reply) {
            (TxKind::AddAgent { agent_id, deferred, .. }, Control::AddAgentDone { profile }) => {
                if profile.agent_id != agent_id {
                    warn!("ADD_AGENT_DONE for {} answers a request for {}", profile.agent_id, agent_id);
                }
                self.complete_add(profile.clone(), deferred, trace_id).await;
            }
            (TxKind::AddAgent { agent_id, deferred, .. }, Control::AddAgentFailed(Failure { reason, .. })) => {
                self.report(
                    ErrorCode::AddAgentFailed,
                    format!("adding {} failed: {}", agent_id, reason),
                    deferred.map(|d| d.turn_id),
                    trace_id,
                )
                .await;
            }
            (TxKind::RemoveAgent { agent_id, .. }, Control::RemoveAgentDone { .. }) => {
                self.complete_remove(&agent_id, trace_id).await;
            }
            (TxKind::RemoveAgent { agent_id, .. }, Control::RemoveAgentFailed(Failure { reason, .. })) => {
                self.report(
                    ErrorCode::RemoveAgentFailed,
                    format!("removing {} failed: {}", agent_id, reason),
                    None,
                    trace_id,
                )
                .await;
            }
            (TxKind::OpenSession { .. }, Control::SessionOpened { agents, active_agent_id }) => {
                self.complete_open(env, agents, active_agent_id.clone()).await;
            }
            (TxKind::OpenSession { .. }, Control::SessionFailed(_)) => {
                self.ctx.phase = SessionPhase::Idle;
                self.relay_to_frontend(env).await;
            }
            (TxKind::CloseSession { .. }, Control::SessionClosed) => {
                self.complete_close(env).await;
            }
            (TxKind::CloseSession { resume, .. }, Control::SessionFailed(_)) => {
                self.ctx.phase = resume;
                self.relay_to_frontend(env).await;
            }
            _ => {}
        }
    }

    /// 事务超时或被强制中止：以对应的失败告知前端，本地状态不变
    pub(super) async fn expire_transaction(&mut self, tx_id: &str) {
        let Some(tx) = self.txs.remove(tx_id) else {
            return;
        };
        warn!(session_id = %self.ctx.session_id, tx_id, "transaction {} abandoned", tx);
        let trace_id = tx.trace_id.clone();

        match tx.kind {
            TxKind::AddAgent { agent_id, deferred, .. } => {
                self.report(
                    ErrorCode::AddAgentFailed,
                    format!("no reply for adding {}", agent_id),
                    deferred.map(|d| d.turn_id),
                    trace_id,
                )
                .await;
            }
            TxKind::RemoveAgent { agent_id, .. } => {
                self.report(
                    ErrorCode::RemoveAgentFailed,
                    format!("no reply for removing {}", agent_id),
                    None,
                    trace_id,
                )
                .await;
            }
            TxKind::Handover { from_agent, .. } => {
                self.report(ErrorCode::HandoverTimeout, "no handover decision", None, trace_id.clone())
                    .await;
                self.notify_handover_rejected(&from_agent, Some(tx.tx_id), trace_id, "timeout".to_string())
                    .await;
            }
            TxKind::OpenSession { .. } => {
                if self.ctx.phase == SessionPhase::Opening {
                    self.ctx.phase = SessionPhase::Idle;
                }
                self.report(ErrorCode::SessionFailed, "no reply for opening the session", None, trace_id)
                    .await;
            }
            TxKind::CloseSession { resume, .. } => {
                if self.ctx.phase == SessionPhase::Closing {
                    self.ctx.phase = resume;
                }
                self.report(ErrorCode::SessionFailed, "no reply for closing the session", None, trace_id)
                    .await;
            }
        }
    }
}

