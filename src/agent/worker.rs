//! AgentWorker：在 Agent 的总线收件箱上执行 Agent 契约
//!
//! - 收到 USER_INPUT 立即回 INPUT_ACK（生成中收到的输入排队，依次处理）
//! - 输出以 AGENT_OUTPUT 发往 SESSION，seq 递增，每轮恰好一个 is_final（向前看一个分片）
//! - 收到 CANCEL 停止生成并回 CANCEL_ACK
//! - HANDOVER_CONTEXT 暂存，附在下一条输入上
//! - 生成失败发 ERROR（带 turn_id）
//!
//! 收件箱关闭（被取消订阅）即退出。

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::traits::{Agent, AgentInput, HandoverNote};
use crate::core::ErrorCode;
use crate::message::{
    AgentProfile, Body, Control, Envelope, MessageBus, MessageFactory, Participant, Subscription, Target, TurnId,
};

struct Job {
    trace_id: Option<String>,
    input: AgentInput,
}

/// 生成过程中收到 CANCEL / 收件箱关闭时的去向
enum Interrupt {
    Cancel,
    Closed,
}

pub struct AgentWorker {
    profile: AgentProfile,
    agent: Arc<dyn Agent>,
    inbox: Subscription,
    bus: MessageBus,
    factory: MessageFactory,
    queue: VecDeque<Job>,
    handover: Option<HandoverNote>,
}

impl AgentWorker {
    pub fn new(profile: AgentProfile, agent: Arc<dyn Agent>, inbox: Subscription, bus: MessageBus) -> Self {
        let factory = MessageFactory::new(bus.session_id());
        Self {
            profile,
            agent,
            inbox,
            bus,
            factory,
            queue: VecDeque::new(),
            handover: None,
        }
    }

    pub async fn run(mut self) {
        info!(agent_id = %self.profile.agent_id, kind = self.agent.kind(), "agent worker started");
        loop {
            if let Some(job) = self.queue.pop_front() {
                if let Err(Interrupt::Closed) = self.serve(job).await {
                    break;
                }
                continue;
            }
            match self.inbox.recv().await {
                Some(env) => {
                    self.on_envelope(env, None).await;
                }
                None => break,
            }
        }
        info!(agent_id = %self.profile.agent_id, "agent worker stopped");
    }

    async fn send(&self, env: Envelope) {
        if let Err(e) = self.bus.publish(env).await {
            debug!(agent_id = %self.profile.agent_id, "publish failed: {}", e);
        }
    }

    /// 处理一条信封；返回是否命中当前轮次的取消
    async fn on_envelope(&mut self, env: Envelope, current: Option<&str>) -> Option<Interrupt> {
        match env.body {
            Body::UserInput(input) => {
                let Some(turn_id) = env.turn_id else {
                    warn!(agent_id = %self.profile.agent_id, "USER_INPUT without turn_id dropped");
                    return None;
                };
                self.send(self.factory.input_ack(&self.profile.agent_id, &turn_id).with_trace(env.trace_id.clone()))
                    .await;
                self.queue.push_back(Job {
                    trace_id: env.trace_id,
                    input: AgentInput {
                        session_id: env.session_id,
                        turn_id,
                        text: input.text,
                        selection: input.selection,
                        handover: None,
                    },
                });
                None
            }
            Body::Control(Control::Cancel(_)) => {
                let target = env.turn_id.as_deref();
                // 排队未开始的轮次直接丢弃
                if let Some(turn_id) = target {
                    self.queue.retain(|job| job.input.turn_id != turn_id);
                }
                match (target, current) {
                    // 空闲时也回 ACK
                    (_, None) => {
                        self.send(self.factory.cancel_ack(&self.profile.agent_id, target)).await;
                        None
                    }
                    (Some(t), Some(c)) if t != c => {
                        self.send(self.factory.cancel_ack(&self.profile.agent_id, Some(t))).await;
                        None
                    }
                    _ => Some(Interrupt::Cancel),
                }
            }
            Body::Control(Control::HandoverContext {
                from_agent,
                summary,
                context_ref,
                prev_output,
                reason,
            }) => {
                debug!(agent_id = %self.profile.agent_id, "handover context from {}", from_agent);
                self.handover = Some(HandoverNote {
                    from_agent,
                    summary,
                    context_ref,
                    prev_output,
                    reason,
                });
                None
            }
            Body::Control(Control::HandoverReject { reason }) => {
                info!(agent_id = %self.profile.agent_id, "handover not accepted: {:?}", reason);
                None
            }
            other => {
                debug!(agent_id = %self.profile.agent_id, "ignored {}:{}", other.event(), other.subtype());
                None
            }
        }
    }

    /// 生成一轮；被取消时发 CANCEL_ACK
    async fn serve(&mut self, job: Job) -> Result<(), Interrupt> {
        let Job { trace_id, mut input } = job;
        let turn_id: TurnId = input.turn_id.clone();
        input.handover = self.handover.take();

        let mut stream = match self.agent.respond(input).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_failure(&turn_id, trace_id, e.to_string()).await;
                return Ok(());
            }
        };

        let agent_id = self.profile.agent_id.clone();
        let mut seq = 0u64;
        let mut held: Option<String> = None;
        loop {
            tokio::select! {
                biased;
                env = self.inbox.recv() => {
                    let Some(env) = env else {
                        return Err(Interrupt::Closed);
                    };
                    if let Some(Interrupt::Cancel) = self.on_envelope(env, Some(&turn_id)).await {
                        debug!(agent_id = %agent_id, turn_id = %turn_id, "generation canceled");
                        self.send(self.factory.cancel_ack(&agent_id, Some(&turn_id)).with_trace(trace_id)).await;
                        return Ok(());
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(piece)) => {
                        if let Some(prev) = held.replace(piece) {
                            let chunk = self.factory.agent_output(&agent_id, &turn_id, seq, prev, false);
                            self.send(chunk.with_trace(trace_id.clone())).await;
                            seq += 1;
                        }
                    }
                    Some(Err(e)) => {
                        self.report_failure(&turn_id, trace_id, e.to_string()).await;
                        return Ok(());
                    }
                    None => {
                        let last = held.take().unwrap_or_default();
                        let chunk = self.factory.agent_output(&agent_id, &turn_id, seq, last, true);
                        self.send(chunk.with_trace(trace_id)).await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn report_failure(&self, turn_id: &str, trace_id: Option<String>, message: String) {
        warn!(agent_id = %self.profile.agent_id, turn_id, "generation failed: {}", message);
        let env = self
            .factory
            .error(
                Participant::Agent(self.profile.agent_id.clone()),
                Target::Session,
                ErrorCode::Upstream("AGENT_ERROR".to_string()),
                message,
            )
            .with_turn(Some(turn_id.to_string()))
            .with_trace(trace_id);
        self.send(env).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::traits::OutputStream;
    use crate::core::AgentError;
    use crate::message::{CancelRequest, OutputChunk, UserInput};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::time::Duration;

    struct Scripted {
        pieces: Vec<&'static str>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Agent for Scripted {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn respond(&self, input: AgentInput) -> Result<OutputStream, AgentError> {
            if self.fail {
                return Err(AgentError::Generation("boom".into()));
            }
            let mut pieces: Vec<String> = self.pieces.iter().map(|p| p.to_string()).collect();
            if let Some(note) = input.handover {
                pieces.insert(0, format!("from {}:", note.from_agent));
            }
            let delay = self.delay;
            Ok(Box::pin(stream::iter(pieces).then(move |p| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, AgentError>(p)
            })))
        }
    }

    async fn setup(agent: Scripted) -> (MessageBus, Subscription, MessageFactory) {
        let bus = MessageBus::new("s1");
        let runtime = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        let inbox = bus.subscribe("agent:a", Target::agent("a"), false).await.unwrap();
        let worker = AgentWorker::new(AgentProfile::new("a", "scripted"), Arc::new(agent), inbox, bus.clone());
        tokio::spawn(worker.run());
        (bus, runtime, MessageFactory::new("s1"))
    }

    fn input_to(factory: &MessageFactory, turn: &str, text: &str) -> Envelope {
        factory
            .envelope(Participant::Runtime, Target::agent("a"), Body::UserInput(UserInput::text(text)))
            .with_turn(Some(turn.to_string()))
    }

    async fn next(sub: &mut Subscription) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn test_ack_then_exactly_one_final() {
        let (bus, mut runtime, factory) = setup(Scripted {
            pieces: vec!["a", "b", "c"],
            delay: Duration::from_millis(1),
            fail: false,
        })
        .await;
        bus.publish(input_to(&factory, "t1", "hi")).await.unwrap();

        assert_eq!(next(&mut runtime).await.subtype(), "INPUT_ACK");
        let mut chunks = Vec::new();
        loop {
            let env = next(&mut runtime).await;
            if let Body::AgentOutput(chunk) = env.body {
                let done = chunk.is_final;
                chunks.push(chunk);
                if done {
                    break;
                }
            }
        }
        let finals = chunks.iter().filter(|c| c.is_final).count();
        assert_eq!(finals, 1);
        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "abc");
        assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_stops_stream_and_acks() {
        let (bus, mut runtime, factory) = setup(Scripted {
            pieces: vec!["x"; 100],
            delay: Duration::from_millis(20),
            fail: false,
        })
        .await;
        bus.publish(input_to(&factory, "t1", "go")).await.unwrap();
        assert_eq!(next(&mut runtime).await.subtype(), "INPUT_ACK");

        let cancel = factory
            .control(Participant::Runtime, Target::agent("a"), Control::Cancel(CancelRequest { reason: None }))
            .with_turn(Some("t1".into()));
        bus.publish(cancel).await.unwrap();

        loop {
            let env = next(&mut runtime).await;
            match env.body {
                Body::Control(Control::CancelAck) => {
                    assert_eq!(env.turn_id.as_deref(), Some("t1"));
                    break;
                }
                Body::AgentOutput(OutputChunk { is_final, .. }) => assert!(!is_final),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_generation_error_is_reported_with_turn() {
        let (bus, mut runtime, factory) = setup(Scripted {
            pieces: vec![],
            delay: Duration::from_millis(1),
            fail: true,
        })
        .await;
        bus.publish(input_to(&factory, "t9", "hi")).await.unwrap();
        assert_eq!(next(&mut runtime).await.subtype(), "INPUT_ACK");
        let err = next(&mut runtime).await;
        assert_eq!(err.subtype(), "AGENT_ERROR");
        assert_eq!(err.turn_id.as_deref(), Some("t9"));
    }

    #[tokio::test]
    async fn test_empty_stream_still_sends_final() {
        let (bus, mut runtime, factory) = setup(Scripted {
            pieces: vec![],
            delay: Duration::from_millis(1),
            fail: false,
        })
        .await;
        bus.publish(input_to(&factory, "t1", "hi")).await.unwrap();
        assert_eq!(next(&mut runtime).await.subtype(), "INPUT_ACK");
        let env = next(&mut runtime).await;
        assert_eq!(env.subtype(), "FINAL");
    }

    #[tokio::test]
    async fn test_handover_context_attached_to_next_input() {
        let (bus, mut runtime, factory) = setup(Scripted {
            pieces: vec![" ok"],
            delay: Duration::from_millis(1),
            fail: false,
        })
        .await;
        let ctx = factory.control(
            Participant::Runtime,
            Target::agent("a"),
            Control::HandoverContext {
                from_agent: "b".into(),
                summary: None,
                context_ref: None,
                prev_output: Some("earlier".into()),
                reason: None,
            },
        );
        bus.publish(ctx).await.unwrap();
        bus.publish(input_to(&factory, "t1", "hi")).await.unwrap();

        assert_eq!(next(&mut runtime).await.subtype(), "INPUT_ACK");
        let first = next(&mut runtime).await;
        match first.body {
            Body::AgentOutput(chunk) => assert_eq!(chunk.text, "from b:"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
