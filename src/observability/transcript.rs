//! 会话记录：按轮次记下用户输入与 Agent 的完整回复
//!
//! 以观察者身份旁听总线。用户输入取 Runtime 转给 Agent 的那一份（已带 turn_id、去掉提及）；
//! 回复由转发给前端的分片拼接而成，只有收到 final 的轮次才入账，被取消或失败的轮次丢弃。
//! 保留最近 N 轮，超出时剪掉最旧的。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{BusError, ErrorCode};
use crate::message::{AgentId, Body, Envelope, MessageBus, Notice, Participant, Subscription, Target, TurnId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent(AgentId),
}

#[derive(Clone, Debug)]
pub struct TranscriptEntry {
    pub turn_id: TurnId,
    pub speaker: Speaker,
    pub text: String,
    /// 信封时间戳（毫秒）
    pub at_ms: i64,
}

/// 最近 N 轮的会话记录（每轮约 user + agent 两条）
#[derive(Clone, Debug)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    max_turns: usize,
}

impl Transcript {
    pub fn new(max_turns: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
        self.prune();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 某个 Agent 说过的话
    pub fn by_agent(&self, agent_id: &str) -> Vec<&TranscriptEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(&e.speaker, Speaker::Agent(id) if id == agent_id))
            .collect()
    }

    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.entries.len() > keep {
            self.entries.drain(..self.entries.len() - keep);
        }
    }
}

/// 拼接中的回复
struct Pending {
    agent_id: AgentId,
    text: String,
}

pub struct TranscriptRecorder {
    transcript: Arc<RwLock<Transcript>>,
    join: JoinHandle<()>,
}

impl TranscriptRecorder {
    pub async fn spawn(bus: &MessageBus, max_turns: usize, shutdown: CancellationToken) -> Result<Self, BusError> {
        let inbox = bus.subscribe("transcript", Target::Broadcast, true).await?;
        let transcript = Arc::new(RwLock::new(Transcript::new(max_turns)));
        let join = tokio::spawn(Self::run(inbox, transcript.clone(), shutdown));
        Ok(Self { transcript, join })
    }

    /// 当前记录的副本
    pub async fn transcript(&self) -> Transcript {
        self.transcript.read().await.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    async fn run(mut inbox: Subscription, transcript: Arc<RwLock<Transcript>>, shutdown: CancellationToken) {
        let mut pending: HashMap<TurnId, Pending> = HashMap::new();
        loop {
            let env = tokio::select! {
                _ = shutdown.cancelled() => break,
                env = inbox.recv() => match env {
                    Some(env) => env,
                    None => break,
                },
            };
            if let Some(entry) = Self::observe(&mut pending, env) {
                transcript.write().await.push(entry);
            }
        }
        debug!("transcript recorder stopped");
    }

    fn observe(pending: &mut HashMap<TurnId, Pending>, env: Envelope) -> Option<TranscriptEntry> {
        let turn_id = env.turn_id.clone()?;
        match (&env.sender, &env.target, env.body) {
            (Participant::Runtime, Target::Agent(agent_id), Body::UserInput(input)) => {
                pending.insert(
                    turn_id.clone(),
                    Pending {
                        agent_id: agent_id.clone(),
                        text: String::new(),
                    },
                );
                Some(TranscriptEntry {
                    turn_id,
                    speaker: Speaker::User,
                    text: input.text,
                    at_ms: env.timestamp,
                })
            }
            (Participant::Agent(agent_id), Target::Frontend, Body::AgentOutput(chunk)) => {
                let buf = pending.get_mut(&turn_id).filter(|p| p.agent_id == *agent_id)?;
                buf.text.push_str(&chunk.text);
                if !chunk.is_final {
                    return None;
                }
                let done = pending.remove(&turn_id)?;
                Some(TranscriptEntry {
                    turn_id,
                    speaker: Speaker::Agent(done.agent_id),
                    text: done.text,
                    at_ms: env.timestamp,
                })
            }
            (Participant::Runtime, Target::Frontend, Body::Event(Notice::TurnCanceled { .. })) => {
                pending.remove(&turn_id);
                None
            }
            (_, Target::Frontend, Body::Error(report)) if ends_turn(&report.code) => {
                pending.remove(&turn_id);
                None
            }
            _ => None,
        }
    }
}

/// 带 turn_id 的 ERROR 中，哪些意味着该轮次已结束（SPEAKING_CONFLICT 等不算）
fn ends_turn(code: &ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::RouteTimeout
            | ErrorCode::CancelTimeout
            | ErrorCode::OutputTimeout
            | ErrorCode::TurnAborted
            | ErrorCode::SessionClosed
            | ErrorCode::Upstream(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFactory, UserInput};
    use std::time::Duration;

    fn entry(turn: &str, speaker: Speaker) -> TranscriptEntry {
        TranscriptEntry {
            turn_id: turn.into(),
            speaker,
            text: String::new(),
            at_ms: 0,
        }
    }

    #[test]
    fn test_transcript_prunes_oldest() {
        let mut t = Transcript::new(1);
        t.push(entry("t1", Speaker::User));
        t.push(entry("t1", Speaker::Agent("a".into())));
        t.push(entry("t2", Speaker::User));
        assert_eq!(t.len(), 2);
        assert_eq!(t.entries()[0].speaker, Speaker::Agent("a".into()));
    }

    #[tokio::test]
    async fn test_records_completed_turns_only() {
        let bus = MessageBus::new("s1");
        let recorder = TranscriptRecorder::spawn(&bus, 10, CancellationToken::new()).await.unwrap();
        let factory = MessageFactory::new("s1");

        for turn in ["t1", "t2"] {
            let input = factory
                .envelope(Participant::Runtime, Target::agent("a"), Body::UserInput(UserInput::text("hi")))
                .with_turn(Some(turn.into()));
            bus.publish(input).await.unwrap();
        }
        let chunks = [("t1", 0, "he", false), ("t1", 1, "llo", true), ("t2", 0, "par", false)];
        for (turn, seq, text, is_final) in chunks {
            let out = factory.agent_output("a", turn, seq, text, is_final).retarget(Target::Frontend);
            bus.publish(out).await.unwrap();
        }
        let canceled = factory
            .notice(Notice::TurnCanceled {
                agent_id: "a".into(),
                forced: false,
            })
            .with_turn(Some("t2".into()));
        bus.publish(canceled).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let t = recorder.transcript().await;
        assert_eq!(t.len(), 3);
        let replies = t.by_agent("a");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "hello");
        assert_eq!(replies[0].turn_id, "t1");
    }

    #[tokio::test]
    async fn test_speaking_conflict_keeps_pending_reply() {
        let bus = MessageBus::new("s1");
        let recorder = TranscriptRecorder::spawn(&bus, 10, CancellationToken::new()).await.unwrap();
        let factory = MessageFactory::new("s1");

        let input = factory
            .envelope(Participant::Runtime, Target::agent("b"), Body::UserInput(UserInput::text("second")))
            .with_turn(Some("t2".into()));
        bus.publish(input).await.unwrap();
        // b 抢话被拒，但轮次仍在
        let conflict = factory
            .frontend_error(ErrorCode::SpeakingConflict, "a is speaking")
            .with_turn(Some("t2".into()));
        bus.publish(conflict).await.unwrap();
        let out = factory.agent_output("b", "t2", 0, "now b", true).retarget(Target::Frontend);
        bus.publish(out).await.unwrap();

        // 超时类错误则丢弃
        let input = factory
            .envelope(Participant::Runtime, Target::agent("b"), Body::UserInput(UserInput::text("third")))
            .with_turn(Some("t3".into()));
        bus.publish(input).await.unwrap();
        bus.publish(factory.agent_output("b", "t3", 0, "part", false).retarget(Target::Frontend))
            .await
            .unwrap();
        let idle = factory
            .frontend_error(ErrorCode::OutputTimeout, "stalled")
            .with_turn(Some("t3".into()));
        bus.publish(idle).await.unwrap();
        bus.publish(factory.agent_output("b", "t3", 1, " late", true).retarget(Target::Frontend))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let t = recorder.transcript().await;
        let replies = t.by_agent("b");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].turn_id, "t2");
        assert_eq!(replies[0].text, "now b");
    }
}
