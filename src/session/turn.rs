//! 在途轮次：一次用户输入到最终输出的周期
//!
//! 状态机：ROUTING → RUNNING（必须先收到目标 Agent 的 INPUT_ACK）→ COMPLETED / FAILED / CANCELED。
//! 终态不可变；进入终态即从在途表移出，只在有界历史中保留状态，用于识别迟到的输出。

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::message::{AgentId, Participant, TurnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnStatus {
    Routing,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed | TurnStatus::Canceled)
    }
}

#[derive(Debug, Clone)]
pub struct InflightTurn {
    pub turn_id: TurnId,
    pub trace_id: Option<String>,
    pub requested_by: Participant,
    pub target_agent_id: AgentId,
    pub status: TurnStatus,
    pub created_at: Instant,
    pub last_output_at: Option<Instant>,
    /// ROUTING 时是 ack 截止；RUNNING 时是输出空闲截止
    pub deadline: Instant,
    /// 已发出 CANCEL，之后的输出一律丢弃
    pub cancel_requested: bool,
    /// 已就抢话报过 SPEAKING_CONFLICT
    pub conflict_reported: bool,
    /// 已转发输出的拼接（完成后记为该 Agent 的 last output）
    pub output: String,
}

impl InflightTurn {
    pub fn new(
        turn_id: TurnId,
        trace_id: Option<String>,
        requested_by: Participant,
        target_agent_id: AgentId,
        ack_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            turn_id,
            trace_id,
            requested_by,
            target_agent_id,
            status: TurnStatus::Routing,
            created_at: now,
            last_output_at: None,
            deadline: now + ack_timeout,
            cancel_requested: false,
            conflict_reported: false,
            output: String::new(),
        }
    }

    /// ROUTING → RUNNING
    pub fn mark_running(&mut self, idle_timeout: Duration) -> bool {
        if self.status != TurnStatus::Routing {
            return false;
        }
        self.status = TurnStatus::Running;
        self.deadline = Instant::now() + idle_timeout;
        true
    }

    pub fn record_output(&mut self, text: &str, idle_timeout: Duration) {
        let now = Instant::now();
        self.last_output_at = Some(now);
        self.deadline = now + idle_timeout;
        self.output.push_str(text);
    }

    /// 计时器是否仍由轮次自己负责（取消中的轮次由取消流程计时）
    fn timed(&self) -> bool {
        !self.status.is_terminal() && !self.cancel_requested
    }
}

/// 轮次到期原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnExpiry {
    AckTimeout,
    OutputIdle,
}

/// 在途轮次表 + 有界终态历史
#[derive(Debug)]
pub struct TurnTable {
    live: HashMap<TurnId, InflightTurn>,
    history: VecDeque<(TurnId, TurnStatus)>,
    max_history: usize,
}

impl TurnTable {
    pub fn new(max_history: usize) -> Self {
        Self {
            live: HashMap::new(),
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn insert(&mut self, turn: InflightTurn) {
        self.live.insert(turn.turn_id.clone(), turn);
    }

    pub fn get(&self, turn_id: &str) -> Option<&InflightTurn> {
        self.live.get(turn_id)
    }

    pub fn get_mut(&mut self, turn_id: &str) -> Option<&mut InflightTurn> {
        self.live.get_mut(turn_id)
    }

    /// 在途或历史中的状态
    pub fn status(&self, turn_id: &str) -> Option<TurnStatus> {
        self.live.get(turn_id).map(|t| t.status).or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|(id, _)| id == turn_id)
                .map(|(_, status)| *status)
        })
    }

    /// 进入终态并移出在途表；已终态或不存在时返回 None
    pub fn finish(&mut self, turn_id: &str, status: TurnStatus) -> Option<InflightTurn> {
        if !status.is_terminal() {
            return None;
        }
        let mut turn = self.live.remove(turn_id)?;
        turn.status = status;
        self.history.push_back((turn.turn_id.clone(), status));
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        Some(turn)
    }

    /// 某 Agent 名下所有未终结的轮次
    pub fn live_for_agent(&self, agent_id: &str) -> Vec<TurnId> {
        self.live
            .values()
            .filter(|t| t.target_agent_id == agent_id)
            .map(|t| t.turn_id.clone())
            .collect()
    }

    pub fn live_ids(&self) -> Vec<TurnId> {
        self.live.keys().cloned().collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.live.values().filter(|t| t.timed()).map(|t| t.deadline).min()
    }

    /// 已过截止时间的轮次
    pub fn expired(&self, now: Instant) -> Vec<(TurnId, TurnExpiry)> {
        let mut expired: Vec<_> = self
            .live
            .values()
            .filter(|t| t.timed() && t.deadline <= now)
            .map(|t| {
                let why = if t.status == TurnStatus::Routing {
                    TurnExpiry::AckTimeout
                } else {
                    TurnExpiry::OutputIdle
                };
                (t.turn_id.clone(), why, t.created_at)
            })
            .collect();
        expired.sort_by_key(|(_, _, created)| *created);
        expired.into_iter().map(|(id, why, _)| (id, why)).collect()
    }

    /// 快照用：最近 recent 条终态 + 全部在途（在途按创建时间）
    pub fn statuses(&self, recent: usize) -> Vec<(TurnId, TurnStatus)> {
        let mut live: Vec<_> = self.live.values().collect();
        live.sort_by_key(|t| t.created_at);
        let skip = self.history.len().saturating_sub(recent);
        self.history
            .iter()
            .skip(skip)
            .cloned()
            .chain(live.into_iter().map(|t| (t.turn_id.clone(), t.status)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: &str, agent: &str) -> InflightTurn {
        InflightTurn::new(
            id.to_string(),
            None,
            Participant::Frontend,
            agent.to_string(),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_running_requires_routing() {
        let mut t = turn("t1", "a");
        assert!(t.mark_running(Duration::from_secs(1)));
        assert!(!t.mark_running(Duration::from_secs(1)));
        assert_eq!(t.status, TurnStatus::Running);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut table = TurnTable::new(10);
        table.insert(turn("t1", "a"));
        assert!(table.finish("t1", TurnStatus::Failed).is_some());
        assert!(table.finish("t1", TurnStatus::Completed).is_none());
        assert_eq!(table.status("t1"), Some(TurnStatus::Failed));
        assert!(table.get("t1").is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut table = TurnTable::new(2);
        for id in ["t1", "t2", "t3"] {
            table.insert(turn(id, "a"));
            table.finish(id, TurnStatus::Completed);
        }
        assert_eq!(table.status("t1"), None);
        assert_eq!(table.status("t3"), Some(TurnStatus::Completed));
        assert_eq!(table.statuses(1), vec![("t3".to_string(), TurnStatus::Completed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_kinds() {
        let mut table = TurnTable::new(10);
        table.insert(turn("t1", "a"));
        let mut running = turn("t2", "b");
        running.mark_running(Duration::from_millis(50));
        table.insert(running);

        tokio::time::advance(Duration::from_millis(60)).await;
        let expired = table.expired(Instant::now());
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&("t1".to_string(), TurnExpiry::AckTimeout)));
        assert!(expired.contains(&("t2".to_string(), TurnExpiry::OutputIdle)));
    }

    #[test]
    fn test_cancel_requested_is_not_timed() {
        let mut table = TurnTable::new(10);
        let mut t = turn("t1", "a");
        t.cancel_requested = true;
        table.insert(t);
        assert!(table.next_deadline().is_none());
        assert_eq!(table.live_for_agent("a"), vec!["t1".to_string()]);
    }
}
