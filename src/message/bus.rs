//! 消息总线：单会话内的发布/订阅路由
//!
//! - 每个订阅者一条独立的无界队列，投递互不阻塞
//! - publish 在持锁期间完成整次扇出，所有订阅者看到同一个全局发布顺序（蕴含单订阅者 FIFO）
//! - broadcast 订阅者（观察者）收到所有信封，只用于日志 / 记忆采集，不参与业务决策
//! - 无匹配订阅者时 publish 是空操作（debug 日志），不是错误

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::envelope::{Envelope, SessionId, Target};
use crate::core::BusError;

/// 订阅句柄，用于 unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// 一个订阅：句柄 + 收件队列
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub subscriber_id: String,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// 等待下一条信封；订阅被取消或总线关闭后返回 None
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }
}

struct Subscriber {
    handle: SubscriptionHandle,
    subscriber_id: String,
    filter: Target,
    observer: bool,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Subscriber {
    fn matches(&self, target: &Target) -> bool {
        self.observer || *target == Target::Broadcast || self.filter == *target
    }
}

#[derive(Default)]
struct BusState {
    closed: bool,
    next_handle: u64,
    published: u64,
    subscribers: Vec<Subscriber>,
}

/// 总线统计
#[derive(Debug, Clone)]
pub struct BusStats {
    pub session_id: SessionId,
    /// 普通订阅者 (subscriber_id, filter)
    pub subscribers: Vec<(String, Target)>,
    pub observers: usize,
    pub published: u64,
    pub closed: bool,
}

struct BusInner {
    session_id: SessionId,
    state: Mutex<BusState>,
}

/// 会话消息总线（可廉价 clone）
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                session_id: session_id.into(),
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// 注册订阅。broadcast=true 为观察者，忽略 filter；普通订阅者不能以 BROADCAST 为 filter
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        filter: Target,
        broadcast: bool,
    ) -> Result<Subscription, BusError> {
        if !broadcast && filter == Target::Broadcast {
            return Err(BusError::InvalidFilter(
                "BROADCAST filter requires broadcast=true".to_string(),
            ));
        }

        let subscriber_id = subscriber_id.into();
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }

        state.next_handle += 1;
        let handle = SubscriptionHandle(state.next_handle);
        let (tx, inbox) = mpsc::unbounded_channel();
        debug!(
            session_id = %self.inner.session_id,
            subscriber = %subscriber_id,
            filter = %filter,
            broadcast,
            "subscribe {}",
            handle
        );
        state.subscribers.push(Subscriber {
            handle,
            subscriber_id: subscriber_id.clone(),
            filter,
            observer: broadcast,
            tx,
        });

        Ok(Subscription {
            handle,
            subscriber_id,
            inbox,
        })
    }

    /// 取消订阅；对应队列随之关闭。返回是否确有该订阅
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.inner.state.lock().await;
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.handle != handle);
        let removed = state.subscribers.len() != before;
        if removed {
            debug!(session_id = %self.inner.session_id, "unsubscribe {}", handle);
        }
        removed
    }

    /// 发布信封，返回投递到的订阅者数量
    pub async fn publish(&self, envelope: Envelope) -> Result<usize, BusError> {
        if envelope.session_id != self.inner.session_id {
            return Err(BusError::SessionMismatch {
                envelope: envelope.session_id,
                bus: self.inner.session_id.clone(),
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        state.published += 1;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for sub in state.subscribers.iter().filter(|s| s.matches(&envelope.target)) {
            if sub.tx.send(envelope.clone()).is_ok() {
                if !sub.observer {
                    delivered += 1;
                }
            } else {
                dead.push(sub.handle);
            }
        }
        if !dead.is_empty() {
            state.subscribers.retain(|s| !dead.contains(&s.handle));
            debug!(session_id = %self.inner.session_id, pruned = dead.len(), "pruned closed subscribers");
        }

        if delivered == 0 {
            debug!(session_id = %self.inner.session_id, "no subscriber for {}", envelope);
        }
        Ok(delivered)
    }

    /// 关闭总线：之后的 publish 失败，所有订阅队列关闭
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.subscribers.clear();
            debug!(session_id = %self.inner.session_id, published = state.published, "bus closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn stats(&self) -> BusStats {
        let state = self.inner.state.lock().await;
        BusStats {
            session_id: self.inner.session_id.clone(),
            subscribers: state
                .subscribers
                .iter()
                .filter(|s| !s.observer)
                .map(|s| (s.subscriber_id.clone(), s.filter.clone()))
                .collect(),
            observers: state.subscribers.iter().filter(|s| s.observer).count(),
            published: state.published,
            closed: state.closed,
        }
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Control, MessageFactory, Participant, UserInput};

    fn ack(factory: &MessageFactory, n: u64) -> Envelope {
        factory.agent_output("a", "t1", n, format!("{}", n), false)
    }

    #[tokio::test]
    async fn test_routes_by_target() {
        let bus = MessageBus::new("s1");
        let factory = MessageFactory::new("s1");
        let mut runtime = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        let mut frontend = bus.subscribe("frontend", Target::Frontend, false).await.unwrap();

        let delivered = bus.publish(factory.user_input(UserInput::text("hi"))).await.unwrap();
        assert_eq!(delivered, 1);
        assert!(runtime.try_recv().is_some());
        assert!(frontend.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_agent_target_matches_id() {
        let bus = MessageBus::new("s1");
        let factory = MessageFactory::new("s1");
        let mut a = bus.subscribe("a", Target::agent("a"), false).await.unwrap();
        let mut b = bus.subscribe("b", Target::agent("b"), false).await.unwrap();

        bus.publish(factory.cancel(&"a".to_string(), "t1", None)).await.unwrap();
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_target_and_observers() {
        let bus = MessageBus::new("s1");
        let factory = MessageFactory::new("s1");
        let mut frontend = bus.subscribe("frontend", Target::Frontend, false).await.unwrap();
        let mut agent = bus.subscribe("a", Target::agent("a"), false).await.unwrap();
        let mut observer = bus.subscribe("logger", Target::Broadcast, true).await.unwrap();

        let switch = factory.control(
            Participant::Runtime,
            Target::Broadcast,
            Control::SwitchAgent {
                from: None,
                to: Some("a".into()),
                reason: None,
            },
        );
        bus.publish(switch).await.unwrap();
        bus.publish(factory.user_input(UserInput::text("x"))).await.unwrap();

        assert!(frontend.try_recv().is_some());
        assert!(agent.try_recv().is_some());
        // 观察者恰好各收到一次
        assert!(observer.try_recv().is_some());
        assert!(observer.try_recv().is_some());
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = MessageBus::new("s1");
        let factory = MessageFactory::new("s1");
        let mut runtime = bus.subscribe("runtime", Target::Session, false).await.unwrap();

        for n in 0..5 {
            bus.publish(ack(&factory, n)).await.unwrap();
        }
        for n in 0..5 {
            let env = runtime.recv().await.unwrap();
            match env.body {
                crate::message::Body::AgentOutput(chunk) => assert_eq!(chunk.seq, n),
                other => panic!("unexpected body {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_foreign_session_and_closed_bus() {
        let bus = MessageBus::new("s1");
        let other = MessageFactory::new("s2");
        let err = bus.publish(other.user_input(UserInput::text("x"))).await.unwrap_err();
        assert!(matches!(err, BusError::SessionMismatch { .. }));

        let factory = MessageFactory::new("s1");
        let mut runtime = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        bus.close().await;
        assert_eq!(
            bus.publish(factory.user_input(UserInput::text("x"))).await.unwrap_err(),
            BusError::Closed
        );
        assert!(runtime.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_filter_and_unsubscribe() {
        let bus = MessageBus::new("s1");
        assert!(matches!(
            bus.subscribe("x", Target::Broadcast, false).await,
            Err(BusError::InvalidFilter(_))
        ));

        let mut sub = bus.subscribe("a", Target::agent("a"), false).await.unwrap();
        assert!(bus.unsubscribe(sub.handle).await);
        assert!(!bus.unsubscribe(sub.handle).await);
        assert!(sub.recv().await.is_none());

        let factory = MessageFactory::new("s1");
        let delivered = bus.publish(factory.cancel(&"a".to_string(), "t1", None)).await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MessageBus::new("s1");
        let factory = MessageFactory::new("s1");
        let sub = bus.subscribe("runtime", Target::Session, false).await.unwrap();
        drop(sub);

        bus.publish(factory.user_input(UserInput::text("x"))).await.unwrap();
        let stats = bus.stats().await;
        assert!(stats.subscribers.is_empty());
        assert_eq!(stats.published, 1);
    }
}
