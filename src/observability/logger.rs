//! 信封日志：记录总线上的每一条信封

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::BusError;
use crate::message::{MessageBus, Subscription, Target};

pub struct EnvelopeLogger;

impl EnvelopeLogger {
    /// 以观察者身份订阅，在后台逐条记录，直到 shutdown 或总线关闭
    pub async fn spawn(bus: &MessageBus, shutdown: CancellationToken) -> Result<JoinHandle<u64>, BusError> {
        let inbox = bus.subscribe("envelope_logger", Target::Broadcast, true).await?;
        Ok(tokio::spawn(Self::run(inbox, shutdown)))
    }

    /// 返回记录的条数
    async fn run(mut inbox: Subscription, shutdown: CancellationToken) -> u64 {
        let mut seen = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                env = inbox.recv() => {
                    let Some(env) = env else { break };
                    seen += 1;
                    debug!(
                        target: "agora::envelope",
                        session_id = %env.session_id,
                        event = %env.event(),
                        subtype = env.subtype(),
                        sender = %env.sender,
                        target = %env.target,
                        turn_id = env.turn_id.as_deref().unwrap_or("-"),
                        tx_id = env.tx_id.as_deref().unwrap_or("-"),
                        "{}",
                        env.id
                    );
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFactory, UserInput};

    #[tokio::test]
    async fn test_logger_sees_every_envelope_without_counting_as_delivery() {
        let bus = MessageBus::new("s1");
        let token = CancellationToken::new();
        let join = EnvelopeLogger::spawn(&bus, token.clone()).await.unwrap();

        let factory = MessageFactory::new("s1");
        // 没有常规订阅者：观察者不计入投递数
        let delivered = bus.publish(factory.user_input(UserInput::text("a"))).await.unwrap();
        assert_eq!(delivered, 0);
        bus.publish(factory.agent_output("x", "t1", 0, "b", true)).await.unwrap();

        bus.close().await;
        assert_eq!(join.await.unwrap(), 2);
    }
}
