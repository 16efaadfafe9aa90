//! 消息层：信封模型、消息工厂、会话消息总线

pub mod body;
pub mod bus;
pub mod envelope;
pub mod factory;

pub use body::{
    AgentProfile, AgentRequest, Body, CancelRequest, Control, ErrorReport, Failure, Notice, OutputChunk, UserInput,
};
pub use bus::{BusStats, MessageBus, Subscription, SubscriptionHandle};
pub use envelope::{AgentId, Envelope, EventKind, Participant, SessionId, Target, TurnId, TxId};
pub use factory::MessageFactory;
