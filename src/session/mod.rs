//! 会话层：上下文、轮次、事务、提及解析、运行时 actor 与多会话 Hub

pub mod context;
pub mod hub;
mod membership;
pub mod mention;
pub mod runtime;
pub mod transaction;
pub mod turn;

pub use context::{SessionContext, SessionPhase, SessionSnapshot};
pub use hub::{Session, SessionHub};
pub use mention::Mention;
pub use runtime::{SessionRuntime, SessionRuntimeHandle};
pub use transaction::{DeferredInput, Transaction, TransactionTable, TxKind, TxStep};
pub use turn::{InflightTurn, TurnExpiry, TurnStatus, TurnTable};
