//! 参考 SessionManager：成员与会话生命周期的外部协作者

pub mod service;
pub mod store;

pub use service::{AgentCatalog, SessionManagerService};
pub use store::{MemorySessionStore, SessionRecord, SessionStatus, SessionStore};
