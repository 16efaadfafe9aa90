//! Agent 侧：能力抽象、总线契约执行器、内置 Echo 实现与启动器

pub mod echo;
pub mod launcher;
pub mod traits;
pub mod worker;

pub use echo::EchoAgent;
pub use launcher::{AgentFactory, AgentLauncher, ExternalAgentLauncher, LocalAgentLauncher};
pub use traits::{Agent, AgentInput, HandoverNote, OutputStream};
pub use worker::AgentWorker;
