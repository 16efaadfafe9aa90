//! Agora - 多智能体会话编排层
//!
//! 模块划分：
//! - **message**: 信封模型、消息工厂、会话消息总线
//! - **session**: 会话运行时 actor（轮次、取消、成员事务、交接）与多会话 Hub
//! - **agent**: Agent 能力抽象、总线契约执行器、Echo Agent、启动器
//! - **manager**: 参考 SessionManager 与会话存储
//! - **frontend**: 前端一侧的类型化端口
//! - **observability**: 日志初始化、信封日志与会话记录观察者
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭

pub mod agent;
pub mod config;
pub mod core;
pub mod frontend;
pub mod manager;
pub mod message;
pub mod observability;
pub mod session;

pub use frontend::FrontendPort;
pub use message::{Envelope, MessageBus, MessageFactory};
pub use session::{SessionHub, SessionRuntime, SessionRuntimeHandle, SessionSnapshot};
