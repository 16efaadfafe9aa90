//! 核心：错误分类与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{AgentError, BusError, ErrorCode, RuntimeError};
pub use shutdown::{serve_until_shutdown, Shutdown, ShutdownReason};
