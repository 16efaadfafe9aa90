//! 可观测性：日志初始化与总线观察者
//!
//! 观察者以广播方式订阅总线，只读不写，不参与任何编排决策。

pub mod logger;
pub mod transcript;

pub use logger::EnvelopeLogger;
pub use transcript::{Speaker, Transcript, TranscriptEntry, TranscriptRecorder};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing subscriber：默认 info，可通过 RUST_LOG 覆盖
///
/// 日志写到 stderr，stdout 留给演示程序的会话输出。重复调用时忽略。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
