//! 进程级关闭
//!
//! Ctrl+C / SIGTERM / 主动退出都归结为一次 `Shutdown::trigger`：取消根 token（各会话的 token 都是它的子 token），
//! 然后在限时内拆除 Hub 上剩下的会话。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::SessionHub;

/// 关闭原因；只记录第一次触发
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// /quit 或主循环正常结束
    UserQuit,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserQuit => write!(f, "user quit"),
            ShutdownReason::Interrupt => write!(f, "interrupted"),
            ShutdownReason::Terminate => write!(f, "terminated"),
            ShutdownReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason,
        }
    }

    /// 根 token；交给 `SessionHub::with_shutdown`
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭，返回是否为第一次
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            info!(%reason, "shutdown requested");
        }
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// 后台监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let shutdown = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    shutdown.trigger(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// 跑 `app` 直到它结束或收到关闭信号，然后限时拆除 Hub 上的会话
pub async fn serve_until_shutdown<F>(shutdown: &Shutdown, hub: &SessionHub, drain_timeout: Duration, app: F) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = app => {
            shutdown.trigger(ShutdownReason::UserQuit);
        }
        _ = shutdown.triggered() => {}
    }

    let open = hub.len().await;
    if open > 0 {
        info!("draining {} sessions", open);
    }
    if tokio::time::timeout(drain_timeout, hub.shutdown_all()).await.is_err() {
        warn!("sessions still draining after {:?}, giving up", drain_timeout);
    }

    shutdown.reason().unwrap_or(ShutdownReason::UserQuit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn hub(shutdown: &Shutdown) -> SessionHub {
        let mut config = AppConfig::default();
        config.observability.log_envelopes = false;
        SessionHub::from_config(&config).with_shutdown(shutdown.token())
    }

    #[test]
    fn test_first_reason_wins() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger(ShutdownReason::Fatal("bus".into())));
        assert!(!shutdown.trigger(ShutdownReason::Interrupt));
        assert!(token.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Fatal("bus".into())));
    }

    #[tokio::test]
    async fn test_app_exit_drains_sessions() {
        let shutdown = Shutdown::new();
        let hub = hub(&shutdown);
        let session = hub.open("s1").await.unwrap();

        let reason = serve_until_shutdown(&shutdown, &hub, Duration::from_secs(2), async {}).await;
        assert_eq!(reason, ShutdownReason::UserQuit);
        assert!(hub.is_empty().await);
        assert!(session.bus().is_closed().await);
        assert!(session.runtime().snapshot().phase == crate::session::SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_trigger_interrupts_running_app() {
        let shutdown = Shutdown::new();
        let hub = hub(&shutdown);
        hub.open("s1").await.unwrap();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger(ShutdownReason::Terminate);
        });
        let app = std::future::pending::<()>();
        let reason = serve_until_shutdown(&shutdown, &hub, Duration::from_secs(2), app).await;
        assert_eq!(reason, ShutdownReason::Terminate);
        assert!(hub.is_empty().await);
    }
}
