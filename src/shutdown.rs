//! 进程关闭协调：系统信号与通知流中断都汇入同一个关闭信号
//!
//! 只记录第一个触发原因；CLI 在 `ApiSession::close()` 之后根据原因决定退出码。

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// 通知循环以错误结束，携带错误描述
    StreamFailed(String),
}

impl ShutdownReason {
    /// 是否应以失败退出
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::StreamFailed(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupted => f.write_str("interrupted"),
            ShutdownReason::Terminated => f.write_str("terminated"),
            ShutdownReason::StreamFailed(err) => write!(f, "notification stream failed: {err}"),
        }
    }
}

/// 可克隆的关闭信号，克隆体共享同一状态
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭；已触发过则忽略本次原因并返回 false
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// 第一个触发原因；尚未触发时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 等待关闭被触发并返回原因
    pub async fn triggered(&self) -> Option<ShutdownReason> {
        self.token.cancelled().await;
        self.reason()
    }

    /// 后台监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, closing session");
                signal.trigger(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let signal = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                match unix_signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, closing session");
                        signal.trigger(ShutdownReason::Terminated);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler unavailable: {}", e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untriggered_signal_has_no_reason() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert!(signal.trigger(ShutdownReason::StreamFailed("ESID".to_string())));
        assert!(!signal.clone().trigger(ShutdownReason::Interrupted));
        let reason = signal.reason().unwrap();
        assert_eq!(reason, ShutdownReason::StreamFailed("ESID".to_string()));
        assert!(reason.is_failure());
        assert_eq!(reason.to_string(), "notification stream failed: ESID");
    }

    #[tokio::test]
    async fn test_triggered_wakes_waiter_with_reason() {
        let signal = ShutdownSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.triggered().await }
        });
        tokio::task::yield_now().await;

        signal.trigger(ShutdownReason::Terminated);
        let reason = waiter.await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Terminated);
        assert!(!reason.is_failure());
    }
}
