//! 优雅关闭
//!
//! 根 CancellationToken 由信号或输入结束触发；交互轮次派生子 token，调度器在 stop 时
//! 取消自己的轮询 token。只记录第一次关闭原因。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// /quit 或标准输入结束
    UserInitiated,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

pub struct ShutdownManager {
    root: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 派生给单轮对话的 token
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 触发关闭；重复调用只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
                tracing::info!(?reason, "shutdown requested");
            }
        }
        self.root.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| *slot)
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    /// 后台监听 Ctrl+C 与 SIGTERM（非 unix 平台只有 Ctrl+C）
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.wait_for_shutdown() => return,
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => ShutdownReason::Interrupt,
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                        return;
                    }
                },
                _ = terminate_signal() => ShutdownReason::Terminate,
            };
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
