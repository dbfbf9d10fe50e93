//! Cooperative cancellation.
//!
//! A `CancellationToken` is threaded through every long-running call and
//! checked only at transition boundaries. Child tokens observe their parent,
//! so the controller can stop the whole run while a worker cancels only its
//! own work after a fatal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

/// Cheaply clonable stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled with this one, but cancellable on its own.
    pub fn child(&self) -> Self {
        CancellationToken {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
            || self
                .state
                .parent
                .as_ref()
                .map(CancellationToken::is_cancelled)
                .unwrap_or(false)
    }

    /// Sleep up to `timeout`, waking early on cancellation.
    ///
    /// Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Signals are received on a background thread running a single-threaded
/// tokio runtime; the thread lives for the rest of the process.
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("safemove-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    match next_signal().await {
                        Ok(name) => {
                            if token.is_cancelled() {
                                warn!(signal = name, "stop already requested, waiting for workers");
                            } else {
                                info!(signal = name, "stop requested, finishing current transitions");
                                token.cancel();
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "failed to listen for signals");
                            return;
                        }
                    }
                }
            })
        })?;
    Ok(())
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
