//! Signal handling for the CLI.
//!
//! SIGINT (Ctrl-C) and, on POSIX, SIGTERM cancel the running monitor. The
//! monitor then kills the child's tree and reports `Cancelled`, so the child
//! is never left orphaned by an interrupted `procwatch`.

use crate::cancel::CancelToken;
use std::future::Future;
use tokio::task::JoinHandle;

pub struct SignalHandler {
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Spawn a task that cancels `token` on the first shutdown signal.
    pub fn install(token: CancelToken) -> SignalHandler {
        SignalHandler {
            task: tokio::spawn(cancel_on(shutdown_signal(), token)),
        }
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait for `signal` to resolve, then cancel `token`.
pub async fn cancel_on<F>(signal: F, token: CancelToken)
where
    F: Future<Output = ()>,
{
    signal.await;
    tracing::info!("shutdown signal received, cancelling monitored process");
    token.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
