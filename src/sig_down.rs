//! Maps process signals onto a cancellation token.
//!
//! SIGINT and SIGTERM both trigger the same token; every long-lived task
//! and both HTTP servers watch it for graceful shutdown.

use std::io;

use tokio_util::sync::CancellationToken;

pub struct SigDown {
    token: CancellationToken,
}

impl SigDown {
    pub fn try_new() -> io::Result<Self> {
        let token = CancellationToken::new();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut terminate = signal(SignalKind::terminate())?;
            let cancel = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            tracing::error!(error = %err, "failed to listen for SIGINT");
                        }
                    }
                    _ = terminate.recv() => {}
                }
                tracing::info!("shutdown signal received");
                cancel.cancel();
            });
        }

        #[cfg(not(unix))]
        {
            let cancel = token.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "failed to listen for ctrl-c");
                }
                tracing::info!("shutdown signal received");
                cancel.cancel();
            });
        }

        Ok(SigDown { token })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
