use tokio::sync::watch;
use tracing::{error, warn};

/// Flips a watch channel to `true` on ctrl+c or SIGTERM so long running jobs can stop between
/// units of work.
pub struct ShutdownManager {
    tx: watch::Sender<bool>,
}

impl ShutdownManager {
    /// Installs the signal handlers, must be called from within the runtime
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);

        let ctrl_c_tx = tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("received ctrl+c, finishing in-flight work");
                    ctrl_c_tx.send_replace(true);
                }
                Err(err) => error!("error listening for ctrl+c: {}", err),
            }
        });

        #[cfg(unix)]
        {
            let term_tx = tx.clone();
            tokio::spawn(async move {
                let mut term_signal = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(signal) => signal,
                    Err(err) => {
                        error!("failed to install SIGTERM handler: {}", err);
                        return;
                    }
                };

                term_signal.recv().await;
                warn!("received SIGTERM, finishing in-flight work");
                term_tx.send_replace(true);
            });
        }

        ShutdownManager { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
