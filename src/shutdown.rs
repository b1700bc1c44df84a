//! Cooperative shutdown signal
//!
//! A cloneable handle over a watch channel. Long-lived tasks either poll
//! [`Shutdown::is_shutdown`] at loop headers or `select!` on
//! [`Shutdown::wait`] next to their blocking work.

use tokio::sync::watch;

/// Create the process-wide shutdown channel.
pub fn channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown { rx })
}

/// Receiving side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. A dropped sender counts as
    /// shutdown so orphaned tasks still terminate.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
