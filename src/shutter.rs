//! Source lifecycle primitive: one-shot shutdown with a retrievable
//! cause and an awaitable termination signal.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Shared termination state for a running source.
///
/// The first `shutdown` call wins; every later call is a no-op. A
/// `None` cause is a clean stop. All exit paths of a source must go
/// through its shutter so waiters always observe the cause.
pub struct Shutter {
    cause: Mutex<Option<Arc<anyhow::Error>>>,
    tx: watch::Sender<bool>,
}

impl Shutter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            cause: Mutex::new(None),
            tx,
        }
    }

    /// Trip the shutter. Only the first call records a cause.
    pub fn shutdown(&self, cause: Option<anyhow::Error>) {
        self.shutdown_shared(cause.map(Arc::new));
    }

    /// Trip the shutter with a cause taken from another shutter.
    pub fn shutdown_shared(&self, cause: Option<Arc<anyhow::Error>>) {
        {
            let mut slot = self.cause.lock().expect("shutter lock poisoned");
            if *self.tx.borrow() {
                return;
            }
            *slot = cause;
        }
        self.tx.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.tx.borrow()
    }

    /// Termination cause, if any was given. `None` either means still
    /// running or a clean stop; pair with [`Self::is_terminated`].
    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.cause.lock().expect("shutter lock poisoned").clone()
    }

    /// Completes once the shutter has been tripped.
    pub async fn terminated(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Shutter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn first_cause_wins() {
        let shutter = Shutter::new();
        assert!(!shutter.is_terminated());

        shutter.shutdown(Some(anyhow!("first")));
        shutter.shutdown(Some(anyhow!("second")));

        assert!(shutter.is_terminated());
        assert_eq!(shutter.cause().unwrap().to_string(), "first");
        shutter.terminated().await;
    }

    #[tokio::test]
    async fn waiters_wake_on_shutdown() {
        let shutter = Arc::new(Shutter::new());
        let waiter = {
            let shutter = shutter.clone();
            tokio::spawn(async move { shutter.terminated().await })
        };
        shutter.shutdown(None);
        waiter.await.unwrap();
        assert!(shutter.cause().is_none());
    }
}
