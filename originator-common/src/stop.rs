//! Cooperative shutdown signalling.
//!
//! A [`StopController`] owns the "stopping" flag; [`StopToken`]s are handed
//! to workers, which either poll [`StopToken::is_stopping`] between units of
//! work or await [`StopToken::stopped`] inside a `select!`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

#[derive(Debug)]
struct Shared {
    stopping: AtomicBool,
    tx: watch::Sender<bool>,
}

/// Broadcast stop signal with a wait primitive.
///
/// Unlike a `broadcast` channel, a subscriber that arrives after the signal
/// fired still observes it.
#[derive(Debug, Clone)]
pub struct StopController {
    shared: Arc<Shared>,
}

impl Default for StopController {
    fn default() -> Self {
        Self::new()
    }
}

impl StopController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                stopping: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Signal all tokens. Idempotent.
    pub fn stop(&self, reason: &str) {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            tracing::info!(reason, "stop requested");
            // send_replace never fails even with zero receivers
            self.shared.tx.send_replace(true);
        }
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Arc::clone(&self.shared),
            rx: self.shared.tx.subscribe(),
        }
    }
}

/// Per-worker handle onto a [`StopController`].
#[derive(Debug, Clone)]
pub struct StopToken {
    shared: Arc<Shared>,
    rx: watch::Receiver<bool>,
}

impl StopToken {
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Resolves when the controller fires, immediately if it already has.
    pub async fn stopped(&mut self) {
        if self.is_stopping() {
            return;
        }
        // The controller outlives its tokens, so wait_for only errors after
        // the shared sender is dropped, at which point the flag is settled.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
