// =============================================================================
// Shutdown signalling — a `watch` channel flipped once from `false` to `true`
// when the Controller stops a session. Every spawned task holds a receiver
// and observes it at its next suspension point (`select!` against I/O or a
// timer), never mid-critical-section.
// =============================================================================

use tokio::sync::watch;

pub type ShutdownSignal = watch::Receiver<bool>;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Idempotent: firing twice is a no-op the second time.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receivers_observe_shutdown_exactly_once_changed() {
        let (handle, mut rx) = ShutdownHandle::new();
        handle.signal();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn signalling_twice_is_harmless() {
        let (handle, _rx) = ShutdownHandle::new();
        handle.signal();
        handle.signal();
    }
}
