//! Shutdown signal plumbing for worker tasks.
use tokio::sync::broadcast;

/// Listens for the server-wide shutdown broadcast. Each worker holds one;
/// the signal is the sender side being dropped or a message being sent.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// true once the signal has been observed
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Wait for the shutdown notice; returns immediately if already seen.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // Err means the sender was dropped, which also signals shutdown
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
