//! Application ownership notifications.

use tokio::sync::mpsc;
use tracing::debug;
use ufleet_core::AppEvent;

/// Sending half of the unbounded application event stream. Sends never
/// block; a closed receiver drops the event.
#[derive(Debug, Clone)]
pub struct AppNotifier {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl AppNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, event: AppEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(resource = %e.0.resource, "application tracker gone; event dropped");
        }
    }
}
