//! Notification hooks for scheduled backups.

use async_trait::async_trait;
use tracing::info;

/// Receives backup success and failure notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    target: Option<String>,
}

impl LogNotifier {
    /// `target` is the configured recipient, recorded on each event.
    pub fn new(target: Option<String>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, message: &str) {
        info!(target_address = ?self.target, subject, message, "notification");
    }
}
