//! Best-effort audit notification.
//!
//! A notifier forwards each appended entry somewhere else (mail, a queue,
//! a pager). Delivery failures never fail the append that triggered them.

use async_trait::async_trait;
use tokio::sync::mpsc;

use keyward_store::AuditRecord;

use crate::error::NotificationError;

/// Forwards audit entries.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one entry.
    async fn notify(&self, entry: &AuditRecord) -> Result<(), NotificationError>;
}

/// Pushes entries into a bounded channel without waiting.
///
/// A full queue is reported as unavailable rather than applying
/// backpressure to the audit log.
pub struct ChannelNotifier {
    tx: mpsc::Sender<AuditRecord>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, entry: &AuditRecord) -> Result<(), NotificationError> {
        self.tx.try_send(entry.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                NotificationError::Unavailable("notification queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => NotificationError::Closed,
        })
    }
}
