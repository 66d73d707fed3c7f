//! Asynchronous notification of procedure step status transitions.
//!
//! Handlers publish a [`StatusEvent`] after each successful create or
//! update; a background task fans the events out to a listener without
//! blocking the association that triggered them.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::mpps::PpsStatus;

/// A committed status transition of one performed procedure step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// SOP Instance UID of the affected procedure step.
    pub sop_instance_uid: String,
    /// Status after the transition was persisted.
    pub status: PpsStatus,
}

/// Consumer of procedure step status transitions.
#[async_trait]
pub trait StudyStatusListener: Send + Sync {
    async fn on_status(&self, event: StatusEvent);
}

/// Listener that records transitions in the log.
#[derive(Debug, Default)]
pub struct LogStatusListener;

#[async_trait]
impl StudyStatusListener for LogStatusListener {
    async fn on_status(&self, event: StatusEvent) {
        info!(
            uid = %event.sop_instance_uid,
            status = %event.status,
            "procedure step status changed"
        );
    }
}

/// Spawn a delivery task feeding `listener` from a bounded channel.
///
/// Returns the sender handed to the services and the join handle of the
/// delivery task. The task ends once every sender is dropped.
pub fn status_channel(
    listener: Box<dyn StudyStatusListener>,
    capacity: usize,
) -> (mpsc::Sender<StatusEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<StatusEvent>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            listener.on_status(event).await;
        }
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingListener {
        seen: std::sync::Arc<Mutex<Vec<StatusEvent>>>,
    }

    #[async_trait]
    impl StudyStatusListener for RecordingListener {
        async fn on_status(&self, event: StatusEvent) {
            self.seen.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_events_reach_listener() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let (tx, handle) = status_channel(
            Box::new(RecordingListener { seen: seen.clone() }),
            8,
        );

        tx.send(StatusEvent {
            sop_instance_uid: "1.2.3".into(),
            status: PpsStatus::InProgress,
        })
        .await
        .unwrap();
        tx.send(StatusEvent {
            sop_instance_uid: "1.2.3".into(),
            status: PpsStatus::Completed,
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].status, PpsStatus::Completed);
    }
}
