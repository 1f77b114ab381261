//! Job event stream for observers.
//!
//! The driver emits [`JobEvent`]s on a [`tokio::sync::broadcast`] channel so
//! loggers, progress displays and tests can follow a job without touching the
//! engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted while driving a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    JobStarted {
        item: String,
        workspace: String,
        resumed: bool,
    },
    StageSkipped {
        stage: String,
    },
    StageStarted {
        stage: String,
        attempt: usize,
    },
    StageCompleted {
        stage: String,
        attempts: usize,
        duration_ms: u64,
    },
    StageFailed {
        stage: String,
        attempts: usize,
        critical: bool,
        error: String,
    },
    JournalSaved {
        stage: String,
    },
    WorkspaceRenamed {
        from: String,
        to: String,
    },
    ItemFinalized {
        item: String,
        status: String,
    },
    WorkspaceDeleted {
        workspace: String,
    },
    JobCompleted {
        item: String,
        duration_ms: u64,
    },
    JobHalted {
        item: String,
        stage: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<JobEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers; dropped if nobody listens.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(JobEvent::StageStarted {
            stage: "fetch".into(),
            attempt: 1,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::StageStarted {
                stage: "fetch".into(),
                attempt: 1
            }
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(JobEvent::JournalSaved {
            stage: "merge".into(),
        });

        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let emitter = EventEmitter::new(4);
        emitter.emit(JobEvent::JobHalted {
            item: "Book".into(),
            stage: "upload".into(),
            error: "503".into(),
        });
    }

    #[test]
    fn events_serialize_with_variant_name() {
        let json = serde_json::to_string(&JobEvent::WorkspaceDeleted {
            workspace: "/w/a".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"WorkspaceDeleted":{"workspace":"/w/a"}}"#);
    }
}
