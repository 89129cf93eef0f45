//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so observers
//! (loggers, a UI, tests) can follow run progress without coupling to the
//! engine or the queue.

use serde::{Deserialize, Serialize};

use autoeval_types::RunStatus;

/// Events emitted over a run's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    RunQueued {
        run_id: String,
        /// Another run held the queue when this one was enqueued.
        queued_behind: bool,
    },
    RunStarted {
        run_id: String,
    },
    StageStarted {
        run_id: String,
        stage: String,
    },
    StageCompleted {
        run_id: String,
        stage: String,
        duration_ms: u64,
    },
    /// Cancellation or a halt skipped `skipped` and everything after it.
    RoutedToFinalize {
        run_id: String,
        after: String,
        skipped: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(RunEvent::StageStarted {
            run_id: "run-1".into(),
            stage: "author_v1".into(),
        });

        match rx.recv().await.unwrap() {
            RunEvent::StageStarted { run_id, stage } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(stage, "author_v1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        let event = RunEvent::RunFinished {
            run_id: "run-1".into(),
            status: RunStatus::Completed,
        };
        emitter.emit(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = EventEmitter::default();
        emitter.emit(RunEvent::RunStarted {
            run_id: "nobody-listening".into(),
        });
    }

    #[test]
    fn events_serialize_with_variant_tag() {
        let json = serde_json::to_value(RunEvent::RoutedToFinalize {
            run_id: "r".into(),
            after: "author_v1".into(),
            skipped: "execute_v1".into(),
        })
        .unwrap();
        assert_eq!(json["RoutedToFinalize"]["skipped"], "execute_v1");
    }
}
