//! Engine event definitions and EventBus
//!
//! **[GEN-EVT-010]** All generation lifecycle events flow through a single
//! broadcast channel. Consumers (SSE, tests) subscribe; the engine never
//! waits on subscribers, and dropped events are acceptable: the store is
//! the durable truth and progress polling works without the feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// lookgen engine event types
///
/// Events are broadcast via [`EventBus`] and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A generation batch was planned and its dispatch loops started
    BatchStarted {
        /// Batch UUID
        batch_id: Uuid,
        /// Number of Looks with outstanding work in this batch
        look_count: usize,
        /// Total Outputs created for this batch
        total_outputs: u32,
        /// When the batch started
        timestamp: DateTime<Utc>,
    },

    /// Periodic aggregate progress for an active batch
    ///
    /// Emitted by the progress tracker on its own timer. Not persisted;
    /// the same numbers are recomputed on demand for `getProgress`.
    BatchProgress {
        batch_id: Uuid,
        /// Outputs waiting for dispatch
        queued: u32,
        /// Outputs currently generating
        running: u32,
        /// Outputs completed successfully
        done: u32,
        /// Outputs failed
        failed: u32,
        timestamp: DateTime<Utc>,
    },

    /// Every Job in the batch reached a terminal state
    ///
    /// Emitted exactly once per batch, after which the tracker stops polling.
    BatchCompleted {
        batch_id: Uuid,
        /// Terminal batch state (COMPLETED, PARTIAL or FAILED)
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// Batch was cancelled by an operator
    BatchCancelled {
        batch_id: Uuid,
        /// Non-terminal Outputs deleted by the cancellation
        outputs_deleted: u64,
        timestamp: DateTime<Utc>,
    },

    /// One Output produced an artifact
    OutputCompleted {
        batch_id: Uuid,
        output_id: Uuid,
        look_id: Uuid,
        /// View kind the artifact was generated from
        view: String,
        timestamp: DateTime<Utc>,
    },

    /// One Output failed (generation failure, not transport)
    OutputFailed {
        batch_id: Uuid,
        output_id: Uuid,
        look_id: Uuid,
        view: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// An Output has been generating beyond the stall threshold
    ///
    /// Advisory only: the engine never auto-fails a stalled Output.
    /// Operator action (`fail-stalled`) moves it to failed/timeout.
    StallDetected {
        batch_id: Uuid,
        output_id: Uuid,
        look_id: Uuid,
        view: String,
        /// Seconds since the Output last changed state
        age_seconds: i64,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// SSE event name for this variant
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::BatchStarted { .. } => "BatchStarted",
            EngineEvent::BatchProgress { .. } => "BatchProgress",
            EngineEvent::BatchCompleted { .. } => "BatchCompleted",
            EngineEvent::BatchCancelled { .. } => "BatchCancelled",
            EngineEvent::OutputCompleted { .. } => "OutputCompleted",
            EngineEvent::OutputFailed { .. } => "OutputFailed",
            EngineEvent::StallDetected { .. } => "StallDetected",
        }
    }
}

/// Broadcast bus for engine events
///
/// Cheap to clone; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    ///
    /// Old events are dropped once `capacity` unconsumed events queue up
    /// for a subscriber. 100 is plenty for the SSE fan-out; tests use less.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    /// Zero subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(10);
        let delivered = bus.emit(EngineEvent::BatchCancelled {
            batch_id: Uuid::new_v4(),
            outputs_deleted: 0,
            timestamp: Utc::now(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        let batch_id = Uuid::new_v4();
        bus.emit(EngineEvent::BatchCompleted {
            batch_id,
            state: "COMPLETED".to_string(),
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::BatchCompleted { batch_id: id, state, .. } => {
                assert_eq!(id, batch_id);
                assert_eq!(state, "COMPLETED");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::BatchProgress {
            batch_id: Uuid::new_v4(),
            queued: 3,
            running: 2,
            done: 1,
            failed: 0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"BatchProgress\""));
        assert_eq!(event.event_type(), "BatchProgress");
    }
}
