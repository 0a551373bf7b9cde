use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::traits::EventSink;
use crate::types::{CheckpointKind, EntityRef, ErrorCategory, RunId, RunState};

/// Structured notification emitted by the orchestration core.
///
/// Every variant is small and serde-serializable so sinks can relay it over
/// any transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StateChanged {
        entity: EntityRef,
        from: String,
        to: String,
        reason: String,
        actor: String,
        timestamp: DateTime<Utc>,
    },
    NodeStatusChanged {
        run_id: RunId,
        node_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    DagUpdated {
        run_id: RunId,
        added_nodes: Vec<String>,
        node_count: usize,
        edge_count: usize,
        timestamp: DateTime<Utc>,
    },
    RetryStarted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        category: ErrorCategory,
        backoff_secs: u64,
        timestamp: DateTime<Utc>,
    },
    CheckpointSaved {
        run_id: RunId,
        checkpoint_id: String,
        step_number: u32,
        kind: CheckpointKind,
        timestamp: DateTime<Utc>,
    },
    GateOpened {
        run_id: RunId,
        request_id: String,
        node_ids: Vec<String>,
        reasons: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        state: RunState,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::NodeStatusChanged { .. } => "node_status_changed",
            Self::DagUpdated { .. } => "dag_updated",
            Self::RetryStarted { .. } => "retry_started",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::GateOpened { .. } => "gate_opened",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::StateChanged { entity, .. } => entity.run_id(),
            Self::NodeStatusChanged { run_id, .. }
            | Self::DagUpdated { run_id, .. }
            | Self::RetryStarted { run_id, .. }
            | Self::CheckpointSaved { run_id, .. }
            | Self::GateOpened { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Event bus using a tokio broadcast channel plus synchronous sinks.
///
/// Broadcast subscribers receive all events. Registered sinks are invoked in
/// registration order after the triggering change has committed; a failing
/// or panicking sink is logged and skipped.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = match self.sinks.read() {
            Ok(sinks) => sinks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(sink = sink.name(), event = event.name(), error = %e, "Event sink failed");
                }
                Err(_) => {
                    warn!(sink = sink.name(), event = event.name(), "Event sink panicked");
                }
            }
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, WeftError};
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl EventSink for Recorder {
        fn on_event(&self, event: &WorkflowEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.name().to_string());
            Ok(())
        }
    }

    struct Failing;

    impl EventSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_event(&self, _event: &WorkflowEvent) -> Result<()> {
            Err(WeftError::TrackingDegraded("relay offline".into()))
        }
    }

    struct Panicking;

    impl EventSink for Panicking {
        fn on_event(&self, _event: &WorkflowEvent) -> Result<()> {
            panic!("observer bug");
        }
    }

    fn finished() -> WorkflowEvent {
        WorkflowEvent::RunFinished {
            run_id: RunId::from_str("r1"),
            state: RunState::Completed,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn failing_sinks_do_not_block_later_sinks() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.register(Arc::new(Failing));
        bus.register(Arc::new(Panicking));
        bus.register(recorder.clone());

        bus.publish(finished());

        assert_eq!(*recorder.0.lock().unwrap(), vec!["run_finished"]);
    }

    #[tokio::test]
    async fn broadcast_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(finished());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "run_finished");
        assert_eq!(event.run_id().as_str(), "r1");
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(finished()).unwrap();
        assert_eq!(json["event"], "run_finished");
        assert_eq!(json["state"], "completed");
    }
}
