//! Per-run execution event capture.
//!
//! The active [`EventCaptor`] is a tokio task-local. Code inside
//! [`EventCaptor::scope`] records into it through [`EventCaptor::emit`];
//! spawned tasks do not inherit task-locals, so spawn sites wrap their
//! futures in [`EventCaptor::propagate`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::Either;
use serde_json::Value;
use tracing::warn;

use weft_core::error::Result;
use weft_core::event::WorkflowEvent;
use weft_core::traits::{EventSink, RunStore};
use weft_core::types::{ExecutionEventRecord, RunId};

tokio::task_local! {
    static CURRENT: EventCaptor;
}

struct Inner {
    run_id: RunId,
    store: Arc<dyn RunStore>,
    seq: AtomicU64,
}

/// Handle that appends execution events of one run to the event arena.
#[derive(Clone)]
pub struct EventCaptor {
    inner: Arc<Inner>,
}

impl EventCaptor {
    /// Create a captor whose numbering continues after any events the run
    /// already has.
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>) -> Self {
        let last = match store.events(&run_id) {
            Ok(events) => events.last().map(|e| e.seq).unwrap_or(0),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not read event arena");
                0
            }
        };
        Self {
            inner: Arc::new(Inner {
                run_id,
                store,
                seq: AtomicU64::new(last),
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    /// Run `fut` with this captor installed.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    pub fn current() -> Option<EventCaptor> {
        CURRENT.try_with(|c| c.clone()).ok()
    }

    /// Carry the caller's captor, if any, into a future that will be
    /// spawned onto another task.
    pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
        match Self::current() {
            Some(captor) => Either::Left(CURRENT.scope(captor, fut)),
            None => Either::Right(fut),
        }
    }

    /// Append one event and return its sequence number. Store failures are
    /// logged, never raised.
    pub fn record(
        &self,
        event_type: &str,
        node_id: Option<&str>,
        payload: Value,
        parent_seq: Option<u64>,
    ) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ExecutionEventRecord {
            run_id: self.inner.run_id.clone(),
            seq,
            parent_seq,
            node_id: node_id.map(String::from),
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.store.append_event(&record) {
            warn!(run_id = %self.inner.run_id, seq, error = %e, "Failed to capture event");
        }
        seq
    }

    /// Record into the current captor. No-op outside a captor scope.
    pub fn emit(
        event_type: &str,
        node_id: Option<&str>,
        payload: Value,
        parent_seq: Option<u64>,
    ) -> Option<u64> {
        CURRENT
            .try_with(|c| c.record(event_type, node_id, payload, parent_seq))
            .ok()
    }

    /// Direct children of `parent_seq`; `None` lists the roots.
    pub fn children(&self, parent_seq: Option<u64>) -> Result<Vec<ExecutionEventRecord>> {
        Ok(self
            .inner
            .store
            .events(&self.inner.run_id)?
            .into_iter()
            .filter(|e| e.parent_seq == parent_seq)
            .collect())
    }

    /// `seq` and every event beneath it, in sequence order.
    pub fn subtree(&self, seq: u64) -> Result<Vec<ExecutionEventRecord>> {
        let events = self.inner.store.events(&self.inner.run_id)?;
        let mut keep = vec![seq];
        let mut out = Vec::new();
        // Children always carry a larger seq than their parent.
        for event in events {
            let within = event.seq == seq
                || event.parent_seq.map(|p| keep.contains(&p)).unwrap_or(false);
            if within {
                if event.seq != seq {
                    keep.push(event.seq);
                }
                out.push(event);
            }
        }
        Ok(out)
    }
}

/// Mirrors bus events of the captor's run into the arena as root events.
impl EventSink for EventCaptor {
    fn name(&self) -> &str {
        "event_captor"
    }

    fn on_event(&self, event: &WorkflowEvent) -> Result<()> {
        if event.run_id() != &self.inner.run_id {
            return Ok(());
        }
        let node_id = match event {
            WorkflowEvent::NodeStatusChanged { node_id, .. }
            | WorkflowEvent::RetryStarted { node_id, .. } => Some(node_id.as_str()),
            WorkflowEvent::StateChanged { entity, .. } => entity.node_id(),
            _ => None,
        };
        self.record(event.name(), node_id, serde_json::to_value(event)?, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use weft_core::types::Run;
    use weft_store::SqliteStore;

    fn captor() -> (Arc<SqliteStore>, EventCaptor) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run = Run::new("one_shot", "t", PathBuf::from("/tmp/cap"));
        store.insert_run(&run).unwrap();
        let captor = EventCaptor::new(run.id, store.clone());
        (store, captor)
    }

    #[test]
    fn emit_outside_scope_is_noop() {
        assert!(EventCaptor::current().is_none());
        assert_eq!(EventCaptor::emit("x", None, Value::Null, None), None);
    }

    #[tokio::test]
    async fn scoped_events_form_a_tree() {
        let (_store, captor) = captor();
        let root = captor
            .clone()
            .scope(async {
                let root = EventCaptor::emit("level_started", None, json!({"level": 0}), None).unwrap();
                EventCaptor::emit("task_started", Some("a"), Value::Null, Some(root));
                let b = EventCaptor::emit("task_started", Some("b"), Value::Null, Some(root)).unwrap();
                EventCaptor::emit("task_finished", Some("b"), Value::Null, Some(b));
                root
            })
            .await;

        assert_eq!(root, 1);
        let children = captor.children(Some(root)).unwrap();
        assert_eq!(children.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(captor.subtree(root).unwrap().len(), 4);
        assert_eq!(captor.children(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn propagate_reaches_spawned_tasks() {
        let (store, captor) = captor();
        let run_id = captor.run_id().clone();
        captor
            .scope(async {
                let handles: Vec<_> = (0..4)
                    .map(|i| {
                        tokio::spawn(EventCaptor::propagate(async move {
                            EventCaptor::emit("task", Some(&format!("t{}", i)), Value::Null, None)
                        }))
                    })
                    .collect();
                for h in handles {
                    assert!(h.await.unwrap().is_some());
                }
                // Without propagation the spawned task sees no captor.
                let bare = tokio::spawn(async { EventCaptor::current().is_some() });
                assert!(!bare.await.unwrap());
            })
            .await;

        let mut seqs: Vec<u64> = store.events(&run_id).unwrap().iter().map(|e| e.seq).collect();
        seqs.sort();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn numbering_continues_for_a_new_captor() {
        let (store, captor) = captor();
        captor.record("a", None, Value::Null, None);
        captor.record("b", None, Value::Null, None);
        let again = EventCaptor::new(captor.run_id().clone(), store);
        assert_eq!(again.record("c", None, Value::Null, None), 3);
    }
}
