use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::types::{EntityRef, RunId};

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single run. Lines are flushed as they are written, so a crash loses at
/// most the entry in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run summary, 2 = per node, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log on a background task, so no event published
    /// after this call is missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    /// Write entries until cancellation or the run's `run_finished` event.
    /// Returns the log file path, or `None` when it could not be opened.
    pub async fn run(
        self,
        mut rx: Receiver<WorkflowEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, WorkflowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |node_id: Option<&str>, detail: serde_json::Value| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event.name().to_string(),
            node_id: node_id.map(String::from),
            detail: Some(detail),
        };

        match event {
            // L1: run summary
            WorkflowEvent::StateChanged {
                entity: EntityRef::Run { .. },
                from,
                to,
                reason,
                ..
            } => Some(entry(
                None,
                serde_json::json!({ "from": from, "to": to, "reason": reason }),
            )),
            WorkflowEvent::GateOpened {
                node_ids, reasons, ..
            } => Some(entry(
                None,
                serde_json::json!({ "nodes": node_ids, "reasons": reasons }),
            )),
            WorkflowEvent::RunFinished { state, .. } => {
                Some(entry(None, serde_json::json!({ "state": state })))
            }

            // L2: per node
            WorkflowEvent::NodeStatusChanged {
                node_id, from, to, ..
            } if self.level >= 2 => Some(entry(
                Some(node_id.as_str()),
                serde_json::json!({ "from": from, "to": to }),
            )),
            WorkflowEvent::DagUpdated {
                added_nodes,
                node_count,
                edge_count,
                ..
            } if self.level >= 2 => Some(entry(
                None,
                serde_json::json!({
                    "added": truncate_list(added_nodes, 20),
                    "nodes": node_count,
                    "edges": edge_count,
                }),
            )),
            WorkflowEvent::CheckpointSaved {
                step_number, kind, ..
            } if self.level >= 2 => Some(entry(
                None,
                serde_json::json!({ "step": step_number, "kind": kind }),
            )),

            // L3: everything else
            WorkflowEvent::RetryStarted {
                node_id,
                attempt,
                category,
                backoff_secs,
                ..
            } if self.level >= 3 => Some(entry(
                Some(node_id.as_str()),
                serde_json::json!({
                    "attempt": attempt,
                    "category": category,
                    "backoff_secs": backoff_secs,
                }),
            )),
            WorkflowEvent::StateChanged {
                entity, from, to, reason, ..
            } if self.level >= 3 => Some(entry(
                entity.node_id(),
                serde_json::json!({ "from": from, "to": to, "reason": reason }),
            )),

            _ => None,
        }
    }
}

fn truncate_list(items: &[String], max_len: usize) -> Vec<&str> {
    items.iter().take(max_len).map(String::as_str).collect()
}
