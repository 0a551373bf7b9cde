use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::config::ApprovalConfig;
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::types::{Node, RunId};

/// A pending request for a human to release one level of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: RunId,
    pub node_ids: Vec<String>,
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

/// Manages pending approval requests with oneshot channels.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish `gate_opened`, return the receiver to await.
    pub async fn request(&self, req: ApprovalRequest) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let event = WorkflowEvent::GateOpened {
            run_id: req.run_id.clone(),
            request_id: req.id.clone(),
            node_ids: req.node_ids.clone(),
            reasons: req.reasons.clone(),
            timestamp: req.timestamp,
        };

        // Subscribers may respond as soon as they see the event.
        self.pending.lock().await.insert(req.id.clone(), (req, tx));
        self.event_bus.publish(event);
        rx
    }

    /// Resolve a pending request. Returns false for unknown ids.
    pub async fn respond(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        let Some((req, tx)) = entry else {
            return false;
        };
        info!(
            run_id = %req.run_id,
            request_id,
            approved = matches!(decision, ApprovalDecision::Approved),
            "Approval resolved"
        );
        // The waiter may already have timed out.
        let _ = tx.send(decision);
        true
    }

    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }

    /// Find a pending request by prefix match on the ID.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        pending.keys().find(|k| k.starts_with(prefix)).cloned()
    }

    async fn forget(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }
}

/// Decides which levels need a human before they run.
///
/// Mandatory approval covers configured node ids and types plus nodes
/// flagged `requires_approval`. Smart approval escalates risky nodes,
/// nodes whose label hits a configured keyword, and any level that follows
/// a level with failures. Either source opening is enough; all reasons are
/// reported.
pub struct ApprovalGate {
    config: ApprovalConfig,
    broker: Arc<ApprovalBroker>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig, broker: Arc<ApprovalBroker>) -> Self {
        Self { config, broker }
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn mandatory_reasons(&self, node: &Node) -> Vec<String> {
        let mut reasons = Vec::new();
        if node.flag("requires_approval") {
            reasons.push(format!("{}: marked requires_approval", node.id));
        }
        if self.config.mandatory_nodes.iter().any(|id| id == &node.id) {
            reasons.push(format!("{}: mandatory checkpoint node", node.id));
        }
        if self
            .config
            .mandatory_types
            .iter()
            .any(|t| t == node.node_type.as_str())
        {
            reasons.push(format!(
                "{}: mandatory checkpoint type '{}'",
                node.id,
                node.node_type.as_str()
            ));
        }
        reasons
    }

    pub fn smart_reasons(&self, node: &Node, previous_level_failed: bool) -> Vec<String> {
        if !self.config.smart {
            return Vec::new();
        }
        let mut reasons = Vec::new();
        if node.flag("risky") {
            reasons.push(format!("{}: risky", node.id));
        }
        if previous_level_failed {
            reasons.push(format!("{}: previous level had failures", node.id));
        }
        let label = node.label.to_lowercase();
        if let Some(keyword) = self
            .config
            .smart_keywords
            .iter()
            .find(|k| !k.is_empty() && label.contains(&k.to_lowercase()))
        {
            reasons.push(format!("{}: label mentions '{}'", node.id, keyword));
        }
        reasons
    }

    /// All reasons for holding `nodes`; empty means the level may run.
    pub fn evaluate(&self, nodes: &[Node], previous_level_failed: bool) -> Vec<String> {
        nodes
            .iter()
            .flat_map(|n| {
                let mut reasons = self.mandatory_reasons(n);
                reasons.extend(self.smart_reasons(n, previous_level_failed));
                reasons
            })
            .collect()
    }

    /// Ask for approval of `nodes` and wait for the answer. A timeout or a
    /// dropped request counts as a denial.
    pub async fn request_approval(
        &self,
        run_id: &RunId,
        nodes: &[Node],
        reasons: Vec<String>,
        cancel: &CancellationToken,
    ) -> ApprovalDecision {
        let req = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            node_ids: nodes.iter().map(|n| n.id.clone()).collect(),
            reasons,
            timestamp: Utc::now(),
        };
        let request_id = req.id.clone();
        info!(run_id = %run_id, request_id = %request_id, nodes = req.node_ids.len(), "Approval requested");
        let rx = self.broker.request(req).await;

        let wait = async {
            match self.config.timeout_secs {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), rx).await {
                    Ok(r) => r.ok(),
                    Err(_) => {
                        warn!(run_id = %run_id, request_id = %request_id, "Approval timed out");
                        None
                    }
                },
                None => rx.await.ok(),
            }
        };
        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            d = wait => d,
        };

        match decision {
            Some(d) => d,
            None => {
                self.broker.forget(&request_id).await;
                ApprovalDecision::Denied {
                    reason: "no decision received".into(),
                }
            }
        }
    }
}

/// Caller-side handle to steer a running run.
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: AtomicBool,
    feedback: std::sync::Mutex<Option<String>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop at the next level boundary.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear a pause request; returns whether one was pending.
    pub fn clear_pause(&self) -> bool {
        self.paused.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Guidance handed to retries of failing nodes.
    pub fn set_feedback(&self, feedback: impl Into<String>) {
        let mut slot = match self.feedback.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(feedback.into());
    }

    pub fn feedback(&self) -> Option<String> {
        match self.feedback.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
