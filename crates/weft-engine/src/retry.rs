use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::config::RetryConfig;
use weft_core::error::Result;
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::traits::RunStore;
use weft_core::types::{AttemptOutcome, ErrorCategory, Node, RetryAttempt, RunId};

/// Classification rules, checked in order. Earlier rules win.
const RULES: &[(ErrorCategory, &str)] = &[
    (
        ErrorCategory::RateLimit,
        r"(?i)rate.?limit|too many requests|\b429\b|quota exceeded",
    ),
    (
        ErrorCategory::Timeout,
        r"(?i)timed? ?out|timeout|deadline exceeded",
    ),
    (
        ErrorCategory::Network,
        r"(?i)connection (refused|reset|aborted|closed)|network|\bdns\b|unreachable|broken pipe|econn",
    ),
    (
        ErrorCategory::Permission,
        r"(?i)permission denied|access denied|forbidden|\b403\b|eacces|not permitted",
    ),
    (
        ErrorCategory::FileNotFound,
        r"(?i)no such file|file not found|filenotfounderror|enoent",
    ),
    (
        ErrorCategory::Import,
        r"(?i)importerror|modulenotfounderror|no module named|cannot import|unresolved import",
    ),
    (
        ErrorCategory::Syntax,
        r"(?i)syntax ?error|invalid syntax|unexpected token|parse error",
    ),
    (
        ErrorCategory::Type,
        r"(?i)type ?error|mismatched types|expected type",
    ),
    (
        ErrorCategory::Value,
        r"(?i)value ?error|invalid value|could not convert",
    ),
    (
        ErrorCategory::Key,
        r"(?i)key ?error|key not found|missing key",
    ),
    (
        ErrorCategory::Index,
        r"(?i)index ?error|index out of (range|bounds)",
    ),
    (
        ErrorCategory::Attribute,
        r"(?i)attribute ?error|has no attribute|no (field|method) named",
    ),
    (
        ErrorCategory::Memory,
        r"(?i)memory ?error|out of memory|\boom\b|cannot allocate",
    ),
    (
        ErrorCategory::Api,
        r"(?i)\b5\d\d\b|internal server error|bad gateway|service unavailable|api error|\b401\b",
    ),
];

fn rules() -> &'static [(ErrorCategory, Regex)] {
    static COMPILED: OnceLock<Vec<(ErrorCategory, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(category, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*category, re)),
                Err(e) => {
                    warn!(category = category.as_str(), error = %e, "Invalid classification rule");
                    None
                }
            })
            .collect()
    })
}

/// Map an error message onto the failure taxonomy.
pub fn classify(error: &str) -> ErrorCategory {
    rules()
        .iter()
        .find(|(_, re)| re.is_match(error))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

fn suggestions(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Network => &[
            "Retry the request; the remote side may have been briefly unavailable",
            "Check the endpoint URL and proxy settings",
        ],
        ErrorCategory::Timeout => &[
            "Split the work into smaller pieces",
            "Raise the timeout for long-running operations",
        ],
        ErrorCategory::RateLimit => &[
            "Wait before retrying and reduce request volume",
            "Batch requests where possible",
        ],
        ErrorCategory::Permission => &[
            "Write only inside the task working directory",
            "Verify credentials and file permissions",
        ],
        ErrorCategory::FileNotFound => &[
            "Check the path relative to the working directory",
            "Create or download the missing input first",
        ],
        ErrorCategory::Import => &[
            "Install the missing package or use one already available",
            "Check the module name for typos",
        ],
        ErrorCategory::Syntax => &[
            "Re-read the failing line and fix the syntax",
            "Keep generated code small enough to review",
        ],
        ErrorCategory::Type => &[
            "Check argument and return types at the failing call",
            "Convert values explicitly before combining them",
        ],
        ErrorCategory::Value => &[
            "Validate inputs before using them",
            "Handle empty or malformed data explicitly",
        ],
        ErrorCategory::Key => &[
            "List the available keys before indexing",
            "Use a default when a key may be absent",
        ],
        ErrorCategory::Index => &[
            "Check collection lengths before indexing",
            "Guard against empty results",
        ],
        ErrorCategory::Attribute => &[
            "Inspect the object's type and available members",
            "Check library versions for renamed APIs",
        ],
        ErrorCategory::Memory => &[
            "Process data in chunks or stream it",
            "Release large intermediate results early",
        ],
        ErrorCategory::Api => &[
            "Retry after a short wait; the service reported an internal error",
            "Check the API key and request payload",
        ],
        ErrorCategory::Unknown => &[
            "Read the full error output and address the root cause",
            "Try a simpler approach to the same goal",
        ],
    }
}

/// How likely a retry in this category is to help, relative to baseline.
fn category_multiplier(category: ErrorCategory) -> f64 {
    match category {
        ErrorCategory::Network | ErrorCategory::RateLimit => 0.9,
        ErrorCategory::Timeout => 0.8,
        ErrorCategory::Api => 0.7,
        ErrorCategory::Syntax
        | ErrorCategory::Type
        | ErrorCategory::Value
        | ErrorCategory::Key
        | ErrorCategory::Index
        | ErrorCategory::Attribute => 0.6,
        ErrorCategory::FileNotFound | ErrorCategory::Unknown => 0.5,
        ErrorCategory::Import => 0.4,
        ErrorCategory::Memory => 0.3,
        ErrorCategory::Permission => 0.2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Exponential,
    /// A human supplied guidance; retry right away with it.
    UserGuided,
}

/// `min(2^attempt, cap)` seconds, optionally scaled by 0.8x-1.2x jitter.
pub fn exponential_backoff_secs(attempt: u32, cap_secs: u64, jitter: bool) -> u64 {
    let base = 2u64.saturating_pow(attempt).min(cap_secs);
    if !jitter {
        return base;
    }
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    ((base as f64 * factor) as u64).min(cap_secs)
}

/// Everything a retry needs to know about the failures before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    pub node_id: String,
    pub attempt_number: u32,
    pub error: String,
    pub category: ErrorCategory,
    pub suggestions: Vec<String>,
    pub success_probability: f64,
    pub strategy: BackoffStrategy,
    pub backoff_secs: u64,
    pub previous_errors: Vec<String>,
    pub user_feedback: Option<String>,
}

impl RetryContext {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    /// Prompt-ready summary for the agent making the next attempt.
    pub fn guidance(&self) -> String {
        let mut out = format!(
            "Attempt {} of step '{}' failed ({}): {}\n",
            self.attempt_number, self.node_id, self.category, self.error
        );
        if !self.previous_errors.is_empty() {
            out.push_str("Earlier failures:\n");
            for e in &self.previous_errors {
                out.push_str(&format!("- {}\n", e));
            }
        }
        out.push_str("Suggestions:\n");
        for s in &self.suggestions {
            out.push_str(&format!("- {}\n", s));
        }
        if let Some(feedback) = &self.user_feedback {
            out.push_str(&format!("User feedback: {}\n", feedback));
        }
        out.push_str(&format!(
            "Estimated success probability: {:.0}%",
            self.success_probability * 100.0
        ));
        out
    }
}

/// Terminal failure of a node after its retry budget ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{node_id} failed after {attempts} attempt(s): {error}")]
pub struct TaskFailure {
    pub node_id: String,
    pub error: String,
    pub category: ErrorCategory,
    pub attempts: u32,
    pub cancelled: bool,
    /// Recorded attempts of this execution, oldest first.
    #[serde(default)]
    pub history: Vec<RetryAttempt>,
}

impl TaskFailure {
    pub fn new(
        node_id: impl Into<String>,
        error: impl Into<String>,
        category: ErrorCategory,
        attempts: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            error: error.into(),
            category,
            attempts,
            cancelled: false,
            history: Vec::new(),
        }
    }

    pub fn cancelled(node_id: &str, attempts: u32) -> Self {
        Self {
            cancelled: true,
            ..Self::new(node_id, "cancelled", ErrorCategory::Unknown, attempts)
        }
    }
}

/// Builds retry context, records attempts and drives the retry loop.
pub struct RetryContextManager {
    store: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
    config: RetryConfig,
}

impl RetryContextManager {
    pub fn new(store: Arc<dyn RunStore>, event_bus: Arc<EventBus>, config: RetryConfig) -> Self {
        Self {
            store,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classify `error` and derive suggestions, odds and backoff. The caller
    /// decides whether a retry happens.
    pub fn build_context(
        &self,
        node_id: &str,
        attempt_number: u32,
        error: &str,
        previous_attempts: &[RetryAttempt],
        user_feedback: Option<&str>,
    ) -> RetryContext {
        let category = classify(error);
        let feedback = user_feedback
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from);

        let base = 1.0 / (attempt_number as f64 + 1.0);
        let boost = if feedback.is_some() { 1.5 } else { 1.0 };
        let success_probability = (base * category_multiplier(category) * boost).clamp(0.0, 1.0);

        let (strategy, backoff_secs) = if feedback.is_some() {
            (BackoffStrategy::UserGuided, 0)
        } else if category.is_transient() {
            (
                BackoffStrategy::Exponential,
                exponential_backoff_secs(attempt_number, self.config.backoff_cap_secs, self.config.jitter),
            )
        } else {
            (BackoffStrategy::Immediate, 0)
        };

        RetryContext {
            node_id: node_id.to_string(),
            attempt_number,
            error: error.to_string(),
            category,
            suggestions: suggestions(category).iter().map(|s| s.to_string()).collect(),
            success_probability,
            strategy,
            backoff_secs,
            previous_errors: previous_attempts
                .iter()
                .filter(|a| a.outcome == AttemptOutcome::Failed)
                .map(|a| a.error.clone())
                .collect(),
            user_feedback: feedback,
        }
    }

    /// Append the next attempt for a node. Numbering continues across
    /// executions of the same node.
    pub fn record_attempt(
        &self,
        run_id: &RunId,
        node_id: &str,
        error: &str,
        category: ErrorCategory,
        outcome: AttemptOutcome,
        backoff_secs: u64,
    ) -> Result<RetryAttempt> {
        let next = self
            .store
            .retry_attempts(run_id, node_id)?
            .last()
            .map(|a| a.attempt_number + 1)
            .unwrap_or(1);
        let attempt = RetryAttempt {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            attempt_number: next,
            error: error.to_string(),
            category,
            outcome,
            backoff_secs,
            timestamp: Utc::now(),
        };
        self.store.record_retry_attempt(&attempt)?;
        Ok(attempt)
    }

    pub fn attempts(&self, run_id: &RunId, node_id: &str) -> Result<Vec<RetryAttempt>> {
        self.store.retry_attempts(run_id, node_id)
    }

    /// Run `attempt_fn` until it succeeds, the node's budget is spent, or
    /// `cancel` fires. Each call receives the 1-based attempt number and
    /// the context built from the previous failure.
    pub async fn run_with_retry<F, Fut>(
        &self,
        run_id: &RunId,
        node: &Node,
        user_feedback: Option<String>,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> std::result::Result<Value, TaskFailure>
    where
        F: FnMut(u32, Option<RetryContext>) -> Fut,
        Fut: Future<Output = std::result::Result<Value, String>>,
    {
        let max_attempts = node.max_attempts().unwrap_or(self.config.max_attempts).max(1);
        let mut context: Option<RetryContext> = None;
        let mut previous: Vec<RetryAttempt> = Vec::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(TaskFailure::cancelled(&node.id, attempt - 1));
            }

            let error = match attempt_fn(attempt, context.clone()).await {
                Ok(value) => {
                    if let Err(e) = self.record_attempt(
                        run_id,
                        &node.id,
                        "",
                        ErrorCategory::Unknown,
                        AttemptOutcome::Succeeded,
                        0,
                    ) {
                        warn!(node_id = %node.id, error = %e, "Failed to record attempt");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let ctx = self.build_context(
                &node.id,
                attempt,
                &error,
                &previous,
                user_feedback.as_deref(),
            );
            match self.record_attempt(
                run_id,
                &node.id,
                &error,
                ctx.category,
                AttemptOutcome::Failed,
                ctx.backoff_secs,
            ) {
                Ok(recorded) => previous.push(recorded),
                Err(e) => warn!(node_id = %node.id, error = %e, "Failed to record attempt"),
            }

            if attempt == max_attempts {
                warn!(node_id = %node.id, attempts = attempt, category = %ctx.category, "Retry budget exhausted");
                return Err(TaskFailure {
                    history: previous,
                    ..TaskFailure::new(node.id.clone(), error, ctx.category, attempt)
                });
            }

            info!(
                node_id = %node.id,
                attempt = attempt + 1,
                category = %ctx.category,
                backoff_secs = ctx.backoff_secs,
                "Retrying node"
            );
            self.event_bus.publish(WorkflowEvent::RetryStarted {
                run_id: run_id.clone(),
                node_id: node.id.clone(),
                attempt: attempt + 1,
                category: ctx.category,
                backoff_secs: ctx.backoff_secs,
                timestamp: Utc::now(),
            });

            if ctx.backoff_secs > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(TaskFailure::cancelled(&node.id, attempt));
                    }
                    _ = tokio::time::sleep(ctx.delay()) => {}
                }
            }
            context = Some(ctx);
        }

        // max_attempts >= 1, so the loop always returns.
        Err(TaskFailure::cancelled(&node.id, max_attempts))
    }
}
