use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use weft_core::config::ResourceConfig;
use weft_core::error::{Result, WeftError};

/// Admission control shared by every run in the process.
///
/// The budget is `capacity_mb * threshold_pct / 100` megabytes, held as
/// semaphore permits. A task acquires permits for its estimated footprint
/// and releases them when its [`Admission`] drops, so admissions block once
/// usage would cross the threshold.
pub struct ResourceManager {
    permits: Arc<Semaphore>,
    budget_mb: u32,
    capacity_mb: u64,
    task_estimate_mb: u32,
}

/// Held for the lifetime of one admitted task.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    mb: u32,
}

impl Admission {
    pub fn mb(&self) -> u32 {
        self.mb
    }
}

impl ResourceManager {
    pub fn new(config: &ResourceConfig) -> Self {
        let budget = config.capacity_mb.saturating_mul(config.threshold_pct as u64) / 100;
        let budget_mb = budget.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize) as u64) as u32;
        let task_estimate_mb = config.task_estimate_mb.clamp(1, budget_mb as u64) as u32;
        Self {
            permits: Arc::new(Semaphore::new(budget_mb as usize)),
            budget_mb,
            capacity_mb: config.capacity_mb,
            task_estimate_mb,
        }
    }

    pub fn capacity_mb(&self) -> u64 {
        self.capacity_mb
    }

    pub fn budget_mb(&self) -> u32 {
        self.budget_mb
    }

    pub fn available_mb(&self) -> u32 {
        self.permits.available_permits() as u32
    }

    pub fn in_use_mb(&self) -> u32 {
        self.budget_mb - self.available_mb()
    }

    /// How many default-sized tasks fit under the threshold at once.
    pub fn optimal_worker_count(&self) -> usize {
        (self.budget_mb / self.task_estimate_mb).max(1) as usize
    }

    fn estimate(&self, estimate_mb: Option<u32>) -> u32 {
        // Oversized requests are clamped so they can still be admitted alone.
        estimate_mb
            .unwrap_or(self.task_estimate_mb)
            .clamp(1, self.budget_mb)
    }

    /// Wait for headroom, then admit a task.
    pub async fn admit(&self, estimate_mb: Option<u32>) -> Result<Admission> {
        let mb = self.estimate(estimate_mb);
        if (self.permits.available_permits() as u32) < mb {
            debug!(requested_mb = mb, available_mb = self.available_mb(), "Admission waiting for headroom");
        }
        let permit = self
            .permits
            .clone()
            .acquire_many_owned(mb)
            .await
            .map_err(|_| WeftError::ResourceExhausted("resource manager closed".into()))?;
        Ok(Admission {
            _permit: permit,
            mb,
        })
    }

    /// Non-blocking admission check.
    pub fn try_admit(&self, estimate_mb: Option<u32>) -> Result<Admission> {
        let mb = self.estimate(estimate_mb);
        match self.permits.clone().try_acquire_many_owned(mb) {
            Ok(permit) => Ok(Admission {
                _permit: permit,
                mb,
            }),
            Err(TryAcquireError::NoPermits) => Err(WeftError::ResourceExhausted(format!(
                "{} MB requested, {} MB of {} MB available",
                mb,
                self.available_mb(),
                self.budget_mb
            ))),
            Err(TryAcquireError::Closed) => {
                Err(WeftError::ResourceExhausted("resource manager closed".into()))
            }
        }
    }
}
