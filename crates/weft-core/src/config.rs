use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for run working directories and snapshots.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// SQLite database path. Default: <workspace>/weft.db
    #[serde(default)]
    pub database: Option<String>,
    /// Stop before the next level when a node fails terminally.
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
    #[serde(default = "default_mode")]
    pub default_mode: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            database: None,
            stop_on_failure: true,
            default_mode: default_mode(),
        }
    }
}

fn default_workspace() -> String {
    "~/.weft".to_string()
}

fn default_mode() -> String {
    "one_shot".to_string()
}

fn default_true() -> bool {
    true
}

/// What happens to a task's isolated directory once its level resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Merge directories of successful tasks, discard failed ones.
    #[default]
    RetainSuccessful,
    RetainAll,
    DiscardAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub merge_policy: MergePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            merge_policy: MergePolicy::default(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

/// Admission control budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory budget shared by all runs in this process.
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: u64,
    /// Percentage of capacity above which new admissions block.
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: u8,
    /// Estimated footprint of one task.
    #[serde(default = "default_task_estimate_mb")]
    pub task_estimate_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            capacity_mb: default_capacity_mb(),
            threshold_pct: default_threshold_pct(),
            task_estimate_mb: default_task_estimate_mb(),
        }
    }
}

fn default_capacity_mb() -> u64 {
    4096
}

fn default_threshold_pct() -> u8 {
    80
}

fn default_task_estimate_mb() -> u64 {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Cap for exponential backoff.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Scale backoff by a 0.8x-1.2x jitter factor.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_cap_secs: default_backoff_cap_secs(),
            jitter: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_cap_secs() -> u64 {
    60
}

/// Checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Checkpoint after every completed node.
    #[serde(default = "default_true")]
    pub per_step: bool,
    /// Also checkpoint when this many seconds passed since the last one.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Checkpoint before nodes flagged `risky`.
    #[serde(default = "default_true")]
    pub before_risky: bool,
    #[serde(default = "default_true")]
    pub on_pause: bool,
    /// Directory for full snapshots. Default: <workspace>/checkpoints
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
    /// Retention: keep only the newest N checkpoints per run.
    #[serde(default)]
    pub keep_last: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_step: true,
            interval_secs: None,
            before_risky: true,
            on_pause: true,
            checkpoint_dir: None,
            keep_last: None,
        }
    }
}

/// Human approval gates between levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Node ids that always require approval before they run.
    #[serde(default)]
    pub mandatory_nodes: Vec<String>,
    /// Node types that always require approval before they run.
    #[serde(default)]
    pub mandatory_types: Vec<String>,
    /// Enable heuristic escalation.
    #[serde(default)]
    pub smart: bool,
    /// Label keywords that escalate under smart approval.
    #[serde(default)]
    pub smart_keywords: Vec<String>,
    /// Wait at most this long for a decision; none means wait forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary, 2 = per node, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> u8 {
    2
}

impl WeftConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        content.parse()
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        self.engine
            .database
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("weft.db"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.workspace_dir().join("runs")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .checkpoint_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("checkpoints"))
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(
            log.log_dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| self.workspace_dir().join("logs")),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_workers == 0 {
            return Err(WeftError::Config("executor.max_workers must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(WeftError::Config("retry.max_attempts must be >= 1".into()));
        }
        if !(1..=100).contains(&self.resources.threshold_pct) {
            return Err(WeftError::Config(
                "resources.threshold_pct must be within 1..=100".into(),
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for WeftConfig {
    type Err = WeftError;

    fn from_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: WeftConfig = "".parse().unwrap();
        assert_eq!(config.executor.max_workers, 4);
        assert_eq!(config.resources.threshold_pct, 80);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.checkpoint.per_step);
        assert!(config.engine.stop_on_failure);
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn rejects_zero_workers() {
        let err = "[executor]\nmax_workers = 0".parse::<WeftConfig>().unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn paths_derive_from_workspace() {
        let config: WeftConfig = "[engine]\nworkspace = \"/srv/weft\"\n[log]\n"
            .parse()
            .unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/srv/weft/weft.db"));
        assert_eq!(config.runs_dir(), PathBuf::from("/srv/weft/runs"));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/srv/weft/checkpoints"));
        assert_eq!(config.log_dir(), Some(PathBuf::from("/srv/weft/logs")));
    }

    #[test]
    fn env_vars_expand_and_unknown_are_kept() {
        std::env::set_var("WEFT_TEST_WS", "/tmp/weft-env");
        assert_eq!(expand_env_vars("a=${WEFT_TEST_WS}"), "a=/tmp/weft-env");
        assert_eq!(
            expand_env_vars("b=${WEFT_SURELY_UNSET_VAR}"),
            "b=${WEFT_SURELY_UNSET_VAR}"
        );
    }

    #[test]
    fn merge_policy_parses_snake_case() {
        let config: WeftConfig = "[executor]\nmerge_policy = \"discard_all\""
            .parse()
            .unwrap();
        assert_eq!(config.executor.merge_policy, MergePolicy::DiscardAll);
    }
}
