//! Engine configuration.
//!
//! [`EngineConfig`] resolves from the environment by default (a `.env` file
//! is honored via `dotenvy`) and exposes `with_*` builders for explicit
//! wiring in tests and embedders.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root of the on-disk layout (`sessions/`, `snapshots/`,
    /// `pinned-workflows/`, `keyring/`).
    pub data_dir: PathBuf,
    /// Maximum nesting depth of an agent-supplied context object.
    pub max_context_depth: usize,
    /// Maximum canonical UTF-8 bytes of an agent-supplied context object.
    pub max_context_bytes: usize,
    /// Byte budget for a rendered prompt including recovery appendix.
    pub recovery_budget_bytes: usize,
    /// Outer time budget for one inbound call.
    pub call_timeout: Duration,
    /// Retry hint returned when the session lock is busy.
    pub lock_retry_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        Self {
            data_dir: std::env::var("LOOMRAIL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".loomrail")),
            max_context_depth: env_usize("LOOMRAIL_CONTEXT_MAX_DEPTH", 10),
            max_context_bytes: env_usize("LOOMRAIL_CONTEXT_MAX_BYTES", 32 * 1024),
            recovery_budget_bytes: env_usize("LOOMRAIL_RECOVERY_BUDGET_BYTES", 32 * 1024),
            call_timeout: Duration::from_millis(env_usize("LOOMRAIL_CALL_TIMEOUT_MS", 30_000) as u64),
            lock_retry_after: Duration::from_millis(
                env_usize("LOOMRAIL_LOCK_RETRY_AFTER_MS", 1_000) as u64,
            ),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at an explicit data directory.
    #[must_use]
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Overrides the context byte budget.
    #[must_use]
    pub fn with_max_context_bytes(mut self, bytes: usize) -> Self {
        self.max_context_bytes = bytes;
        self
    }

    /// Overrides the context depth budget.
    #[must_use]
    pub fn with_max_context_depth(mut self, depth: usize) -> Self {
        self.max_context_depth = depth;
        self
    }

    /// Overrides the prompt/recovery byte budget.
    #[must_use]
    pub fn with_recovery_budget_bytes(mut self, bytes: usize) -> Self {
        self.recovery_budget_bytes = bytes;
        self
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
