//! Configuration for an ensemble.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an [`Ensemble`](crate::Ensemble).
///
/// Every path is explicit; nothing is derived from a process-wide default.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Identifier shared by every replica in the ensemble.
    pub ensemble_id: String,
    /// Directory for the local event store. `None` keeps it in memory.
    pub local_data_root: Option<PathBuf>,
    /// Retry policy for transient failures inside a merge.
    pub retry: RetryConfig,
    /// Upper bound on any single wait for the cloud file system.
    pub transfer_timeout: Duration,
    /// How many times the host may repair a failed save of merged changes.
    pub max_save_attempts: u32,
    /// Inline attribute bytes above this size go to a data file.
    pub data_file_threshold: usize,
    /// When to compact history into a baseline.
    pub rebase: RebaseConfig,
    /// Consecutive merges blocked by an unknown model version before the
    /// ensemble gives up and resets.
    pub max_unknown_model_version_merges: u32,
}

impl EnsembleConfig {
    /// Creates a configuration with defaults and an in-memory store.
    pub fn new(ensemble_id: impl Into<String>) -> Self {
        Self {
            ensemble_id: ensemble_id.into(),
            local_data_root: None,
            retry: RetryConfig::default(),
            transfer_timeout: Duration::from_secs(60),
            max_save_attempts: 3,
            data_file_threshold: 10 * 1024,
            rebase: RebaseConfig::default(),
            max_unknown_model_version_merges: 10,
        }
    }

    /// Stores the event store under `root`.
    pub fn with_local_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_data_root = Some(root.into());
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Sets the maximum number of save attempts per merge.
    pub fn with_max_save_attempts(mut self, attempts: u32) -> Self {
        self.max_save_attempts = attempts.max(1);
        self
    }

    /// Sets the data file threshold.
    pub fn with_data_file_threshold(mut self, bytes: usize) -> Self {
        self.data_file_threshold = bytes;
        self
    }

    /// Sets the rebase configuration.
    pub fn with_rebase(mut self, rebase: RebaseConfig) -> Self {
        self.rebase = rebase;
        self
    }

    /// Sets the unknown model version limit.
    pub fn with_max_unknown_model_version_merges(mut self, limit: u32) -> Self {
        self.max_unknown_model_version_merges = limit;
        self
    }

    /// Event store configuration derived from this configuration.
    pub fn store_config(&self) -> ensembles_store::StoreConfig {
        match &self.local_data_root {
            Some(root) => ensembles_store::StoreConfig::at_path(
                self.ensemble_id.clone(),
                root.join(&self.ensemble_id),
            ),
            None => ensembles_store::StoreConfig::in_memory(self.ensemble_id.clone()),
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// When the rebaser compacts history.
#[derive(Debug, Clone)]
pub struct RebaseConfig {
    /// Estimated fraction of object changes a rebase must remove.
    pub compaction_threshold: f64,
    /// Without a baseline, rebase once this many events exist.
    pub min_events_without_baseline: usize,
    /// Whether merges rebase automatically.
    pub automatic: bool,
}

impl RebaseConfig {
    /// Disables automatic rebasing.
    pub fn manual() -> Self {
        Self {
            automatic: false,
            ..Self::default()
        }
    }

    /// Sets the compaction threshold.
    pub fn with_compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Sets the event count that triggers the first rebase.
    pub fn with_min_events_without_baseline(mut self, count: usize) -> Self {
        self.min_events_without_baseline = count;
        self
    }
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 0.5,
            min_events_without_baseline: 100,
            automatic: true,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; attempt 0 has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if self.add_jitter && capped > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=0.25);
            Duration::from_secs_f64(capped * (1.0 + jitter))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = EnsembleConfig::new("notes")
            .with_local_data_root("/tmp/ensembles")
            .with_max_save_attempts(0)
            .with_transfer_timeout(Duration::from_secs(5));
        assert_eq!(config.max_save_attempts, 1);
        assert_eq!(config.transfer_timeout, Duration::from_secs(5));
        let store = config.store_config();
        assert_eq!(
            store.root.as_deref(),
            Some(std::path::Path::new("/tmp/ensembles/notes"))
        );
    }

    #[test]
    fn in_memory_by_default() {
        assert!(EnsembleConfig::new("x").store_config().root.is_none());
    }

    #[test]
    fn backoff_without_jitter() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
            .with_jitter(false);
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_bounded() {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(100));
        for _ in 0..20 {
            let delay = retry.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn no_retry_config() {
        let retry = RetryConfig::no_retry();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.delay_for_attempt(3), Duration::ZERO);
    }
}
