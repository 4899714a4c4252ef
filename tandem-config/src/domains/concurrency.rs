//! Thread pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Limits and timers for the thread pool.
///
/// `None` for a timeout means it never fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on live threads
    pub max_threads: usize,

    /// Threads kept alive by descaling
    pub min_threads: usize,

    /// How long an allocation request may wait for a free thread
    #[serde(with = "humantime_serde")]
    pub thread_allocation_timeout: Option<Duration>,

    /// How long a thread may sit idle before the pool shrinks
    #[serde(with = "humantime_serde")]
    pub thread_idle_timeout: Option<Duration>,

    /// Period of the allocation pass
    #[serde(with = "humantime_serde")]
    pub allocation_interval: Duration,

    /// Run every call in-process, bypassing the pool
    pub disabled: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_threads: 1,
            min_threads: 0,
            thread_allocation_timeout: None,
            thread_idle_timeout: None,
            allocation_interval: Duration::from_millis(10),
            disabled: false,
        }
    }
}

impl ConcurrencyConfig {
    /// Default limits with one thread per available CPU
    pub fn per_cpu() -> Self {
        Self {
            max_threads: num_cpus::get().max(1),
            ..Self::default()
        }
    }

    /// Apply the fields set in `partial`, keeping the rest
    pub fn merge(&mut self, partial: &PartialConcurrencyConfig) {
        if let Some(max_threads) = partial.max_threads {
            self.max_threads = max_threads;
        }
        if let Some(min_threads) = partial.min_threads {
            self.min_threads = min_threads;
        }
        if let Some(timeout) = partial.thread_allocation_timeout {
            self.thread_allocation_timeout = timeout;
        }
        if let Some(timeout) = partial.thread_idle_timeout {
            self.thread_idle_timeout = timeout;
        }
        if let Some(interval) = partial.allocation_interval {
            self.allocation_interval = interval;
        }
        if let Some(disabled) = partial.disabled {
            self.disabled = disabled;
        }
    }

    /// Return a copy with `partial` merged in
    pub fn merged(&self, partial: &PartialConcurrencyConfig) -> Self {
        let mut config = self.clone();
        config.merge(partial);
        config
    }
}

impl Validatable for ConcurrencyConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_threads, "max_threads", self.domain_name())?;

        if self.min_threads > self.max_threads {
            return Err(self.validation_error(format!(
                "min_threads ({}) cannot exceed max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }

        if self.allocation_interval.is_zero() {
            return Err(self.validation_error("allocation_interval must be greater than 0"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "concurrency"
    }
}

/// A partial update for [`ConcurrencyConfig`].
///
/// Timeouts are doubly optional: `Some(None)` switches a timeout off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialConcurrencyConfig {
    pub max_threads: Option<usize>,
    pub min_threads: Option<usize>,
    pub thread_allocation_timeout: Option<Option<Duration>>,
    pub thread_idle_timeout: Option<Option<Duration>>,
    pub allocation_interval: Option<Duration>,
    pub disabled: Option<bool>,
}

impl PartialConcurrencyConfig {
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    pub fn min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = Some(min_threads);
        self
    }

    pub fn thread_allocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.thread_allocation_timeout = Some(timeout);
        self
    }

    pub fn thread_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.thread_idle_timeout = Some(timeout);
        self
    }

    pub fn allocation_interval(mut self, interval: Duration) -> Self {
        self.allocation_interval = Some(interval);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }
}
