//! Scheduler configuration

use std::time::Duration;

use crate::lock::LockRetryPolicy;

/// Runtime knobs for [`super::Worker`] and [`super::Pipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Pipelines running at once in this replica
    pub max_concurrent: usize,

    /// Queue poll period when idle
    pub poll_interval: Duration,

    /// How long in-flight pipelines get to finish on shutdown
    pub shutdown_timeout: Duration,

    /// How long a dequeued item stays hidden before redelivery
    pub visibility_timeout: Duration,

    /// Execution Lock TTL
    pub lease_ttl: Duration,

    /// Minimum gap between completions of one key
    pub min_interval: Duration,

    pub lock_retry: LockRetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(10),
            min_interval: Duration::from_secs(1),
            lock_retry: LockRetryPolicy::default(),
        }
    }
}
