//! Tunables for publishing, synchronization and watching

use std::time::Duration;

use nodetrust_common::retry::RetryConfig;

/// Annotation key holding a node's certificate
pub const DEFAULT_ANNOTATION_KEY: &str = "nodetrust.io/certificate";

/// Default number of concurrent record reads during a full synchronization
pub const DEFAULT_SYNC_CONCURRENCY: usize = 16;

/// Default number of publish attempts before startup is aborted
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 5;

/// What happens to cache entries of nodes that disappeared without a
/// delete event reaching this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Only Deleted events evict; entries missed during a watch gap stay
    #[default]
    OnDeleteOnly,
    /// Additionally re-list every `interval` (and after every watch gap)
    /// and evict identities no longer present in the store
    Reconcile {
        /// Time between reconciliations
        interval: Duration,
    },
}

impl EvictionPolicy {
    /// Whether listings should evict absent identities
    pub fn evicts_absent(&self) -> bool {
        matches!(self, Self::Reconcile { .. })
    }

    /// Periodic reconciliation interval, if enabled
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::OnDeleteOnly => None,
            Self::Reconcile { interval } => Some(*interval),
        }
    }
}

/// Local publisher settings
#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// Retry policy for conflicts and transient failures
    pub retry: RetryConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: DEFAULT_PUBLISH_ATTEMPTS,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
        }
    }
}

/// Full synchronizer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum concurrent record reads
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_SYNC_CONCURRENCY,
        }
    }
}

/// Change watcher settings
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    /// Resubscription backoff; `max_attempts` is ignored (retries forever)
    pub backoff: RetryConfig,
    /// Stale entry policy
    pub eviction: EvictionPolicy,
    /// Settings for the re-synchronization run after a watch gap
    pub sync: SyncConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            eviction: EvictionPolicy::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Settings for the whole distribution lifecycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistributorConfig {
    /// Publisher settings
    pub publish: PublishConfig,
    /// Initial synchronization settings
    pub sync: SyncConfig,
    /// Watcher settings
    pub watch: WatchConfig,
}
