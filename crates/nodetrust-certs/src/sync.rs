//! Full synchronization of peer certificates
//!
//! Lists every node, reads each node's published certificate and loads it
//! into the trust cache. A single unreadable peer is logged and skipped so
//! it cannot block trust with the rest of the cluster; only a failed listing
//! is reported to the caller.

use std::sync::Arc;

use futures::{stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, StartupPhase};
use crate::identity::NodeIdentity;
use crate::store::{IdentityStore, NodeRecord, StoreError};
use crate::trust_cache::{CacheUpdate, TrustCache};

/// Counters from one synchronization run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes in the listing
    pub listed: usize,
    /// Certificates inserted or replaced in the cache
    pub applied: usize,
    /// Certificates already present and identical
    pub unchanged: usize,
    /// Nodes without a published certificate (or gone since the listing)
    pub missing: usize,
    /// Nodes whose record could not be read
    pub failed: usize,
    /// Cache entries evicted because their node is gone
    pub evicted: usize,
    /// Store revision of the listing
    pub revision: String,
}

/// Loads the trust cache from a full store snapshot
pub struct FullSynchronizer {
    store: Arc<dyn IdentityStore>,
    cache: Arc<TrustCache>,
    config: SyncConfig,
}

impl FullSynchronizer {
    /// Create a synchronizer
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<TrustCache>, config: SyncConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Startup synchronization: a failed listing is fatal.
    pub async fn sync_all(&self) -> Result<SyncReport, Error> {
        self.run(false)
            .await
            .map_err(|e| Error::fatal_startup(StartupPhase::Sync, e))
    }

    /// One synchronization pass. With `evict_absent`, cache entries for
    /// identities missing from the listing are removed.
    pub async fn run(&self, evict_absent: bool) -> Result<SyncReport, StoreError> {
        let listing = self.store.list().await.map_err(|e| {
            warn!(error = %e, "Failed to list nodes for certificate sync");
            e
        })?;

        let mut report = SyncReport {
            listed: listing.nodes.len(),
            revision: listing.revision.clone(),
            ..Default::default()
        };

        let store = &self.store;
        let results: Vec<(String, Result<NodeRecord, StoreError>)> =
            stream::iter(listing.nodes.iter().cloned())
                .map(|node| async move {
                    let result = store.get(&node).await;
                    (node, result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        for (node, result) in results {
            match result {
                Ok(NodeRecord {
                    certificate: Some(certificate),
                    ..
                }) => {
                    let identity = NodeIdentity::from_node_name(&node);
                    match self.cache.insert(&identity, &certificate) {
                        CacheUpdate::Unchanged => report.unchanged += 1,
                        CacheUpdate::Inserted | CacheUpdate::Replaced => report.applied += 1,
                    }
                }
                Ok(NodeRecord {
                    certificate: None, ..
                }) => {
                    debug!(node = %node, "Node has not published a certificate yet");
                    report.missing += 1;
                }
                Err(StoreError::NotFound { .. }) => {
                    debug!(node = %node, "Node disappeared during sync");
                    report.missing += 1;
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Skipping peer certificate");
                    report.failed += 1;
                }
            }
        }

        if evict_absent {
            let present: Vec<NodeIdentity> = listing
                .nodes
                .iter()
                .map(|node| NodeIdentity::from_node_name(node))
                .collect();
            report.evicted = self.cache.retain_only(&present).len();
        }

        info!(
            listed = report.listed,
            applied = report.applied,
            unchanged = report.unchanged,
            missing = report.missing,
            failed = report.failed,
            evicted = report.evicted,
            revision = %report.revision,
            "Peer certificate sync complete"
        );

        Ok(report)
    }
}
