//! Startup and shutdown sequencing for certificate distribution
//!
//! The agent must publish its own certificate before it can be trusted, and
//! must have a full view of its peers before it starts enforcing. The
//! distributor walks these steps in order and refuses anything else:
//!
//! ```text
//! Created -> Published -> Synchronized -> Watching -> Stopped
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::DistributorConfig;
use crate::error::Error;
use crate::identity::{Certificate, NodeIdentity};
use crate::publisher::{LocalPublisher, PublishOutcome};
use crate::store::IdentityStore;
use crate::sync::{FullSynchronizer, SyncReport};
use crate::trust_cache::TrustCache;
use crate::watcher::{ChangeWatcher, WatchState, WatcherHandle};

/// Lifecycle phase of a [`CertDistributor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing done yet
    Created,
    /// Local certificate is in the store
    Published,
    /// Cache loaded from a full listing
    Synchronized,
    /// Watcher task running
    Watching,
    /// Watcher stopped; terminal
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Published => "published",
            Self::Synchronized => "synchronized",
            Self::Watching => "watching",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Drives publish, sync and watch for one node agent
pub struct CertDistributor {
    node_name: String,
    store: Arc<dyn IdentityStore>,
    cache: Arc<TrustCache>,
    config: DistributorConfig,
    phase: Phase,
    sync_revision: Option<String>,
    watcher: Option<WatcherHandle>,
}

impl CertDistributor {
    /// Create a distributor for `node_name`, loading peers into `cache`
    pub fn new(
        store: Arc<dyn IdentityStore>,
        cache: Arc<TrustCache>,
        node_name: impl Into<String>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            cache,
            config,
            phase: Phase::Created,
            sync_revision: None,
            watcher: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The shared trust cache
    pub fn cache(&self) -> &Arc<TrustCache> {
        &self.cache
    }

    /// This node's identity as peers see it
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::from_node_name(&self.node_name)
    }

    /// Watcher state while watching
    pub fn watch_state(&self) -> Option<WatchState> {
        self.watcher.as_ref().map(WatcherHandle::state)
    }

    /// Publish this node's certificate. Any failure is fatal.
    pub async fn publish_self(&mut self, certificate: &Certificate) -> Result<PublishOutcome, Error> {
        self.expect_phase("publish_self", Phase::Created)?;

        if let Some(info) = certificate.info() {
            debug!(
                node = %self.node_name,
                common_name = %info.common_name,
                not_after = info.not_after,
                "Publishing local certificate"
            );
        }

        let outcome = LocalPublisher::new(self.store.clone(), self.config.publish.clone())
            .publish(&self.node_name, certificate)
            .await?;

        self.phase = Phase::Published;
        Ok(outcome)
    }

    /// Load every published peer certificate. A failed listing is fatal.
    pub async fn sync_all(&mut self) -> Result<SyncReport, Error> {
        self.expect_phase("sync_all", Phase::Published)?;

        let report = FullSynchronizer::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.sync.clone(),
        )
        .sync_all()
        .await?;

        self.sync_revision = Some(report.revision.clone()).filter(|r| !r.is_empty());
        self.phase = Phase::Synchronized;
        Ok(report)
    }

    /// Spawn the change watcher. Must be called inside a tokio runtime.
    pub fn start_watching(&mut self) -> Result<(), Error> {
        self.expect_phase("start_watching", Phase::Synchronized)?;

        let watcher = ChangeWatcher::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.watch.clone(),
        );
        self.watcher = Some(watcher.spawn(self.sync_revision.take()));
        self.phase = Phase::Watching;

        info!(node = %self.node_name, "Watching for peer certificate changes");
        Ok(())
    }

    /// Cancel the watcher and wait for it to exit
    pub async fn stop_watching(&mut self) -> Result<(), Error> {
        self.expect_phase("stop_watching", Phase::Watching)?;

        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        self.phase = Phase::Stopped;

        info!(node = %self.node_name, peers = self.cache.len(), "Certificate distribution stopped");
        Ok(())
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), Error> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::lifecycle(operation, expected, self.phase))
        }
    }
}
