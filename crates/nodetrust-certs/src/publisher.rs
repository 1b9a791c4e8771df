//! Publishes this node's certificate to the identity store
//!
//! Runs once at startup, before any peer synchronization. The write is a
//! read-compare-write: an identical annotation is left untouched, and a
//! conflicting concurrent update triggers a fresh read and another attempt.

use std::sync::Arc;

use nodetrust_common::retry::retry_with_backoff_if;
use tracing::{error, info, warn};

use crate::config::PublishConfig;
use crate::error::{Error, StartupPhase};
use crate::identity::Certificate;
use crate::store::{IdentityStore, StoreError};

/// Result of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The store already held this certificate; nothing was written
    Unchanged,
    /// The certificate was written
    Written,
}

/// Writes the local certificate under the local node's name
pub struct LocalPublisher {
    store: Arc<dyn IdentityStore>,
    config: PublishConfig,
}

impl LocalPublisher {
    /// Create a publisher over `store`
    pub fn new(store: Arc<dyn IdentityStore>, config: PublishConfig) -> Self {
        Self { store, config }
    }

    /// Make `certificate` the published certificate of `node`.
    ///
    /// Conflicts and transient failures are retried up to the configured
    /// attempts; anything else, or running out of attempts, is fatal.
    pub async fn publish(
        &self,
        node: &str,
        certificate: &Certificate,
    ) -> Result<PublishOutcome, Error> {
        let result = retry_with_backoff_if(
            &self.config.retry,
            "publish_certificate",
            || self.publish_once(node, certificate),
            StoreError::is_transient,
        )
        .await;

        match result {
            Ok(outcome) => {
                info!(node = %node, ?outcome, "Local certificate published");
                Ok(outcome)
            }
            Err(e) => {
                error!(node = %node, error = %e, "Failed to publish local certificate");
                Err(Error::fatal_startup(StartupPhase::Publish, e))
            }
        }
    }

    async fn publish_once(
        &self,
        node: &str,
        certificate: &Certificate,
    ) -> Result<PublishOutcome, StoreError> {
        let (current, revision) = match self.store.get(node).await {
            Ok(record) => (record.certificate, record.revision),
            // A corrupt value is just a different value: overwrite it
            Err(StoreError::InvalidRecord {
                message, revision, ..
            }) => {
                warn!(node = %node, error = %message, "Overwriting invalid certificate annotation");
                (None, revision)
            }
            Err(e) => return Err(e),
        };
        if current.as_ref() == Some(certificate) {
            return Ok(PublishOutcome::Unchanged);
        }
        self.store.set(node, certificate, &revision).await?;
        Ok(PublishOutcome::Written)
    }
}
