//! Local trust cache of peer certificates
//!
//! Every mutation path (initial synchronization, watch updates, stale-entry
//! reconciliation) goes through [`TrustCache`], which is the single point
//! enforcing "one certificate per identity, latest write wins". Effective
//! changes are forwarded to an optional downstream [`PublicKeyAdder`], which
//! is how the token verifier learns about peers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::identity::{Certificate, NodeIdentity};

/// Capability to register and unregister peer public keys.
///
/// Implemented by the trust cache itself and by whatever consumes peer keys
/// for token verification. Implementations must not block. A cache's sink is
/// called while the cache's write lock is held, so the sink sees changes in
/// the order the cache applied them and must not call back into that cache.
pub trait PublicKeyAdder: Send + Sync {
    /// Register (or replace) the certificate for `identity`
    fn add_public_key(&self, identity: &NodeIdentity, certificate: &Certificate);

    /// Forget the certificate for `identity`
    fn remove_public_key(&self, identity: &NodeIdentity);
}

/// Outcome of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// First certificate for the identity
    Inserted,
    /// Different certificate replaced the previous one
    Replaced,
    /// Identical certificate already present
    Unchanged,
}

/// Concurrency-safe map from node identity to certificate
#[derive(Default)]
pub struct TrustCache {
    entries: RwLock<HashMap<NodeIdentity, Certificate>>,
    sink: Option<Arc<dyn PublicKeyAdder>>,
}

impl TrustCache {
    /// Create an empty cache with no downstream consumer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache that forwards effective changes to `sink`
    pub fn with_sink(sink: Arc<dyn PublicKeyAdder>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Insert or replace the certificate for `identity`
    pub fn insert(&self, identity: &NodeIdentity, certificate: &Certificate) -> CacheUpdate {
        let update = {
            let mut entries = self.entries.write();
            let update = match entries.get(identity) {
                Some(existing) if existing == certificate => CacheUpdate::Unchanged,
                Some(_) => CacheUpdate::Replaced,
                None => CacheUpdate::Inserted,
            };
            if update != CacheUpdate::Unchanged {
                entries.insert(identity.clone(), certificate.clone());
                if let Some(sink) = &self.sink {
                    sink.add_public_key(identity, certificate);
                }
            }
            update
        };

        match update {
            CacheUpdate::Inserted => info!(identity = %identity, "Trusting new peer certificate"),
            CacheUpdate::Replaced => info!(identity = %identity, "Peer certificate replaced"),
            CacheUpdate::Unchanged => debug!(identity = %identity, "Peer certificate unchanged"),
        }
        update
    }

    /// Remove the certificate for `identity`; returns whether one existed
    pub fn remove(&self, identity: &NodeIdentity) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.remove(identity).is_some();
            if removed {
                if let Some(sink) = &self.sink {
                    sink.remove_public_key(identity);
                }
            }
            removed
        };
        if removed {
            info!(identity = %identity, "Peer certificate removed");
        } else {
            debug!(identity = %identity, "No certificate to remove");
        }
        removed
    }

    /// Remove every entry whose identity is not in `keep`; returns the
    /// evicted identities
    pub fn retain_only(&self, keep: &[NodeIdentity]) -> Vec<NodeIdentity> {
        let stale: Vec<NodeIdentity> = self
            .entries
            .read()
            .keys()
            .filter(|identity| !keep.contains(identity))
            .cloned()
            .collect();

        stale
            .into_iter()
            .filter(|identity| self.remove(identity))
            .collect()
    }

    /// Certificate for `identity`, if trusted
    pub fn get(&self, identity: &NodeIdentity) -> Option<Certificate> {
        self.entries.read().get(identity).cloned()
    }

    /// Whether `identity` is trusted
    pub fn contains(&self, identity: &NodeIdentity) -> bool {
        self.entries.read().contains_key(identity)
    }

    /// Number of trusted identities
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no identity is trusted
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sorted list of trusted identities
    pub fn identities(&self) -> Vec<NodeIdentity> {
        let mut identities: Vec<_> = self.entries.read().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Copy of the whole cache
    pub fn snapshot(&self) -> HashMap<NodeIdentity, Certificate> {
        self.entries.read().clone()
    }
}

impl PublicKeyAdder for TrustCache {
    fn add_public_key(&self, identity: &NodeIdentity, certificate: &Certificate) {
        self.insert(identity, certificate);
    }

    fn remove_public_key(&self, identity: &NodeIdentity) {
        self.remove(identity);
    }
}

impl std::fmt::Debug for TrustCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustCache")
            .field("entries", &self.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
