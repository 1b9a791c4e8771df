//! Cluster-wide node certificate distribution
//!
//! Each node agent publishes its certificate as an annotation on its own
//! `Node` object, loads every peer's certificate into a [`TrustCache`], and
//! keeps the cache current by watching node changes. Enforcement code reads
//! the cache (or receives updates through a [`PublicKeyAdder`]) to verify
//! peers by identity.

#![deny(missing_docs)]

pub mod config;
pub mod distributor;
pub mod error;
pub mod identity;
pub mod kube_store;
pub mod publisher;
pub mod store;
pub mod sync;
pub mod trust_cache;
pub mod watcher;

pub use config::{DistributorConfig, EvictionPolicy};
pub use distributor::{CertDistributor, Phase};
pub use error::Error;
pub use identity::{Certificate, NodeIdentity, MAX_SERVER_NAME_LEN};
pub use kube_store::NodeAnnotationStore;
pub use store::{IdentityStore, StoreError};
pub use trust_cache::{PublicKeyAdder, TrustCache};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
