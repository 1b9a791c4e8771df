//! Identity store abstraction
//!
//! The identity store is the cluster-wide source of truth: every node object
//! carries its agent's certificate as an annotation. This module defines the
//! operations the distribution subsystem needs from it, so the publisher,
//! synchronizer and watcher can be exercised without a cluster.

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::identity::{Certificate, NodeIdentity};

/// Errors returned by an [`IdentityStore`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or returned a server-side failure
    #[error("identity store unavailable: {message}")]
    Unavailable {
        /// Description of the failure
        message: String,
    },

    /// The node object does not exist
    #[error("node {node} not found")]
    NotFound {
        /// Node name that was looked up
        node: String,
    },

    /// The node object changed since it was read
    #[error("conflicting update on node {node}")]
    Conflict {
        /// Node name being written
        node: String,
    },

    /// Credentials rejected or missing permission
    #[error("not authorized: {message}")]
    Unauthorized {
        /// Description from the store
        message: String,
    },

    /// The annotation holds something that is not a certificate
    #[error("invalid certificate on node {node}: {message}")]
    InvalidRecord {
        /// Node carrying the bad annotation
        node: String,
        /// Why the value was rejected
        message: String,
        /// Revision of the node object, so the value can be overwritten
        revision: String,
    },

    /// The resume revision is too old; a fresh listing is required
    #[error("watch revision {revision} expired")]
    Expired {
        /// Revision that was rejected
        revision: String,
    },

    /// The watch stream failed mid-flight
    #[error("watch stream terminated: {message}")]
    StreamTerminated {
        /// Description of the failure
        message: String,
    },
}

impl StoreError {
    /// Create an unavailable error with the given message
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a not-found error for a node
    pub fn not_found(node: impl Into<String>) -> Self {
        Self::NotFound { node: node.into() }
    }

    /// Create a conflict error for a node
    pub fn conflict(node: impl Into<String>) -> Self {
        Self::Conflict { node: node.into() }
    }

    /// Create a stream termination error
    pub fn stream_terminated(message: impl Into<String>) -> Self {
        Self::StreamTerminated {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Conflict { .. } | Self::StreamTerminated { .. }
        )
    }
}

/// A node as seen in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node name (the store key)
    pub node: String,
    /// Published certificate, `None` if the node has not published yet
    pub certificate: Option<Certificate>,
    /// Store revision of the node object
    pub revision: String,
}

impl NodeRecord {
    /// Trust cache identity for this node
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::from_node_name(&self.node)
    }
}

/// Snapshot of all nodes at one store revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeListing {
    /// Names of every node present at `revision`
    pub nodes: Vec<String>,
    /// Revision to start a gap-free watch from
    pub revision: String,
}

/// Kind of change observed on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Node appeared
    Added,
    /// Node object changed
    Modified,
    /// Node was removed
    Deleted,
}

/// A single node change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened
    pub kind: ChangeKind,
    /// Node name (the store key)
    pub node: String,
    /// Certificate carried by the node after the change, if any
    pub certificate: Option<Certificate>,
    /// Store revision of the change
    pub revision: String,
}

impl ChangeEvent {
    /// Trust cache identity for the changed node
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::from_node_name(&self.node)
    }
}

/// Item delivered by a watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A node changed
    Changed(ChangeEvent),
    /// Progress marker: the stream is caught up to `revision`
    Bookmark {
        /// Revision to resume from
        revision: String,
    },
}

/// Stream of store events; ends or yields an error when the subscription dies
pub type ChangeStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Cluster-wide annotation store keyed by node name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read a node's record
    async fn get(&self, node: &str) -> Result<NodeRecord, StoreError>;

    /// List every node currently present
    async fn list(&self) -> Result<NodeListing, StoreError>;

    /// Write a node's certificate, conditional on the node still being at
    /// `revision`. Returns [`StoreError::Conflict`] if it moved on.
    async fn set(
        &self,
        node: &str,
        certificate: &Certificate,
        revision: &str,
    ) -> Result<(), StoreError>;

    /// Subscribe to node changes after `revision`
    async fn watch(&self, revision: &str) -> Result<ChangeStream, StoreError>;
}
