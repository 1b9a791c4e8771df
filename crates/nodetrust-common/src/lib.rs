//! Common utilities for nodetrust: backoff, telemetry and Kubernetes client setup

#![deny(missing_docs)]

pub mod kube_client;
pub mod retry;
pub mod telemetry;

/// Field manager name used for every write to the Kubernetes API
pub const FIELD_MANAGER: &str = "nodetrust-agent";
