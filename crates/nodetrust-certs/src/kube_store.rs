//! Kubernetes-backed identity store
//!
//! Certificates live in an annotation on each `Node` object. Only object
//! metadata is ever fetched, which keeps list and watch traffic small on
//! large clusters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams, WatchParams};
use kube::core::{ErrorResponse, PartialObjectMeta, WatchEvent};
use kube::{Api, Client};
use nodetrust_common::FIELD_MANAGER;
use tracing::{debug, warn};

use crate::config::DEFAULT_ANNOTATION_KEY;
use crate::identity::Certificate;
use crate::store::{
    ChangeEvent, ChangeKind, ChangeStream, IdentityStore, NodeListing, NodeRecord, StoreError,
    StoreEvent,
};

/// Default server-side watch timeout; the API server rejects 295s and above
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// [`IdentityStore`] over `Node` annotations
#[derive(Clone)]
pub struct NodeAnnotationStore {
    api: Api<Node>,
    annotation_key: String,
    watch_timeout_secs: u32,
}

impl NodeAnnotationStore {
    /// Store using the default annotation key
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            annotation_key: DEFAULT_ANNOTATION_KEY.to_string(),
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    /// Use a different annotation key
    pub fn with_annotation_key(mut self, key: impl Into<String>) -> Self {
        self.annotation_key = key.into();
        self
    }

    /// Set the server-side watch timeout, clamped below the API server limit
    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, DEFAULT_WATCH_TIMEOUT_SECS);
        self
    }
}

#[async_trait]
impl IdentityStore for NodeAnnotationStore {
    async fn get(&self, node: &str) -> Result<NodeRecord, StoreError> {
        let meta = self
            .api
            .get_metadata(node)
            .await
            .map_err(|e| map_kube_error(e, node))?;

        let revision = meta.metadata.resource_version.clone().unwrap_or_default();
        let certificate = decode_annotation(&meta.metadata, &self.annotation_key).map_err(
            |message| StoreError::InvalidRecord {
                node: node.to_string(),
                message,
                revision: revision.clone(),
            },
        )?;

        Ok(NodeRecord {
            node: node.to_string(),
            certificate,
            revision,
        })
    }

    async fn list(&self) -> Result<NodeListing, StoreError> {
        let list = self
            .api
            .list_metadata(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, ""))?;

        let nodes = list
            .items
            .into_iter()
            .filter_map(|item| item.metadata.name)
            .collect();

        Ok(NodeListing {
            nodes,
            revision: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn set(
        &self,
        node: &str,
        certificate: &Certificate,
        revision: &str,
    ) -> Result<(), StoreError> {
        let patch = annotation_patch(&self.annotation_key, certificate, revision);
        self.api
            .patch_metadata(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, node))?;

        debug!(node = %node, revision = %revision, "Wrote certificate annotation");
        Ok(())
    }

    async fn watch(&self, revision: &str) -> Result<ChangeStream, StoreError> {
        let params = watch_params(self.watch_timeout_secs);

        let events = self
            .api
            .watch_metadata(&params, revision)
            .await
            .map_err(|e| map_kube_error(e, ""))?;

        let key = self.annotation_key.clone();
        let stream = events
            .map_err(|e| match map_kube_error(e, "") {
                StoreError::Expired { revision } => StoreError::Expired { revision },
                other => StoreError::stream_terminated(other.to_string()),
            })
            .filter_map(move |item| {
                let translated = match item {
                    Ok(event) => translate_event(event, &key),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(translated)
            });

        Ok(stream.boxed())
    }
}

/// Map a kube error to a store error. `node` names the object for
/// per-node errors and may be empty for collection calls.
fn map_kube_error(error: kube::Error, node: &str) -> StoreError {
    match error {
        kube::Error::Api(ae) => map_error_response(&ae, node),
        other => StoreError::unavailable(other.to_string()),
    }
}

fn map_error_response(ae: &ErrorResponse, node: &str) -> StoreError {
    match ae.code {
        404 => StoreError::not_found(node),
        409 => StoreError::conflict(node),
        401 | 403 => StoreError::Unauthorized {
            message: ae.message.clone(),
        },
        410 => StoreError::Expired {
            revision: ae.message.clone(),
        },
        _ => StoreError::unavailable(format!("{} ({})", ae.message, ae.code)),
    }
}

/// Read the certificate annotation. `Ok(None)` if absent or empty.
fn decode_annotation(meta: &ObjectMeta, key: &str) -> Result<Option<Certificate>, String> {
    match meta.annotations.as_ref().and_then(|a| a.get(key)) {
        Some(value) if !value.trim().is_empty() => Certificate::from_pem(value.clone())
            .map(Some)
            .map_err(|e| e.to_string()),
        _ => Ok(None),
    }
}

/// Merge patch that sets the annotation, guarded by `revision`
fn annotation_patch(key: &str, certificate: &Certificate, revision: &str) -> serde_json::Value {
    let mut annotations = BTreeMap::new();
    annotations.insert(key.to_string(), certificate.as_pem().to_string());

    serde_json::json!({
        "metadata": {
            "resourceVersion": revision,
            "annotations": annotations,
        }
    })
}

fn translate_event(
    event: WatchEvent<PartialObjectMeta<Node>>,
    key: &str,
) -> Option<Result<StoreEvent, StoreError>> {
    let (kind, meta) = match event {
        WatchEvent::Added(obj) => (ChangeKind::Added, obj.metadata),
        WatchEvent::Modified(obj) => (ChangeKind::Modified, obj.metadata),
        WatchEvent::Deleted(obj) => (ChangeKind::Deleted, obj.metadata),
        WatchEvent::Bookmark(bookmark) => {
            return Some(Ok(StoreEvent::Bookmark {
                revision: bookmark.metadata.resource_version,
            }))
        }
        WatchEvent::Error(ae) => {
            return Some(Err(match map_error_response(&ae, "") {
                StoreError::Expired { revision } => StoreError::Expired { revision },
                other => StoreError::stream_terminated(other.to_string()),
            }))
        }
    };

    let Some(node) = meta.name.clone() else {
        debug!("Ignoring watch event for node without a name");
        return None;
    };

    let certificate = if kind == ChangeKind::Deleted {
        None
    } else {
        match decode_annotation(&meta, key) {
            Ok(certificate) => certificate,
            Err(message) => {
                warn!(node = %node, error = %message, "Ignoring invalid certificate annotation");
                None
            }
        }
    };

    Some(Ok(StoreEvent::Changed(ChangeEvent {
        kind,
        node,
        certificate,
        revision: meta.resource_version.unwrap_or_default(),
    })))
}

/// Watch parameters; bookmarks are on by default in `WatchParams`
fn watch_params(timeout_secs: u32) -> WatchParams {
    WatchParams::default().timeout(timeout_secs)
}
