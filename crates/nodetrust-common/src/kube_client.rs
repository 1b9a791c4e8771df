//! Kubernetes client provider for dependency injection
//!
//! Provides trait-based access to kube::Client creation,
//! enabling dependency injection and mocking for tests.

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use thiserror::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients.
///
/// Watch requests must ask the API server for a shorter timeout than this,
/// otherwise a quiet watch is aborted by the client first.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// Errors raised while building a Kubernetes client
#[derive(Debug, Error)]
pub enum KubeClientError {
    /// The explicit kubeconfig could not be read or resolved
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    /// Neither in-cluster nor default kubeconfig configuration was usable
    #[error("failed to infer kubernetes config: {0}")]
    Infer(#[from] InferConfigError),

    /// The client could not be constructed from the config
    #[error("failed to create kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Trait for creating Kubernetes clients
///
/// This abstracts kube::Client creation, enabling proper unit testing
/// without requiring a real Kubernetes cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KubeClientProvider: Send + Sync {
    /// Create a new Kubernetes client
    async fn create(&self) -> Result<Client, KubeClientError>;
}

/// Creates clients from an explicit kubeconfig file, or infers the config
/// (in-cluster service account, then `$KUBECONFIG` / `~/.kube/config`).
#[derive(Clone, Debug, Default)]
pub struct ConfiguredClientProvider {
    /// Explicit kubeconfig path; `None` means infer
    pub kubeconfig: Option<PathBuf>,
    /// Connection timeout
    pub connect_timeout: Option<Duration>,
    /// Read timeout
    pub read_timeout: Option<Duration>,
}

impl ConfiguredClientProvider {
    /// Provider with default timeouts
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        }
    }

    async fn load_config(&self) -> Result<Config, KubeClientError> {
        match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                let options = KubeConfigOptions::default();
                Ok(Config::from_custom_kubeconfig(kubeconfig, &options).await?)
            }
            None => Ok(Config::infer().await?),
        }
    }
}

#[async_trait::async_trait]
impl KubeClientProvider for ConfiguredClientProvider {
    async fn create(&self) -> Result<Client, KubeClientError> {
        let mut config = self.load_config().await?;
        config.connect_timeout = self.connect_timeout;
        config.read_timeout = self.read_timeout;
        Ok(Client::try_from(config)?)
    }
}

/// Create a Kubernetes client with logging of the chosen source.
pub async fn create_client(
    provider: &dyn KubeClientProvider,
) -> Result<Client, KubeClientError> {
    match provider.create().await {
        Ok(client) => {
            tracing::debug!(
                default_namespace = %client.default_namespace(),
                "Kubernetes client created"
            );
            Ok(client)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to create Kubernetes client");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_provider_defaults() {
        let provider = ConfiguredClientProvider::new(None);
        assert!(provider.kubeconfig.is_none());
        assert_eq!(provider.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(provider.read_timeout, Some(DEFAULT_READ_TIMEOUT));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_file_is_error() {
        let provider = ConfiguredClientProvider::new(Some(PathBuf::from(
            "/nonexistent/nodetrust/kubeconfig",
        )));
        assert!(matches!(
            provider.create().await,
            Err(KubeClientError::Kubeconfig(_))
        ));
    }

    #[tokio::test]
    async fn test_create_client_propagates_provider_error() {
        let mut mock = MockKubeClientProvider::new();
        mock.expect_create()
            .times(1)
            .returning(|| Err(KubeClientError::Kubeconfig(KubeconfigError::FindPath)));

        match create_client(&mock).await {
            Err(e) => assert!(e.to_string().contains("failed to load kubeconfig")),
            Ok(_) => panic!("expected provider error"),
        }
    }
}
