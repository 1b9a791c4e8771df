//! Command-line and environment configuration for the agent

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nodetrust_certs::config::{
    DistributorConfig, EvictionPolicy, PublishConfig, SyncConfig, WatchConfig,
    DEFAULT_ANNOTATION_KEY, DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_SYNC_CONCURRENCY,
};
use nodetrust_certs::kube_store::DEFAULT_WATCH_TIMEOUT_SECS;
use nodetrust_common::retry::RetryConfig;
use nodetrust_common::telemetry::{LogFormat, TelemetryConfig};

/// Default location of the node's key material
pub const DEFAULT_PKI_DIR: &str = "/var/lib/nodetrust/pki";

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    #[default]
    Text,
    /// JSON lines
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// nodetrust agent - publishes this node's certificate and tracks its peers
#[derive(Parser, Debug, Clone)]
#[command(name = "nodetrust-agent", version, about, long_about = None)]
pub struct Cli {
    /// Name of the Node object this agent runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Kubeconfig path (in-cluster or default config if not set)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Directory holding key.pem, cert.pem and ca.pem
    #[arg(long, env = "NODETRUST_PKI_DIR", default_value = DEFAULT_PKI_DIR)]
    pub pki_dir: PathBuf,

    /// Node annotation carrying the certificate
    #[arg(long, env = "NODETRUST_ANNOTATION_KEY", default_value = DEFAULT_ANNOTATION_KEY)]
    pub annotation_key: String,

    /// Log level: trace, debug, info, warn, error or fatal
    #[arg(long, env = "NODETRUST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "NODETRUST_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    /// Concurrent node reads during a full sync
    #[arg(long, default_value_t = DEFAULT_SYNC_CONCURRENCY)]
    pub sync_concurrency: usize,

    /// Attempts to publish the local certificate before giving up
    #[arg(long, default_value_t = DEFAULT_PUBLISH_ATTEMPTS)]
    pub publish_attempts: u32,

    /// Server-side timeout of each watch request
    #[arg(long, default_value_t = DEFAULT_WATCH_TIMEOUT_SECS)]
    pub watch_timeout_secs: u32,

    /// Re-list nodes this often and evict departed ones (disabled if unset)
    #[arg(long, env = "NODETRUST_RECONCILE_INTERVAL_SECS")]
    pub reconcile_interval_secs: Option<u64>,

    /// Initial watch resubscribe delay
    #[arg(long, default_value_t = 1000)]
    pub backoff_initial_ms: u64,

    /// Maximum watch resubscribe delay
    #[arg(long, default_value_t = 60)]
    pub backoff_max_secs: u64,
}

impl Cli {
    /// Logging settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level.clone(),
            format: self.log_format.into(),
        }
    }

    /// Distribution settings
    pub fn distributor_config(&self) -> DistributorConfig {
        let sync = SyncConfig {
            concurrency: self.sync_concurrency.max(1),
        };

        let eviction = match self.reconcile_interval_secs {
            Some(secs) if secs > 0 => EvictionPolicy::Reconcile {
                interval: Duration::from_secs(secs),
            },
            _ => EvictionPolicy::OnDeleteOnly,
        };

        let publish_defaults = PublishConfig::default();
        let watch_defaults = WatchConfig::default();

        DistributorConfig {
            publish: PublishConfig {
                retry: RetryConfig {
                    max_attempts: self.publish_attempts.max(1),
                    ..publish_defaults.retry
                },
            },
            sync: sync.clone(),
            watch: WatchConfig {
                backoff: RetryConfig {
                    initial_delay: Duration::from_millis(self.backoff_initial_ms.max(1)),
                    max_delay: Duration::from_secs(self.backoff_max_secs.max(1)),
                    ..watch_defaults.backoff
                },
                eviction,
                sync,
            },
        }
    }
}
