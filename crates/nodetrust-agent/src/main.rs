//! nodetrust agent - per-node certificate distribution

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use nodetrust_agent::config::Cli;
use nodetrust_agent::pki::LocalPki;
use nodetrust_certs::{CertDistributor, NodeAnnotationStore, TrustCache};
use nodetrust_common::kube_client::{create_client, ConfiguredClientProvider};
use nodetrust_common::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(cli.telemetry())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cli.node_name,
        "Starting nodetrust agent"
    );

    if let Err(e) = run(cli).await {
        error!(error = ?e, "nodetrust agent exiting");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pki = LocalPki::load(&cli.pki_dir)
        .with_context(|| format!("loading key material from {}", cli.pki_dir.display()))?;
    if let Some(info) = pki.certificate.info() {
        info!(
            common_name = %info.common_name,
            not_after = info.not_after,
            "Loaded local certificate"
        );
    }

    let provider = ConfiguredClientProvider::new(cli.kubeconfig.clone());
    let client = create_client(&provider)
        .await
        .context("creating Kubernetes client")?;

    let store = NodeAnnotationStore::new(client)
        .with_annotation_key(cli.annotation_key.clone())
        .with_watch_timeout(cli.watch_timeout_secs);
    let cache = Arc::new(TrustCache::new());

    let mut distributor = CertDistributor::new(
        Arc::new(store),
        cache.clone(),
        cli.node_name.clone(),
        cli.distributor_config(),
    );

    distributor.publish_self(&pki.certificate).await?;
    distributor.sync_all().await?;
    distributor.start_watching()?;

    info!(
        identity = %distributor.identity(),
        peers = cache.len(),
        "Certificate distribution running"
    );

    shutdown_signal().await?;

    distributor.stop_watching().await?;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
