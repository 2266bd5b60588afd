//! Trellis Operator - CRD-driven resource-graph orchestration

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::bridge::LoggingRemote;
use trellis::crd::{EndpointBridge, GraphDefinition};
use trellis::definition::GraphRegistry;
use trellis::retry::{retry_with_backoff, RetryConfig};
use trellis::runtime::{KubeObjectClient, ObjectClient};

/// Trellis - CRD-driven resource-graph orchestrator for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for the built-in kinds; generated APIs are
        // installed at runtime by the definition controller.
        let definition = serde_yaml::to_string(&GraphDefinition::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let bridge = serde_yaml::to_string(&EndpointBridge::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{definition}---\n{bridge}");
        return Ok(());
    }

    run_controllers().await
}

/// Run the definition and bridge controllers until shutdown
async fn run_controllers() -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    let registry = Arc::new(GraphRegistry::new());
    let remote = Arc::new(LoggingRemote);

    tracing::info!("starting trellis operator");
    tokio::join!(
        trellis::definition::run_controller(client.clone(), registry),
        trellis::bridge::run_controller(client, remote),
    );
    Ok(())
}

/// Ensure the built-in CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply so
/// the served schema always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let objects = KubeObjectClient::new(client.clone());
    for crd in [GraphDefinition::crd(), EndpointBridge::crd()] {
        tracing::info!(name = ?crd.metadata.name, "installing CRD");
        retry_with_backoff(&RetryConfig::default(), "install_crd", || async {
            objects.install_crd(&crd).await
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD: {}", e))?;
    }
    Ok(())
}
