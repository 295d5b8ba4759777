//! Knitnet operator: hosts or joins a multi-cluster broker domain

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use knitnet_common::kube_utils::{api_server_url, create_client};
use knitnet_common::telemetry::{init_telemetry, TelemetryConfig};
use knitnet_common::BROKER_NAMESPACE;
use knitnet_operator::controller::{BrokerSettings, Context};
use knitnet_operator::startup::{crd_yaml, ensure_crds_installed, run_controller};

/// Knitnet - cross-cluster connectivity with non-overlapping global addressing
#[derive(Parser, Debug)]
#[command(name = "knitnet-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Kubeconfig for the local cluster (in-cluster config when unset)
    #[arg(long, env = "KNITNET_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the broker cluster (the local cluster when unset)
    #[arg(long, env = "KNITNET_BROKER_KUBECONFIG")]
    broker_kubeconfig: Option<PathBuf>,

    /// Namespace of the broker domain on the broker cluster
    #[arg(long, env = "KNITNET_BROKER_NAMESPACE", default_value = BROKER_NAMESPACE)]
    broker_namespace: String,

    /// Broker API server advertised to joining clusters (taken from the broker kubeconfig when unset)
    #[arg(long, env = "KNITNET_BROKER_API_SERVER")]
    broker_api_server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "knitnet-operator".to_string(),
        ..Default::default()
    })?;

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let broker_client = match cli.broker_kubeconfig.as_deref() {
        Some(path) => create_client(Some(path)).await?,
        None => client.clone(),
    };
    let broker_api_server = match cli.broker_api_server {
        Some(url) => url,
        None => {
            let kubeconfig = cli.broker_kubeconfig.as_deref().or(cli.kubeconfig.as_deref());
            api_server_url(kubeconfig).await?
        }
    };

    tracing::info!(
        broker_namespace = %cli.broker_namespace,
        broker_api_server = %broker_api_server,
        "Starting knitnet operator"
    );

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::new(
        client.clone(),
        broker_client,
        BrokerSettings {
            namespace: cli.broker_namespace,
            api_server: broker_api_server,
        },
    ));

    run_controller(client, ctx).await;
    Ok(())
}
