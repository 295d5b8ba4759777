//! Startup utilities: CRD installation and the controller loop

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};

use knitnet_common::crd::Knitnet;
use knitnet_common::FIELD_MANAGER;

use crate::controller::{error_policy, reconcile, Context};

/// Watch timeout in seconds; must stay below the client read timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Name under which the `Knitnet` CRD is registered
pub const KNITNET_CRD_NAME: &str = "knitnets.operator.tkestack.io";

/// The `Knitnet` CRD rendered as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&Knitnet::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Install the `Knitnet` CRD using server-side apply.
///
/// Applied on every start so the stored schema always matches the operator.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing {} CRD...", KNITNET_CRD_NAME);
    crds.patch(KNITNET_CRD_NAME, &params, &Patch::Apply(&Knitnet::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", KNITNET_CRD_NAME, e))?;
    tracing::info!("Knitnet CRD installed/updated");

    Ok(())
}

/// Run the `Knitnet` controller until a shutdown signal arrives
pub async fn run_controller(client: Client, ctx: Arc<Context>) {
    let knitnets: Api<Knitnet> = Api::all(client);

    tracing::info!("Starting Knitnet controller");
    Controller::new(knitnets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Knitnet"))
        .await;
    tracing::info!("Knitnet controller stopped");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
