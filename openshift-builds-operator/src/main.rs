#[macro_use]
extern crate log;

use kube::Client;
use openshift_builds_operator_apis::OPENSHIFT_BUILD_NAMESPACE_NAME;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_exporter::start_prometheus_metrics_server;
use std::{net::SocketAddr, path::Path, time::Duration};

mod bootstrap;
mod component;
mod errors;
mod openshift_build_controller;
use openshift_build_controller::*;
mod openshift_build_modifications;
mod prometheus_exporter;
mod store;
#[cfg(test)]
mod testing;
mod utils;

/// The K8s field manager name.
const MANAGER: &'static str = "openshift-builds-operator";

/// The K8s finalizer name, set on the root object and on every component.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. So, think twice before you rename it, otherwise users might
/// be stuck with K8s objects which cannot be deleted as they have a finalizer
/// set which is not automatically removed.
const FINALIZER: &'static str = "operator.openshift.io/openshiftbuilds";

/// Namespace of the pod, mounted with the service account token.
const SERVICE_ACCOUNT_NAMESPACE: &'static str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const DEFAULT_BOOTSTRAP_TIMEOUT_SECONDS: u64 = 120;

#[derive(Clone)]
struct Configuration {
    client: Client,
    /// Namespace the components are deployed to.
    target_namespace: String,
    /// Upper bound for waiting on the CRD during bootstrap.
    bootstrap_timeout: Duration,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        let target_namespace = resolve_target_namespace(
            env_var("TARGET_NAMESPACE"),
            Path::new(SERVICE_ACCOUNT_NAMESPACE),
        );
        info!("Components are deployed to namespace {}", target_namespace);
        let bootstrap_timeout = match env_var("BOOTSTRAP_TIMEOUT_SECONDS") {
            Some(v) => Duration::from_secs(v.parse()?),
            None => Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECONDS),
        };
        Ok(Configuration {
            client,
            target_namespace,
            bootstrap_timeout,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Explicit configuration first, then the namespace the operator runs in.
fn resolve_target_namespace(configured: Option<String>, service_account_namespace: &Path) -> String {
    configured
        .or_else(|| {
            std::fs::read_to_string(service_account_namespace)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| OPENSHIFT_BUILD_NAMESPACE_NAME.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;
    env_logger::init();
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr: SocketAddr = format!("{}:{}", metrics_addr, metrics_port).parse()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client)?;
    bootstrap::bootstrap(&configuration).await?;
    let controller = OpenShiftBuildController::new(&configuration).start(configuration.client.clone());
    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       r = prometheus_metrics_exporter => r?,
    };
    Ok(())
}
