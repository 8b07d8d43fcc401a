// Copyright 2025 The systemk authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command line surface and the run loop wiring everything together.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::server;
use crate::http::KubeletApi;
use crate::infrastructure::kubernetes::client::{new_client, spawn_pod_informer, ResourceInformers};
use crate::infrastructure::kubernetes::watcher::{PodResourceWatcher, ResourceUpdater};
use crate::infrastructure::ospkg;
use crate::infrastructure::systemd::SystemdManager;
use crate::provider::config::{
    hostname, DEFAULT_CLUSTER_DOMAIN, DEFAULT_LISTEN_ADDRESS, DEFAULT_RUN_ROOT, DEFAULT_UNITS_DIR,
};
use crate::provider::node::{register_node, spawn_heartbeat};
use crate::provider::{Config, Provider};
use crate::shared::error::Result;

#[derive(Parser, Debug)]
#[command(
    name = "systemk",
    version,
    about = "A virtual kubelet that runs Kubernetes Pods as systemd services"
)]
pub struct CliArgs {
    /// Name under which the node registers; defaults to the hostname
    #[arg(long)]
    pub node_name: Option<String>,

    /// Address to bind for serving requests from the API server
    #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Certificate to secure the kubelet API
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// Private key to sign the kubelet API
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Path to the Kubernetes client configuration
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Value backing the KUBERNETES_SERVICE_* Pod environment variables
    #[arg(long)]
    pub kubernetes_url: Option<String>,

    /// Cluster name recorded in every generated unit
    #[arg(long, default_value = "")]
    pub cluster_name: String,

    /// Suffix appended to search domains for the Pods
    #[arg(long, default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// Desired internal node IP
    #[arg(long)]
    pub node_internal_ip: Option<IpAddr>,

    /// Desired external node IP
    #[arg(long)]
    pub node_external_ip: Option<IpAddr>,

    /// Host path volumes and run directories must resolve below one of
    /// these roots; may be repeated
    #[arg(long = "allowed-host-path", default_value = "/var")]
    pub allowed_host_paths: Vec<PathBuf>,

    /// Per-pod run directories are created under this root
    #[arg(long, default_value = DEFAULT_RUN_ROOT)]
    pub run_root: PathBuf,

    /// Directory unit files are written into
    #[arg(long, default_value = DEFAULT_UNITS_DIR)]
    pub units_dir: PathBuf,

    /// Substitute this uid for workloads that resolve to root
    #[arg(long)]
    pub override_root_uid: Option<u32>,

    /// Do not apply the virtual-kubelet.io/provider taint
    #[arg(long)]
    pub disable_taint: bool,

    /// Talk to the per-user service manager instead of the system one
    #[arg(long)]
    pub user_mode: bool,

    /// Seconds between relisting of Kubernetes resources
    #[arg(long, default_value_t = 60)]
    pub informer_resync: u64,

    /// Seconds to wait for startup (informer caches, bus)
    #[arg(long, default_value_t = 30)]
    pub startup_timeout: u64,
}

impl CliArgs {
    pub fn into_config(self) -> Config {
        Config {
            node_name: self.node_name.unwrap_or_else(hostname),
            listen_address: self.listen_address,
            server_cert_path: self.cert_file,
            server_key_path: self.key_file,
            kubeconfig_path: self.kubeconfig,
            kubernetes_url: self.kubernetes_url,
            cluster_name: self.cluster_name,
            cluster_domain: self.cluster_domain,
            node_internal_ip: self.node_internal_ip,
            node_external_ip: self.node_external_ip,
            allowed_host_paths: self.allowed_host_paths,
            run_root: self.run_root,
            units_dir: self.units_dir,
            override_root_uid: self.override_root_uid,
            disable_taint: self.disable_taint,
            user_mode: self.user_mode,
            informer_resync: Duration::from_secs(self.informer_resync),
            startup_timeout: Duration::from_secs(self.startup_timeout),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The informers are started before the provider exists; events arriving
/// in that window are dropped, the initial relist covers them.
#[derive(Default)]
struct DeferredUpdater {
    provider: OnceLock<Arc<Provider>>,
}

impl DeferredUpdater {
    fn set(&self, provider: Arc<Provider>) {
        let _ = self.provider.set(provider);
    }
}

#[async_trait]
impl ResourceUpdater for DeferredUpdater {
    async fn update_config_map(&self, pod: &Pod, config_map: &ConfigMap) -> Result<()> {
        match self.provider.get() {
            Some(provider) => provider.update_config_map(pod, config_map).await,
            None => Ok(()),
        }
    }

    async fn update_secret(&self, pod: &Pod, secret: &Secret) -> Result<()> {
        match self.provider.get() {
            Some(provider) => provider.update_secret(pod, secret).await,
            None => Ok(()),
        }
    }
}

/// Run the agent until cancelled. Startup failures (bus connection, units
/// directory, TLS, informer sync) abort with an error; a delivered
/// interrupt or termination signal shuts down cleanly.
pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.into_config());
    info!(
        node = %config.node_name,
        version = %config.version,
        "starting systemk"
    );

    let unit_manager = Arc::new(
        SystemdManager::new(&config.units_dir, config.user_mode)
            .await
            .context("failed to connect to the service manager")?,
    );
    let pkg_manager: Arc<dyn ospkg::PackageManager> = Arc::from(ospkg::detect());
    if matches!(ospkg::os_release_id().as_str(), "debian" | "ubuntu") {
        // Prevents installed daemons from starting on their own.
        if let Err(err) = pkg_manager.install("policyrcd-script-zg2", "").await {
            warn!(%err, "failed to install policyrcd-script-zg2, continuing anyway");
        }
    }

    let client = new_client(config.kubeconfig_path.as_deref())
        .await
        .context("failed to set up the cluster client")?;

    let resources = Arc::new(PodResourceWatcher::new());
    let updater = Arc::new(DeferredUpdater::default());
    let informers = ResourceInformers::start(client.clone(), resources.clone(), updater.clone());

    let provider = Arc::new(Provider::new(
        config.clone(),
        unit_manager,
        pkg_manager,
        resources,
        informers.config_maps.clone(),
        informers.secrets.clone(),
    ));
    updater.set(provider.clone());

    informers
        .wait_ready(config.startup_timeout)
        .await
        .context("informer caches did not sync")?;

    if let Err(err) = provider.sweep_orphaned_run_dirs().await {
        warn!(%err, "failed to sweep orphaned run directories");
    }

    register_node(&client, &config)
        .await
        .context("failed to register the node")?;
    let heartbeat = spawn_heartbeat(client.clone(), config.clone());
    let pod_informer = spawn_pod_informer(client.clone(), &config.node_name, provider.clone());
    let status_sync = spawn_pod_status_sync(client, provider.clone(), config.informer_resync);

    let api = Arc::new(KubeletApi::new(provider));
    let server_config = config.clone();
    let mut api_server = tokio::spawn(async move { server::serve(api, &server_config).await });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("termination signal received, shutting down");
            Ok(())
        }
        joined = &mut api_server => match joined {
            Ok(server_result) => server_result.context("kubelet API server failed"),
            Err(err) => Err(err).context("kubelet API server panicked"),
        },
    };

    api_server.abort();
    heartbeat.abort();
    pod_informer.abort();
    status_sync.abort();
    informers.abort();
    result
}

/// Push the status of every materialized Pod back to the API server on the
/// resync interval.
fn spawn_pod_status_sync(
    client: Client,
    provider: Arc<Provider>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pods = match provider.get_pods().await {
                Ok(pods) => pods,
                Err(err) => {
                    warn!(%err, "failed to list pods for status sync");
                    continue;
                }
            };
            for pod in pods {
                let (Some(namespace), Some(name), Some(status)) = (
                    pod.metadata.namespace.as_deref(),
                    pod.metadata.name.as_deref(),
                    pod.status.as_ref(),
                ) else {
                    continue;
                };
                let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
                let patch = serde_json::json!({ "status": status });
                if let Err(err) = api
                    .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
                {
                    debug!(namespace, pod = name, %err, "failed to patch pod status");
                }
            }
        }
    })
}
