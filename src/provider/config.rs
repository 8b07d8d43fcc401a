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

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// systemd is only supported on Linux.
pub const OPERATING_SYSTEM: &str = "Linux";

/// Taint applied to the node unless disabled.
pub const TAINT_KEY: &str = "virtual-kubelet.io/provider";
pub const TAINT_VALUE: &str = "systemk";

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:10250";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_UNITS_DIR: &str = "/var/run/systemk";
pub const DEFAULT_RUN_ROOT: &str = "/var/run";

/// Provider configuration, populated from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies the node in the cluster.
    pub node_name: String,

    /// Address to bind for serving requests from the API server.
    pub listen_address: String,

    /// Certificate and key securing the kubelet API; plain HTTP when unset.
    pub server_cert_path: Option<PathBuf>,
    pub server_key_path: Option<PathBuf>,

    /// Path to the client configuration; in-cluster/default when unset.
    pub kubeconfig_path: Option<PathBuf>,

    /// Value backing the `KUBERNETES_SERVICE_*` Pod environment variables.
    pub kubernetes_url: Option<String>,

    /// Recorded in every unit's metadata section.
    pub cluster_name: String,

    /// Suffix appended to search domains for the Pods.
    pub cluster_domain: String,

    /// Desired node addresses.
    pub node_internal_ip: Option<IpAddr>,
    pub node_external_ip: Option<IpAddr>,

    /// Host paths that volumes and run directories may resolve below.
    pub allowed_host_paths: Vec<PathBuf>,

    /// Per-pod run directories live under `<run_root>/<pod-uid>`.
    pub run_root: PathBuf,

    /// Directory the unit manager writes unit files into.
    pub units_dir: PathBuf,

    /// Substitute this uid (and its primary group) whenever a workload
    /// resolves to uid 0.
    pub override_root_uid: Option<u32>,

    /// Do not apply the provider taint.
    pub disable_taint: bool,

    /// Talk to the per-user service manager instead of the system one.
    pub user_mode: bool,

    /// Interval between relisting of cluster resources. Also serves as a
    /// recovery mechanism in case events were lost, e.g. due to a network
    /// partition.
    pub informer_resync: Duration,

    /// How long to wait for caches and the bus at startup.
    pub startup_timeout: Duration,

    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: hostname(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            server_cert_path: None,
            server_key_path: None,
            kubeconfig_path: None,
            kubernetes_url: None,
            cluster_name: String::new(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            node_internal_ip: None,
            node_external_ip: None,
            allowed_host_paths: vec![PathBuf::from("/var")],
            run_root: PathBuf::from(DEFAULT_RUN_ROOT),
            units_dir: PathBuf::from(DEFAULT_UNITS_DIR),
            override_root_uid: None,
            disable_taint: false,
            user_mode: false,
            informer_resync: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The host name, preferring the `HOSTNAME` environment variable.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}
