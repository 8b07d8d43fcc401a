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

//! Node registration and status heartbeats.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus, NodeSystemInfo,
    Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::{Config, OPERATING_SYSTEM, TAINT_KEY, TAINT_VALUE};
use crate::shared::error::Result;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Build the Node object to be registered with the cluster.
pub fn configure_node(config: &Config) -> Node {
    let daemon_port = config
        .listen_address
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<i32>().ok())
        .unwrap_or(0);

    let taints = if config.disable_taint {
        Vec::new()
    } else {
        vec![Taint {
            key: TAINT_KEY.to_string(),
            value: Some(TAINT_VALUE.to_string()),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }]
    };

    Node {
        metadata: ObjectMeta {
            name: Some(config.node_name.clone()),
            labels: Some(BTreeMap::from([
                (
                    "node.kubernetes.io/instance-type".to_string(),
                    "systemk".to_string(),
                ),
                ("kubernetes.io/os".to_string(), OPERATING_SYSTEM.to_string()),
                ("kubernetes.io/hostname".to_string(), config.node_name.clone()),
                (
                    "kubernetes.io/arch".to_string(),
                    std::env::consts::ARCH.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(taints),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(node_addresses(config)),
            allocatable: Some(capacity()),
            capacity: Some(capacity()),
            conditions: Some(node_conditions(Time(Utc::now()))),
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(
                    k8s_openapi::api::core::v1::DaemonEndpoint { port: daemon_port },
                ),
            }),
            node_info: Some(NodeSystemInfo {
                architecture: std::env::consts::ARCH.to_string(),
                operating_system: OPERATING_SYSTEM.to_string(),
                kernel_version: read_trimmed("/proc/sys/kernel/osrelease"),
                os_image: os_pretty_name(),
                machine_id: read_trimmed("/etc/machine-id"),
                kubelet_version: config.version.clone(),
                container_runtime_version: format!("systemk://{}", config.version),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn node_addresses(config: &Config) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();
    match config.node_internal_ip {
        Some(ip) => addresses.push(NodeAddress {
            address: ip.to_string(),
            type_: "InternalIP".to_string(),
        }),
        None => warn!("no internal node IP configured"),
    }
    if let Some(ip) = config.node_external_ip {
        addresses.push(NodeAddress {
            address: ip.to_string(),
            type_: "ExternalIP".to_string(),
        });
    }
    addresses
}

fn node_conditions(heartbeat: Time) -> Vec<NodeCondition> {
    let condition = |type_: &str, status: &str, reason: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        last_heartbeat_time: Some(heartbeat.clone()),
        last_transition_time: Some(heartbeat.clone()),
        ..Default::default()
    };
    vec![
        condition("Ready", "True", "KubeletReady"),
        condition("MemoryPressure", "False", "KubeletHasSufficientMemory"),
        condition("DiskPressure", "False", "KubeletHasNoDiskPressure"),
        condition("PIDPressure", "False", "KubeletHasSufficientPID"),
        condition("NetworkUnavailable", "False", "RouteCreated"),
    ]
}

fn capacity() -> BTreeMap<String, Quantity> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpus.to_string())),
        ("memory".to_string(), Quantity(memory_total())),
        ("pods".to_string(), Quantity("110".to_string())),
    ])
}

fn memory_total() -> String {
    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(kb) = rest.split_whitespace().next() {
                return format!("{kb}Ki");
            }
        }
    }
    "0".to_string()
}

fn read_trimmed(path: &str) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn os_pretty_name() -> String {
    let contents = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("PRETTY_NAME=") {
            return name.trim_matches('"').to_string();
        }
    }
    String::new()
}

/// Register the node and keep its status fresh with periodic heartbeats.
pub async fn register_node(client: &Client, config: &Config) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    let node = configure_node(config);
    match api.create(&PostParams::default(), &node).await {
        Ok(_) => info!(node = %config.node_name, "registered node"),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            // Already registered; refresh the status below.
            info!(node = %config.node_name, "node already registered");
        }
        Err(err) => return Err(err.into()),
    }
    patch_status(&api, config).await
}

pub fn spawn_heartbeat(client: Client, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Node> = Api::all(client);
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = patch_status(&api, &config).await {
                warn!(%err, "failed to update node status");
            }
        }
    })
}

async fn patch_status(api: &Api<Node>, config: &Config) -> Result<()> {
    let status = serde_json::json!({
        "status": {
            "addresses": node_addresses(config),
            "conditions": node_conditions(Time(Utc::now())),
        }
    });
    api.patch_status(
        &config.node_name,
        &PatchParams::default(),
        &Patch::Merge(status),
    )
    .await?;
    Ok(())
}
