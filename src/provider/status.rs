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

//! Reverse mapping from live unit state to a Pod and its status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tracing::{error, warn};

use super::Provider;
use crate::domain::unit::name as unitname;
use crate::domain::unit::{UnitFile, KUBERNETES_SECTION};
use crate::infrastructure::systemd::UnitState;
use crate::shared::error::Result;

impl Provider {
    /// Synthesize a Pod from the unit set matching its prefix. Any one unit
    /// serves as the metadata source, since all of them carry the same
    /// workload identity. A unit without the metadata section is corrupt:
    /// it is stopped and unloaded, and the Pod is reported as absent.
    pub(crate) async fn stats_to_pod(
        &self,
        stats: &BTreeMap<String, UnitState>,
    ) -> Result<Option<Pod>> {
        let Some((name, state)) = stats.iter().next() else {
            return Ok(None);
        };
        let uf = match UnitFile::parse(&state.unit_data) {
            Ok(uf) => uf,
            Err(err) => {
                error!(unit = %name, %err, "error while parsing unit file");
                UnitFile::default()
            }
        };

        if !uf.has_section(KUBERNETES_SECTION) {
            warn!(unit = %name, "unit did not contain the {KUBERNETES_SECTION} section, removing");
            if let Err(err) = self.unit_manager.trigger_stop(name).await {
                error!(unit = %name, %err, "failed to trigger stop");
            }
            if let Err(err) = self.unit_manager.unload(name).await {
                error!(unit = %name, %err, "failed to unload");
            }
            if let Err(err) = self.unit_manager.reload().await {
                error!(%err, "failed to reload the service manager");
            }
            return Ok(None);
        }

        // Metadata as injected at create time. ClusterName is carried in
        // the unit but has no ObjectMeta field anymore upstream.
        let namespace = uf
            .first_value(KUBERNETES_SECTION, "Namespace")
            .unwrap_or_default()
            .to_string();
        let uid = uf
            .first_value(KUBERNETES_SECTION, "Id")
            .unwrap_or_default()
            .to_string();
        let pod_name = unitname::parse(name)
            .map(|p| p.pod.to_string())
            .unwrap_or_default();

        let (containers, init_containers) = to_containers(stats);
        let (statuses, init_statuses) = self.to_container_statuses(stats).await;
        let start_time = Time(timestamp_to_time(
            &self
                .unit_manager
                .service_property(name, "ExecMainStartTimestamp")
                .await,
        ));
        let phase = to_phase(&statuses);
        let node_ip = self.config.node_internal_ip.map(|ip| ip.to_string());

        Ok(Some(Pod {
            metadata: ObjectMeta {
                name: Some(pod_name),
                namespace: Some(namespace),
                uid: Some(uid),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(self.config.node_name.clone()),
                volumes: Some(Vec::new()),
                containers,
                init_containers: Some(init_containers),
                ..Default::default()
            }),
            status: Some(PodStatus {
                host_ip: node_ip.clone(),
                // Workloads run in the host network.
                pod_ip: node_ip,
                phase: Some(phase.to_string()),
                message: Some(phase.to_string()),
                conditions: Some(pod_conditions(&start_time)),
                container_statuses: Some(statuses),
                init_container_statuses: Some(init_statuses),
                start_time: Some(start_time),
                ..Default::default()
            }),
        }))
    }

    async fn to_container_statuses(
        &self,
        stats: &BTreeMap<String, UnitState>,
    ) -> (Vec<ContainerStatus>, Vec<ContainerStatus>) {
        let mut statuses = Vec::new();
        let mut init_statuses = Vec::new();
        for (name, state) in stats {
            let uf = UnitFile::parse(&state.unit_data).unwrap_or_default();
            let container_name = unitname::parse(name)
                .map(|p| p.container.to_string())
                .unwrap_or_default();
            let image = uf
                .first_value(KUBERNETES_SECTION, "Image")
                .unwrap_or(container_name.as_str())
                .to_string();
            let restarts = self
                .unit_manager
                .service_property(name, "NRestarts")
                .await
                .parse::<i32>()
                .unwrap_or(0);
            let container_state = self.container_state(state).await;
            let status = ContainerStatus {
                name: container_name,
                state: Some(container_state.clone()),
                last_state: Some(container_state),
                ready: true,
                restart_count: restarts,
                image_id: hash(&image),
                image,
                container_id: Some(format!(
                    "pid://{}",
                    self.unit_manager.service_property(name, "MainPID").await
                )),
                ..Default::default()
            };
            if uf.first_value(KUBERNETES_SECTION, "InitContainer").is_some() {
                init_statuses.push(status);
            } else {
                statuses.push(status);
            }
        }
        (statuses, init_statuses)
    }

    /// Derive the container state from the unit's sub-state, see
    /// `systemctl --state=help`.
    pub(crate) async fn container_state(&self, unit: &UnitState) -> ContainerState {
        let sub = unit.sub_state.as_str();
        if sub.starts_with("stop") || sub == "failed" || sub == "exited" {
            return self.terminated_state(&unit.name).await;
        }
        if sub == "dead" {
            // Either ran to completion, or is still waiting to be run.
            let exit_stamp = self
                .unit_manager
                .service_property(&unit.name, "ExecMainExitTimestamp")
                .await
                .parse::<i64>()
                .unwrap_or(0);
            if exit_stamp > 0 {
                return self.terminated_state(&unit.name).await;
            }
            return waiting_state(sub);
        }
        if sub.starts_with("start") || sub == "condition" {
            return waiting_state(sub);
        }
        if sub == "running" || sub == "auto-restart" || sub == "reload" {
            let started = self
                .unit_manager
                .service_property(&unit.name, "ExecMainStartTimestamp")
                .await;
            return ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(Time(timestamp_to_time(&started))),
                }),
                ..Default::default()
            };
        }

        warn!(unit = %unit.name, sub_state = sub, "unhandled sub-state");
        ContainerState::default()
    }

    async fn terminated_state(&self, name: &str) -> ContainerState {
        let exit_code = self
            .unit_manager
            .service_property(name, "ExecMainStatus")
            .await
            .parse::<i32>()
            .unwrap_or(0);
        let reason = if exit_code == 0 { "Succeeded" } else { "Failed" };
        let started = self
            .unit_manager
            .service_property(name, "ExecMainStartTimestamp")
            .await;
        let finished = self
            .unit_manager
            .service_property(name, "ExecMainExitTimestamp")
            .await;
        let pid = self.unit_manager.service_property(name, "MainPID").await;
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                reason: Some(reason.to_string()),
                message: Some(reason.to_string()),
                started_at: Some(Time(timestamp_to_time(&started))),
                finished_at: Some(Time(timestamp_to_time(&finished))),
                container_id: Some(format!("pid://{pid}")),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn to_containers(stats: &BTreeMap<String, UnitState>) -> (Vec<Container>, Vec<Container>) {
    let mut containers = Vec::new();
    let mut init_containers = Vec::new();
    for (name, state) in stats {
        let uf = UnitFile::parse(&state.unit_data).unwrap_or_default();
        let container_name = unitname::parse(name)
            .map(|p| p.container.to_string())
            .unwrap_or_default();
        let image = uf
            .first_value(KUBERNETES_SECTION, "Image")
            .unwrap_or(container_name.as_str())
            .to_string();
        let container = Container {
            name: container_name,
            image: Some(image),
            command: Some(
                uf.values("Service", "ExecStart")
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            ..Default::default()
        };
        if uf.first_value(KUBERNETES_SECTION, "InitContainer").is_some() {
            init_containers.push(container);
        } else {
            containers.push(container);
        }
    }
    (containers, init_containers)
}

fn waiting_state(sub: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(sub.to_string()),
            message: Some(sub.to_string()),
        }),
        ..Default::default()
    }
}

/// Reduce container statuses to a Pod phase: any waiting container means
/// `Pending`; all running means `Running`; all terminated reduces on the
/// exit-code sum.
fn to_phase(statuses: &[ContainerStatus]) -> &'static str {
    let mut running = 0;
    let mut terminated = 0;
    let mut exit_code_sum = 0;
    for status in statuses {
        let Some(state) = status.state.as_ref() else {
            continue;
        };
        if state.waiting.is_some() {
            return "Pending";
        }
        if state.running.is_some() {
            running += 1;
        }
        if let Some(t) = &state.terminated {
            terminated += 1;
            exit_code_sum += t.exit_code;
        }
    }

    if running == statuses.len() {
        return "Running";
    }
    if terminated == statuses.len() {
        if exit_code_sum == 0 {
            return "Succeeded";
        }
        return "Failed";
    }
    "Unknown"
}

fn pod_conditions(start_time: &Time) -> Vec<PodCondition> {
    ["Ready", "Initialized", "PodScheduled"]
        .into_iter()
        .map(|type_| PodCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(start_time.clone()),
            ..Default::default()
        })
        .collect()
}

/// Properties exposing time values are encoded in microseconds on the bus,
/// even when the corresponding unit file settings are in seconds.
fn timestamp_to_time(value: &str) -> DateTime<Utc> {
    let micros = value.parse::<i64>().unwrap_or(0);
    if micros <= 0 {
        return DateTime::UNIX_EPOCH;
    }
    DateTime::from_timestamp(micros / 1_000_000, ((micros % 1_000_000) * 1_000) as u32)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn hash(value: &str) -> String {
    hex::encode(openssl::sha::sha1(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            state: Some(state),
            ..Default::default()
        }
    }

    fn running() -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32) -> ContainerState {
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting() -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..Default::default()
        }
    }

    #[test]
    fn phase_reduction() {
        assert_eq!(to_phase(&[status_with(running())]), "Running");
        assert_eq!(
            to_phase(&[status_with(running()), status_with(waiting())]),
            "Pending"
        );
        assert_eq!(
            to_phase(&[status_with(terminated(0)), status_with(terminated(0))]),
            "Succeeded"
        );
        assert_eq!(
            to_phase(&[status_with(terminated(0)), status_with(terminated(1))]),
            "Failed"
        );
        assert_eq!(
            to_phase(&[status_with(running()), status_with(terminated(0))]),
            "Unknown"
        );
    }

    #[test]
    fn microsecond_timestamps() {
        let time = timestamp_to_time("1611313420000000");
        assert_eq!(time.timestamp(), 1611313420);
        assert_eq!(timestamp_to_time(""), DateTime::UNIX_EPOCH);
        assert_eq!(timestamp_to_time("garbage"), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn image_id_is_hex_sha1() {
        assert_eq!(hash("uptimed").len(), 40);
        assert_eq!(hash("uptimed"), hash("uptimed"));
        assert_ne!(hash("uptimed"), hash("bash"));
    }
}
