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

//! Pod lifecycle: compiling a Pod into units, and the create, delete and
//! read paths.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tracing::{debug, info, warn};

use super::command::command_and_args;
use super::env::default_environment;
use super::security_context::uid_gid_from_security_context;
use super::volumes::VolumeFilter;
use super::Provider;
use crate::domain::unit::name as unitname;
use crate::domain::unit::{UnitFile, KUBERNETES_SECTION};
use crate::infrastructure::ospkg::clean;
use crate::shared::error::{Result, SystemkError};

/// Ephemeral paths every unit gets a private view of.
const TMPFS: &str = "/var /run";

/// Template options that clash with the Pod spec and are always removed.
const DELETE_OPTIONS: &[&str] = &["EnvironmentFile"];

/// Fallback template when a package ships no unit file.
const SYNTH_UNIT: &str = "[Unit]
Description=systemk
Documentation=man:systemk(8)

[Service]
ExecStart=

[Install]
WantedBy=multi-user.target
";

impl Provider {
    /// Translate the Pod into one unit per container and start them in
    /// order. Volume materialization failures abort before anything is
    /// loaded; later failures leave already-loaded units behind for the
    /// delete path to collect.
    pub async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
        info!(namespace, pod = pod_name, "creating pod");

        let vol = self.volumes(pod, VolumeFilter::All).await.map_err(|err| {
            warn!(namespace, pod = pod_name, %err, "failed to process pod volumes");
            err
        })?;

        let (uid, gid) = uid_gid_from_security_context(pod, self.config.override_root_uid)?;

        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| SystemkError::Config(format!("pod {pod_name} has no spec")))?;
        let init_count = spec.init_containers.as_ref().map_or(0, |c| c.len());
        let containers = spec
            .init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter());

        let mut units_to_start = Vec::new();
        let mut previous_unit: Option<String> = None;
        for (i, container) in containers.enumerate() {
            let is_init = i < init_count;
            debug!(namespace, pod = pod_name, index = i, init = is_init, "processing container");

            let image = container.image.as_deref().ok_or_else(|| {
                SystemkError::Config(format!("container {} has no image", container.name))
            })?;

            let installed = self.pkg_manager.install(image, "").await.map_err(|err| {
                warn!(namespace, pod = pod_name, image, %err, "failed to install package");
                err
            })?;

            let image_name = clean(image);
            if installed {
                // A freshly installed package's own unit must not race the
                // ones generated here.
                let pkg_unit = format!("{image_name}{}", unitname::SERVICE_SUFFIX);
                if let Err(err) = self.unit_manager.mask(&pkg_unit).await {
                    warn!(unit = %pkg_unit, %err, "failed to mask packaged unit");
                }
            }

            let mut uf = self.unit_file_from_package_or_synthesized(image).await?;
            if let Some(working_dir) = &container.working_dir {
                uf = uf.overwrite("Service", "WorkingDirectory", &[working_dir.as_str()]);
            }

            let mut bind_paths = Vec::new();
            let mut bind_ro_paths = Vec::new();
            let mut rw_paths = Vec::new();
            for mount in container.volume_mounts.iter().flatten() {
                match vol.get(&mount.name) {
                    None => {
                        warn!(
                            volume = %mount.name,
                            "failed to find volumeMount in the declared volumes, skipping"
                        );
                    }
                    // Host path; the mount is the path itself.
                    Some(None) => rw_paths.push(mount.mount_path.clone()),
                    Some(Some(dir)) => {
                        if mount.read_only == Some(true) {
                            bind_ro_paths.push(format!("{}:{}", dir.display(), mount.mount_path));
                        } else {
                            // systemd creates the mount path for us, so only
                            // the bind hook and writability are needed.
                            rw_paths.push(mount.mount_path.clone());
                            bind_paths.push(format!("{}:{}", dir.display(), mount.mount_path));
                        }
                    }
                }
            }

            uf = uf
                .overwrite("Service", "ProtectSystem", &["true"])
                .overwrite("Service", "ProtectHome", &["tmpfs"])
                .overwrite("Service", "PrivateMounts", &["true"])
                .overwrite("Service", "ReadOnlyPaths", &["/"])
                .insert("Service", "StandardOutput", &["journal"])
                .insert("Service", "StandardError", &["journal"]);

            if self.config.user_mode {
                // The per-user manager cannot switch identities.
                uf = uf.delete("Service", "User").delete("Service", "Group");
            } else if !uid.is_empty() {
                uf = uf
                    .overwrite("Service", "User", &[uid.as_str()])
                    .overwrite("Service", "Group", &[gid.as_str()]);
            }

            if is_init {
                // No restarting; the flag lets the reverse mapping tell
                // init containers apart.
                uf = uf
                    .overwrite("Service", "Type", &["oneshot"])
                    .insert(KUBERNETES_SECTION, "InitContainer", &["true"]);
            }

            if let Some(previous) = &previous_unit {
                uf = uf.insert("Unit", "After", &[previous.as_str()]);
            }

            // Keep the unit around until the delete, so terminal status can
            // still be reported after the process exits.
            uf = uf.overwrite("Service", "RemainAfterExit", &["true"]);

            let exec_start = command_and_args(&uf, container);
            if !exec_start.is_empty() {
                uf = uf.overwrite("Service", "ExecStart", &[exec_start.join(" ").as_str()]);
            }

            uf = uf
                .insert(KUBERNETES_SECTION, "Namespace", &[namespace])
                .insert(KUBERNETES_SECTION, "ClusterName", &[self.config.cluster_name.as_str()])
                .insert(KUBERNETES_SECTION, "Id", &[pod_uid])
                .insert(KUBERNETES_SECTION, "Image", &[image_name.as_str()]);

            uf = uf.insert("Service", "TemporaryFileSystem", &[TMPFS]);
            if !rw_paths.is_empty() {
                uf = uf.insert("Service", "ReadWritePaths", &[rw_paths.join(" ").as_str()]);
            }
            if !bind_paths.is_empty() {
                uf = uf.insert("Service", "BindPaths", &[bind_paths.join(" ").as_str()]);
            }
            if !bind_ro_paths.is_empty() {
                uf = uf.insert(
                    "Service",
                    "BindReadOnlyPaths",
                    &[bind_ro_paths.join(" ").as_str()],
                );
            }

            for key in DELETE_OPTIONS {
                uf = uf.delete("Service", key);
            }

            let mut env_vars = default_environment(&self.config);
            for env in container.env.iter().flatten() {
                // Values with spaces must be quoted; quoting is innocuous
                // for the rest, so it is applied throughout.
                env_vars.push(format!(
                    "{}={:?}",
                    env.name,
                    env.value.as_deref().unwrap_or_default()
                ));
            }
            for env in &env_vars {
                uf = uf.insert("Service", "Environment", &[env.as_str()]);
            }

            let unit_name = unitname::compose(namespace, pod_name, &container.name)?;
            info!(
                unit = %unit_name,
                image = %image_name,
                init = is_init,
                "loading unit"
            );
            self.unit_manager.load(&unit_name, uf).await.map_err(|err| {
                warn!(unit = %unit_name, %err, "failed to load unit");
                err
            })?;
            units_to_start.push(unit_name.clone());
            if is_init {
                previous_unit = Some(unit_name);
            }
        }

        for name in &units_to_start {
            info!(unit = %name, "starting unit");
            self.unit_manager.trigger_start(name).await.map_err(|err| {
                warn!(unit = %name, %err, "failed to trigger start");
                err
            })?;
        }

        self.resources.watch(pod);
        Ok(())
    }

    /// Stop and unload every unit of the Pod, then remove its run
    /// directory and watches. Best-effort: individual failures are logged
    /// and the remaining units are still processed.
    pub async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        info!(namespace, pod = pod_name, "deleting pod");

        let Some(spec) = pod.spec.as_ref() else {
            return Ok(());
        };
        let containers = spec
            .init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter());

        let mut units_to_unload = Vec::new();
        for container in containers {
            let name = match unitname::compose(namespace, pod_name, &container.name) {
                Ok(name) => name,
                Err(err) => {
                    warn!(container = %container.name, %err, "skipping container with invalid name");
                    continue;
                }
            };
            if let Err(err) = self.unit_manager.trigger_stop(&name).await {
                warn!(unit = %name, %err, "failed to trigger stop");
            }
            units_to_unload.push(name);
        }

        for name in &units_to_unload {
            if let Err(err) = self.unit_manager.unload(name).await {
                warn!(unit = %name, %err, "failed to unload unit");
            } else {
                info!(unit = %name, "deleted unit");
            }
        }
        if let Err(err) = self.unit_manager.reload().await {
            warn!(%err, "failed to reload the service manager");
        }

        if let Some(pod_uid) = pod.metadata.uid.as_deref() {
            if let Err(err) = self.clean_pod_ephemeral_volumes(pod_uid) {
                warn!(%err, "failed to clean up volumes");
            }
        }
        self.resources.unwatch(pod);
        Ok(())
    }

    /// The Pod synthesized from the live unit state, or `None` when no
    /// units exist for it. Read-only: bus trouble yields `None` and a log
    /// line rather than an error.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        debug!(namespace, pod = name, "get pod");
        let prefix = unitname::pod_prefix(namespace, name);
        let states = match self.unit_manager.states(&prefix).await {
            Ok(states) => states,
            Err(err) => {
                warn!(namespace, pod = name, %err, "failed to retrieve unit states");
                return Ok(None);
            }
        };
        self.stats_to_pod(&states).await
    }

    /// Every Pod this agent has materialized.
    pub async fn get_pods(&self) -> Result<Vec<Pod>> {
        debug!("get pods");
        let prefix = format!("{}{}", unitname::PREFIX, unitname::SEPARATOR);
        let states = self.unit_manager.states(&prefix).await?;

        let mut seen = BTreeMap::new();
        for name in states.keys() {
            if let Some(parsed) = unitname::parse(name) {
                seen.insert(
                    (parsed.namespace.to_string(), parsed.pod.to_string()),
                    (),
                );
            }
        }

        let mut pods = Vec::new();
        for (namespace, pod_name) in seen.keys() {
            if let Some(pod) = self.get_pod(namespace, pod_name).await? {
                pods.push(pod);
            }
        }
        Ok(pods)
    }

    pub async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        Ok(self.get_pod(namespace, name).await?.and_then(|p| p.status))
    }

    /// The base unit template for a container image: the file the package
    /// ships, or a minimal synthesized one.
    async fn unit_file_from_package_or_synthesized(&self, image: &str) -> Result<UnitFile> {
        match self.pkg_manager.unit_file(image).await {
            Ok(path) => {
                debug!(path = %path.display(), "unit file found");
                let text = tokio::fs::read_to_string(&path).await?;
                UnitFile::parse(&text)
            }
            Err(err) => {
                warn!(image, %err, "failed to find unit file, synthesizing one");
                UnitFile::parse(SYNTH_UNIT)
            }
        }
    }
}
