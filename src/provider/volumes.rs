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

//! Projected-volume materialization
//!
//! Volumes are staged under `<run_root>/<pod-uid>/{emptydirs,secrets,
//! configmaps}/#<index>`. Files are written to a temporary file in the
//! target directory, chowned, then renamed over the final name so consumers
//! never observe partial content. Every created path must resolve strictly
//! below one of the operator-configured allowed roots.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use regex::Regex;
use tracing::{debug, info, warn};

use super::security_context::uid_gid_from_security_context;
use super::Provider;
use crate::domain::unit::name as unitname;
use crate::domain::unit::{UnitFile, KUBERNETES_SECTION};
use crate::shared::error::{Result, SystemkError};

const EMPTY_DIR: &str = "emptydirs";
const SECRET_DIR: &str = "secrets";
const CONFIGMAP_DIR: &str = "configmaps";

const DIR_PERMS: u32 = 0o2750;
const FILE_PERMS: u32 = 0o640;

const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";
const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Which declared volumes to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFilter {
    All,
    ConfigMap,
    Secret,
}

impl Provider {
    /// Prepare the on-disk tree for the Pod's volumes matching `filter` and
    /// return volume name to directory. `None` marks a host-path volume,
    /// whose mount is resolved by the caller.
    pub(crate) async fn volumes(
        &self,
        pod: &Pod,
        filter: VolumeFilter,
    ) -> Result<HashMap<String, Option<PathBuf>>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let (uid, gid) = uid_gid_from_security_context(pod, self.config.override_root_uid)?;

        let mut vol = HashMap::new();
        let Some(volumes) = pod.spec.as_ref().and_then(|s| s.volumes.as_ref()) else {
            return Ok(vol);
        };

        for (i, volume) in volumes.iter().enumerate() {
            debug!(namespace, pod = pod_name, volume = %volume.name, index = i, "looking at volume");
            if let Some(host_path) = &volume.host_path {
                if filter != VolumeFilter::All {
                    continue;
                }
                self.check_below(Path::new(&host_path.path))?;
                vol.insert(volume.name.clone(), None);
            } else if volume.empty_dir.is_some() {
                if filter != VolumeFilter::All {
                    continue;
                }
                let dir = self.setup_paths(pod, EMPTY_DIR, i, &uid, &gid)?;
                debug!(dir = %dir.display(), volume = %volume.name, "created emptyDir");
                vol.insert(volume.name.clone(), Some(dir));
            } else if let Some(source) = &volume.secret {
                if filter == VolumeFilter::ConfigMap {
                    continue;
                }
                let name = source.secret_name.as_deref().unwrap_or_default();
                let Some(secret) = self.secrets.get(namespace, name) else {
                    if source.optional == Some(true) {
                        continue;
                    }
                    return Err(SystemkError::Config(format!(
                        "secret {name} is required by pod {pod_name} and does not exist"
                    )));
                };
                let dir = self.setup_paths(pod, SECRET_DIR, i, &uid, &gid)?;
                debug!(dir = %dir.display(), volume = %volume.name, "created secret");
                self.write_secret(&dir, &secret, None, &uid, &gid)?;
                vol.insert(volume.name.clone(), Some(dir));
            } else if let Some(source) = &volume.config_map {
                if filter == VolumeFilter::Secret {
                    continue;
                }
                let name = source.name.as_str();
                let Some(config_map) = self.config_maps.get(namespace, name) else {
                    if source.optional == Some(true) {
                        continue;
                    }
                    return Err(SystemkError::Config(format!(
                        "configMap {name} is required by pod {pod_name} and does not exist"
                    )));
                };
                let dir = self.setup_paths(pod, CONFIGMAP_DIR, i, &uid, &gid)?;
                debug!(dir = %dir.display(), volume = %volume.name, "created configMap");
                self.write_config_map(&dir, &config_map, None, &uid, &gid)?;
                vol.insert(volume.name.clone(), Some(dir));
            } else if let Some(projected) = &volume.projected {
                for source in projected.sources.iter().flatten() {
                    if source.service_account_token.is_some() {
                        if let Some(dir) =
                            self.project_service_account_token(pod, i, &uid, &gid)?
                        {
                            vol.insert(volume.name.clone(), Some(dir));
                        }
                    } else if let Some(projection) = &source.secret {
                        let name = projection.name.as_str();
                        let Some(secret) = self.secrets.get(namespace, name) else {
                            if projection.optional == Some(true) {
                                continue;
                            }
                            return Err(SystemkError::Config(format!(
                                "projected secret {name} is required by pod {pod_name} and does not exist"
                            )));
                        };
                        let items = projection.items.as_deref().map(keys_to_paths);
                        let dir = self.setup_paths(pod, SECRET_DIR, i, &uid, &gid)?;
                        debug!(dir = %dir.display(), volume = %volume.name, "created projected secret");
                        self.write_secret(&dir, &secret, items.as_ref(), &uid, &gid)?;
                        vol.insert(volume.name.clone(), Some(dir));
                    } else if let Some(projection) = &source.config_map {
                        let name = projection.name.as_str();
                        let Some(config_map) = self.config_maps.get(namespace, name) else {
                            if projection.optional == Some(true) {
                                continue;
                            }
                            return Err(SystemkError::Config(format!(
                                "projected configMap {name} is required by pod {pod_name} and does not exist"
                            )));
                        };
                        let items = projection.items.as_deref().map(keys_to_paths);
                        let dir = self.setup_paths(pod, CONFIGMAP_DIR, i, &uid, &gid)?;
                        debug!(dir = %dir.display(), volume = %volume.name, "created projected configMap");
                        self.write_config_map(&dir, &config_map, items.as_ref(), &uid, &gid)?;
                        vol.insert(volume.name.clone(), Some(dir));
                    }
                }
            } else {
                return Err(SystemkError::Config(format!(
                    "pod {pod_name} requires volume {} which is of an unsupported type",
                    volume.name
                )));
            }
        }

        Ok(vol)
    }

    /// Service-account tokens are still stored in a Secret; find the one
    /// annotated with the Pod's service-account name.
    fn project_service_account_token(
        &self,
        pod: &Pod,
        index: usize,
        uid: &str,
        gid: &str,
    ) -> Result<Option<PathBuf>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.as_deref())
            .unwrap_or_default();

        for secret in self.secrets.list(namespace) {
            if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
                continue;
            }
            let matches = secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SERVICE_ACCOUNT_ANNOTATION))
                .is_some_and(|name| name == account);
            if !matches {
                continue;
            }
            let dir = self.setup_paths(pod, SECRET_DIR, index, uid, gid)?;
            debug!(dir = %dir.display(), account, "created projected serviceAccountToken");
            self.write_secret(&dir, &secret, None, uid, gid)?;
            return Ok(Some(dir));
        }
        Ok(None)
    }

    fn write_secret(
        &self,
        dir: &Path,
        secret: &Secret,
        items: Option<&HashMap<&str, &str>>,
        uid: &str,
        gid: &str,
    ) -> Result<()> {
        // stringData values arrive base64-encoded.
        for (key, value) in secret.string_data.iter().flatten() {
            let Some(file) = target_name(items, key) else {
                continue;
            };
            let data = base64::engine::general_purpose::STANDARD
                .decode(value)
                .map_err(|e| {
                    SystemkError::Config(format!("secret key {key} is not valid base64: {e}"))
                })?;
            self.write_file(dir, file, uid, gid, &data)?;
        }
        for (key, value) in secret.data.iter().flatten() {
            let Some(file) = target_name(items, key) else {
                continue;
            };
            self.write_file(dir, file, uid, gid, &value.0)?;
        }
        Ok(())
    }

    fn write_config_map(
        &self,
        dir: &Path,
        config_map: &ConfigMap,
        items: Option<&HashMap<&str, &str>>,
        uid: &str,
        gid: &str,
    ) -> Result<()> {
        for (key, value) in config_map.data.iter().flatten() {
            let Some(file) = target_name(items, key) else {
                continue;
            };
            self.write_file(dir, file, uid, gid, value.as_bytes())?;
        }
        for (key, value) in config_map.binary_data.iter().flatten() {
            let Some(file) = target_name(items, key) else {
                continue;
            };
            self.write_file(dir, file, uid, gid, &value.0)?;
        }
        Ok(())
    }

    /// Write data to a temporary file in `dir`, chown it, then atomically
    /// rename it over the final name.
    fn write_file(&self, dir: &Path, file: &str, uid: &str, gid: &str, data: &[u8]) -> Result<()> {
        let target = dir.join(file);
        self.check_below(&target)?;

        let mut tmp = tempfile::Builder::new()
            .prefix("systemk.")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        debug!(file = %target.display(), uid, gid, "writing volume file");
        tmp.write_all(data)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(FILE_PERMS))?;
        chown(tmp.path(), uid, gid)?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Create (and chown) `<run_root>/<pod-uid>/<kind>/#<index>`.
    fn setup_paths(
        &self,
        pod: &Pod,
        kind: &str,
        index: usize,
        uid: &str,
        gid: &str,
    ) -> Result<PathBuf> {
        let id = pod
            .metadata
            .uid
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SystemkError::Config("pod has no UID".to_string()))?;

        let dir = self.config.run_root.join(id).join(kind);
        self.check_below(&dir)?;
        mkdir_all_chown(&dir, uid, gid)?;

        let dir = dir.join(format!("#{index}"));
        self.check_below(&dir)?;
        mkdir_all_chown(&dir, uid, gid)?;
        Ok(dir)
    }

    fn check_below(&self, path: &Path) -> Result<()> {
        is_below(&self.config.allowed_host_paths, path)
    }

    /// Remove the Pod's run directory.
    pub(crate) fn clean_pod_ephemeral_volumes(&self, pod_uid: &str) -> Result<()> {
        if pod_uid.is_empty() || pod_uid.contains("..") || pod_uid.contains('/') {
            return Err(SystemkError::invalid_input(format!(
                "refusing to clean volumes for pod UID {pod_uid:?}"
            )));
        }
        let dir = self.config.run_root.join(pod_uid);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove run directories left behind by a previous run: direct
    /// children of the run root whose names are UUIDs no loaded unit
    /// references. The run root is shared with other software, so nothing
    /// else is touched.
    pub async fn sweep_orphaned_run_dirs(&self) -> Result<()> {
        let prefix = format!("{}{}", unitname::PREFIX, unitname::SEPARATOR);
        let states = self.unit_manager.states(&prefix).await?;
        let mut live: HashSet<String> = HashSet::new();
        for state in states.values() {
            if let Ok(uf) = UnitFile::parse(&state.unit_data) {
                if let Some(id) = uf.first_value(KUBERNETES_SECTION, "Id") {
                    live.insert(id.to_string());
                }
            }
        }

        for entry in std::fs::read_dir(&self.config.run_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !uuid_re().is_match(&name) || live.contains(&name) {
                continue;
            }
            info!(dir = %entry.path().display(), "removing orphaned pod run directory");
            if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                warn!(dir = %entry.path().display(), %err, "failed to remove run directory");
            }
        }
        Ok(())
    }
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

/// With items given, map a data key to its declared path, skipping
/// unlisted keys. Without items every key maps to itself.
fn target_name<'a>(items: Option<&HashMap<&str, &'a str>>, key: &'a str) -> Option<&'a str> {
    match items {
        None => Some(key),
        Some(map) => map.get(key).copied(),
    }
}

fn keys_to_paths(items: &[k8s_openapi::api::core::v1::KeyToPath]) -> HashMap<&str, &str> {
    items
        .iter()
        .map(|item| (item.key.as_str(), item.path.as_str()))
        .collect()
}

fn is_below_path(top: &Path, path: &Path) -> bool {
    path != top && path.starts_with(top)
}

/// Check that `path` contains no parent-directory segments and resolves
/// strictly below one of the allowed roots.
fn is_below(roots: &[PathBuf], path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if !escapes && roots.iter().any(|root| is_below_path(root, path)) {
        return Ok(());
    }
    Err(SystemkError::UnsafePath {
        path: path.to_path_buf(),
        roots: roots.to_vec(),
    })
}

fn mkdir_all_chown(path: &Path, uid: &str, gid: &str) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_PERMS)
        .create(path)?;
    chown(path, uid, gid)
}

/// Chown with string ids; an unparsable id leaves that owner unchanged.
fn chown(path: &Path, uid: &str, gid: &str) -> Result<()> {
    let uid = uid.parse::<u32>().ok().map(nix::unistd::Uid::from_raw);
    let gid = gid.parse::<u32>().ok().map(nix::unistd::Gid::from_raw);
    nix::unistd::chown(path, uid, gid)
        .map_err(|e| SystemkError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_path() {
        let cases = [
            ("/", "/tmp/x", true),
            ("/", "/", false),
            ("/tmp", "/", false),
            ("/tmp/x", "/", false),
            ("/var", "/var/run/uid", true),
        ];
        for (top, path, expected) in cases {
            assert_eq!(
                is_below_path(Path::new(top), Path::new(path)),
                expected,
                "{top} vs {path}"
            );
        }
    }

    #[test]
    fn below_any_root() {
        let roots = vec![PathBuf::from("/var"), PathBuf::from("/tmp")];
        assert!(is_below(&roots, Path::new("/tmp/x")).is_ok());
        assert!(is_below(&roots, Path::new("/")).is_err());
        assert!(is_below(&roots, Path::new("/var")).is_err());
        assert!(is_below(&roots, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn parent_segments_are_rejected() {
        let roots = vec![PathBuf::from("/var")];
        assert!(is_below(&roots, Path::new("/var/run/../../etc")).is_err());
        assert!(is_below(&roots, Path::new("/var/run/a..b")).is_ok());
    }

    #[test]
    fn uuid_names_only() {
        assert!(uuid_re().is_match("6a20e315-0bd2-4509-9c9f-b5a4c2b96d6b"));
        assert!(!uuid_re().is_match("systemk"));
        assert!(!uuid_re().is_match("lock"));
    }

    #[test]
    fn item_selection() {
        let items = HashMap::from([("config", "renamed.conf")]);
        assert_eq!(target_name(Some(&items), "config"), Some("renamed.conf"));
        assert_eq!(target_name(Some(&items), "other"), None);
        assert_eq!(target_name(None, "other"), Some("other"));
    }
}
