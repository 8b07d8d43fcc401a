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

//! Unit management over the systemd control bus.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zbus::names::InterfaceName;
use zbus::zvariant::Value;

use super::proxy::SystemdBusProxy;
use crate::domain::unit::name::SERVICE_SUFFIX;
use crate::domain::unit::UnitFile;
use crate::shared::error::{Result, SystemkError};

const UNIT_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.systemd1.Unit");
const SERVICE_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.systemd1.Service");

/// Load, active and sub state of a unit as reported by the service
/// manager, together with the on-disk unit text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitState {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub unit_data: String,
}

/// Owns the management of service-manager units.
///
/// This is a trait mostly so tests can substitute an in-memory manager.
#[async_trait]
pub trait UnitManager: Send + Sync {
    /// Write the unit file to disk, link it into the service manager's
    /// load path, and enable it if it declares an `[Install]` section.
    /// On enable failure the file is removed again.
    async fn load(&self, name: &str, file: UnitFile) -> Result<()>;

    /// Disable the unit, reset any failed status and remove its file.
    async fn unload(&self, name: &str) -> Result<()>;

    /// Queue a start job. Returns as soon as the job is queued.
    async fn trigger_start(&self, name: &str) -> Result<()>;

    /// Queue a stop job. Returns as soon as the job is queued.
    async fn trigger_stop(&self, name: &str) -> Result<()>;

    async fn state(&self, name: &str) -> Result<UnitState>;

    /// All units whose name starts with `prefix` and ends in `.service`,
    /// with their on-disk text attached.
    async fn states(&self, prefix: &str) -> Result<BTreeMap<String, UnitState>>;

    /// A unit property as a string; empty on any bus failure.
    async fn property(&self, name: &str, key: &str) -> String;

    /// A service property as a string; empty on any bus failure.
    async fn service_property(&self, name: &str, key: &str) -> String;

    async fn reload(&self) -> Result<()>;

    async fn mask(&self, name: &str) -> Result<()>;

    async fn disable(&self, name: &str) -> Result<()>;
}

/// Manages units via a D-Bus connection to systemd.
pub struct SystemdManager {
    conn: zbus::Connection,
    units_dir: PathBuf,
    // Guards mutations of the units directory, never held across bus calls.
    dir_lock: RwLock<()>,
}

impl SystemdManager {
    /// Connect to the system bus, or the session bus when `user` is set,
    /// and prepare the units directory.
    pub async fn new(units_dir: impl Into<PathBuf>, user: bool) -> Result<Self> {
        let conn = if user {
            zbus::Connection::session().await?
        } else {
            zbus::Connection::system().await?
        };
        let units_dir = units_dir.into();
        std::fs::create_dir_all(&units_dir)?;
        Ok(Self {
            conn,
            units_dir,
            dir_lock: RwLock::new(()),
        })
    }

    async fn bus(&self) -> Result<SystemdBusProxy<'_>> {
        Ok(SystemdBusProxy::new(&self.conn).await?)
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.units_dir.join(name)
    }

    fn write_unit(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.unit_path(name);
        let _guard = self.dir_lock.write().unwrap_or_else(|e| e.into_inner());
        info!(unit = name, bytes = contents.len(), "writing unit file");
        let mut tmp = tempfile::NamedTempFile::new_in(&self.units_dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    fn remove_unit_file(&self, name: &str) {
        let _guard = self.dir_lock.write().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = std::fs::remove_file(self.unit_path(name)) {
            debug!(unit = name, %err, "failed to remove unit file");
        }
    }

    fn read_unit(&self, name: &str) -> Result<String> {
        let _guard = self.dir_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(std::fs::read_to_string(self.unit_path(name))?)
    }

    async fn get_property(
        &self,
        name: &str,
        interface: InterfaceName<'static>,
        key: &str,
    ) -> Result<String> {
        let bus = self.bus().await?;
        let path = bus.load_unit(name).await?;
        let props = zbus::fdo::PropertiesProxy::builder(&self.conn)
            .destination("org.freedesktop.systemd1")?
            .path(path.into_inner())?
            .build()
            .await?;
        let value = props.get(interface, key).await.map_err(zbus::Error::from)?;
        Ok(value_string(&value))
    }
}

#[async_trait]
impl UnitManager for SystemdManager {
    async fn load(&self, name: &str, file: UnitFile) -> Result<()> {
        let has_install = file.has_section("Install");
        let path = self.write_unit(name, &file.to_string())?;
        let path_str = path.to_string_lossy().into_owned();

        let bus = self.bus().await?;
        bus.link_unit_files(vec![&path_str], true, true).await?;

        if has_install {
            let enabled = match bus.enable_unit_files(vec![&path_str], true, true).await {
                Ok((carries_install_info, _)) => carries_install_info,
                Err(err) => {
                    self.remove_unit_file(name);
                    return Err(err.into());
                }
            };
            if !enabled {
                self.remove_unit_file(name);
                return Err(SystemkError::Config(format!(
                    "failed to enable unit {name}"
                )));
            }
        }
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<()> {
        info!(unit = name, "removing unit");
        let bus = self.bus().await?;
        let disabled = bus.disable_unit_files(vec![name], true).await;
        if let Err(err) = bus.reset_failed_unit(name).await {
            debug!(unit = name, %err, "reset-failed");
        }
        self.remove_unit_file(name);
        disabled.map(|_| ()).map_err(Into::into)
    }

    async fn trigger_start(&self, name: &str) -> Result<()> {
        let bus = self.bus().await?;
        let job = bus.start_unit(name, "replace").await?;
        info!(unit = name, job = %job, "triggered unit start");
        Ok(())
    }

    async fn trigger_stop(&self, name: &str) -> Result<()> {
        let bus = self.bus().await?;
        bus.stop_unit(name, "replace").await?;
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<UnitState> {
        let load_state = self.get_property(name, UNIT_INTERFACE, "LoadState").await?;
        let active_state = self.get_property(name, UNIT_INTERFACE, "ActiveState").await?;
        let sub_state = self.get_property(name, UNIT_INTERFACE, "SubState").await?;
        Ok(UnitState {
            name: name.to_string(),
            load_state,
            active_state,
            sub_state,
            unit_data: self.read_unit(name).unwrap_or_default(),
        })
    }

    async fn states(&self, prefix: &str) -> Result<BTreeMap<String, UnitState>> {
        let bus = self.bus().await?;
        let listed = bus.list_units().await?;
        debug!(count = listed.len(), "statuses returned");

        let mut states = BTreeMap::new();
        for (name, _, load_state, active_state, sub_state, ..) in listed {
            if !name.starts_with(prefix) || !name.ends_with(SERVICE_SUFFIX) {
                continue;
            }
            let unit_data = match self.read_unit(&name) {
                Ok(data) => data,
                Err(err) => {
                    warn!(unit = %name, %err, "failed to read unit file");
                    String::new()
                }
            };
            states.insert(
                name.clone(),
                UnitState {
                    name,
                    load_state,
                    active_state,
                    sub_state,
                    unit_data,
                },
            );
        }
        debug!(count = states.len(), prefix, "statuses after filtering");
        Ok(states)
    }

    async fn property(&self, name: &str, key: &str) -> String {
        self.get_property(name, UNIT_INTERFACE, key)
            .await
            .unwrap_or_default()
    }

    async fn service_property(&self, name: &str, key: &str) -> String {
        let value = self
            .get_property(name, SERVICE_INTERFACE, key)
            .await
            .unwrap_or_default();
        strip_type_tag(value)
    }

    async fn reload(&self) -> Result<()> {
        let bus = self.bus().await?;
        Ok(bus.reload().await?)
    }

    async fn mask(&self, name: &str) -> Result<()> {
        let bus = self.bus().await?;
        bus.mask_unit_files(vec![name], true, true).await?;
        Ok(())
    }

    async fn disable(&self, name: &str) -> Result<()> {
        let bus = self.bus().await?;
        bus.disable_unit_files(vec![name], true).await?;
        Ok(())
    }
}

/// Render a property value as a plain string.
fn value_string(value: &Value<'_>) -> String {
    match value {
        Value::U8(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::I16(n) => n.to_string(),
        Value::U16(n) => n.to_string(),
        Value::I32(n) => n.to_string(),
        Value::U32(n) => n.to_string(),
        Value::I64(n) => n.to_string(),
        Value::U64(n) => n.to_string(),
        Value::F64(n) => n.to_string(),
        Value::Str(s) => s.to_string(),
        Value::ObjectPath(p) => p.to_string(),
        Value::Signature(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

/// Some bus encodings tag a value's type as `@X<space>`; strip the tag.
fn strip_type_tag(value: String) -> String {
    let bytes = value.as_bytes();
    if bytes.len() > 3 && bytes[0] == b'@' && bytes[2] == b' ' {
        value[3..].to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_are_stripped() {
        assert_eq!(strip_type_tag("@u 42".to_string()), "42");
        assert_eq!(strip_type_tag("42".to_string()), "42");
        assert_eq!(strip_type_tag("@u".to_string()), "@u");
        assert_eq!(strip_type_tag(String::new()), "");
    }
}
