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

//! An in-memory unit manager used for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::manager::{UnitManager, UnitState};
use crate::domain::unit::name::SERVICE_SUFFIX;
use crate::domain::unit::UnitFile;
use crate::shared::error::Result;

#[derive(Default)]
struct Inner {
    units: BTreeMap<String, String>,
    states: HashMap<String, (String, String, String)>,
    service_properties: HashMap<(String, String), String>,
    started: Vec<String>,
    stopped: Vec<String>,
    unloaded: Vec<String>,
    masked: Vec<String>,
    disabled: Vec<String>,
    reloads: usize,
}

/// Records every call and keeps loaded unit texts in memory.
#[derive(Default)]
pub struct MockManager {
    inner: Mutex<Inner>,
}

impl MockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The on-disk text of a loaded unit.
    pub fn unit(&self, name: &str) -> Option<String> {
        self.lock().units.get(name).cloned()
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.lock().units.keys().cloned().collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn unloaded(&self) -> Vec<String> {
        self.lock().unloaded.clone()
    }

    pub fn masked(&self) -> Vec<String> {
        self.lock().masked.clone()
    }

    pub fn reloads(&self) -> usize {
        self.lock().reloads
    }

    /// Inject the (load, active, sub) state reported for a unit.
    pub fn set_state(&self, name: &str, load: &str, active: &str, sub: &str) {
        self.lock().states.insert(
            name.to_string(),
            (load.to_string(), active.to_string(), sub.to_string()),
        );
    }

    /// Inject a service property reported for a unit.
    pub fn set_service_property(&self, name: &str, key: &str, value: &str) {
        self.lock()
            .service_properties
            .insert((name.to_string(), key.to_string()), value.to_string());
    }

    fn state_of(inner: &Inner, name: &str) -> UnitState {
        let (load_state, active_state, sub_state) = inner
            .states
            .get(name)
            .cloned()
            .unwrap_or_else(|| ("loaded".into(), "inactive".into(), "dead".into()));
        UnitState {
            name: name.to_string(),
            load_state,
            active_state,
            sub_state,
            unit_data: inner.units.get(name).cloned().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl UnitManager for MockManager {
    async fn load(&self, name: &str, file: UnitFile) -> Result<()> {
        self.lock().units.insert(name.to_string(), file.to_string());
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.units.remove(name);
        inner.unloaded.push(name.to_string());
        Ok(())
    }

    async fn trigger_start(&self, name: &str) -> Result<()> {
        self.lock().started.push(name.to_string());
        Ok(())
    }

    async fn trigger_stop(&self, name: &str) -> Result<()> {
        self.lock().stopped.push(name.to_string());
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<UnitState> {
        Ok(Self::state_of(&self.lock(), name))
    }

    async fn states(&self, prefix: &str) -> Result<BTreeMap<String, UnitState>> {
        let inner = self.lock();
        Ok(inner
            .units
            .keys()
            .filter(|name| name.starts_with(prefix) && name.ends_with(SERVICE_SUFFIX))
            .map(|name| (name.clone(), Self::state_of(&inner, name)))
            .collect())
    }

    async fn property(&self, _name: &str, _key: &str) -> String {
        String::new()
    }

    async fn service_property(&self, name: &str, key: &str) -> String {
        self.lock()
            .service_properties
            .get(&(name.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn reload(&self) -> Result<()> {
        self.lock().reloads += 1;
        Ok(())
    }

    async fn mask(&self, name: &str) -> Result<()> {
        self.lock().masked.push(name.to_string());
        Ok(())
    }

    async fn disable(&self, name: &str) -> Result<()> {
        self.lock().disabled.push(name.to_string());
        Ok(())
    }
}
