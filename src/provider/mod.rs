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

//! The systemd provider: translates Pods into units and back.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};

use crate::infrastructure::kubernetes::client::{ConfigMapLister, PodLifecycle, SecretLister};
use crate::infrastructure::kubernetes::watcher::{PodResourceWatcher, ResourceUpdater};
use crate::infrastructure::ospkg::PackageManager;
use crate::infrastructure::systemd::UnitManager;
use crate::shared::error::Result;

pub mod command;
pub mod config;
pub mod env;
pub mod logs;
pub mod node;
pub mod pod;
pub mod security_context;
pub mod status;
pub mod volumes;

pub use config::Config;
pub use volumes::VolumeFilter;

/// Translates Pods scheduled onto this node into systemd units, and unit
/// state back into Pod status.
pub struct Provider {
    config: Arc<Config>,
    unit_manager: Arc<dyn UnitManager>,
    pkg_manager: Arc<dyn PackageManager>,
    resources: Arc<PodResourceWatcher>,
    config_maps: Arc<dyn ConfigMapLister>,
    secrets: Arc<dyn SecretLister>,
}

impl Provider {
    pub fn new(
        config: Arc<Config>,
        unit_manager: Arc<dyn UnitManager>,
        pkg_manager: Arc<dyn PackageManager>,
        resources: Arc<PodResourceWatcher>,
        config_maps: Arc<dyn ConfigMapLister>,
        secrets: Arc<dyn SecretLister>,
    ) -> Self {
        Self {
            config,
            unit_manager,
            pkg_manager,
            resources,
            config_maps,
            secrets,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl ResourceUpdater for Provider {
    async fn update_config_map(&self, pod: &Pod, _config_map: &ConfigMap) -> Result<()> {
        self.volumes(pod, VolumeFilter::ConfigMap).await.map(|_| ())
    }

    async fn update_secret(&self, pod: &Pod, _secret: &Secret) -> Result<()> {
        self.volumes(pod, VolumeFilter::Secret).await.map(|_| ())
    }
}

#[async_trait]
impl PodLifecycle for Provider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        Provider::create_pod(self, pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        Provider::delete_pod(self, pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Provider::get_pod(self, namespace, name).await
    }
}
