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

//! Tracking of ConfigMaps and Secrets referenced by Pods
//!
//! Two owning forward maps (resource key to referencing Pods) paired with
//! two reverse maps (Pod key to resource keys). The forward maps hold deep
//! copies of the Pods because a Pod's volume list may already be gone by
//! the time its deletion event arrives.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use tracing::{info, warn};

use crate::shared::error::Result;

/// Namespace/name pair identifying a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn of_pod(pod: &Pod) -> Self {
        Self::new(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        )
    }
}

/// Handles events for a ConfigMap or Secret referenced by a known Pod.
/// Implemented by the provider.
#[async_trait]
pub trait ResourceUpdater: Send + Sync {
    async fn update_config_map(&self, pod: &Pod, config_map: &ConfigMap) -> Result<()>;
    async fn update_secret(&self, pod: &Pod, secret: &Secret) -> Result<()>;
}

/// A ConfigMap or Secret event delivered by the informer. Other resource
/// kinds never reach the watcher.
pub enum ResourceEvent {
    ConfigMap(ConfigMap),
    Secret(Secret),
}

#[derive(Default)]
struct Indexes {
    configs: HashMap<ObjectKey, Vec<Pod>>,
    config_keys_by_pod: HashMap<ObjectKey, Vec<ObjectKey>>,
    secrets: HashMap<ObjectKey, Vec<Pod>>,
    secret_keys_by_pod: HashMap<ObjectKey, Vec<ObjectKey>>,
}

/// Watches for ConfigMap and Secret updates relevant to registered Pods
/// and notifies the provider.
#[derive(Default)]
pub struct PodResourceWatcher {
    inner: RwLock<Indexes>,
}

impl PodResourceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking the ConfigMaps and Secrets referenced by the Pod's
    /// volumes. A resource referenced by several volumes is indexed once.
    pub fn watch(&self, pod: &Pod) {
        let pod_key = ObjectKey::of_pod(pod);
        let namespace = pod_key.namespace.clone();
        let Some(volumes) = pod.spec.as_ref().and_then(|s| s.volumes.as_ref()) else {
            return;
        };

        let mut inner = self.write();
        for volume in volumes {
            if let Some(name) = volume.config_map.as_ref().map(|cm| cm.name.as_str()) {
                let key = ObjectKey::new(namespace.clone(), name);
                index(&mut inner.configs, &key, pod);
                index_key(&mut inner.config_keys_by_pod, &pod_key, key);
            } else if let Some(name) = volume
                .secret
                .as_ref()
                .and_then(|s| s.secret_name.as_deref())
            {
                let key = ObjectKey::new(namespace.clone(), name);
                index(&mut inner.secrets, &key, pod);
                index_key(&mut inner.secret_keys_by_pod, &pod_key, key);
            }
        }
    }

    /// Stop tracking resources for the Pod.
    pub fn unwatch(&self, pod: &Pod) {
        let pod_key = ObjectKey::of_pod(pod);
        let mut inner = self.write();

        let config_keys = inner.config_keys_by_pod.remove(&pod_key).unwrap_or_default();
        for key in config_keys {
            unindex(&mut inner.configs, &key, &pod_key);
        }

        let secret_keys = inner.secret_keys_by_pod.remove(&pod_key).unwrap_or_default();
        for key in secret_keys {
            unindex(&mut inner.secrets, &key, &pod_key);
        }
    }

    /// Fan a resource update out to every registered Pod. Per-Pod failures
    /// are logged and do not stop the remaining Pods from being notified.
    pub async fn handle_event(&self, event: &ResourceEvent, updater: &dyn ResourceUpdater) {
        match event {
            ResourceEvent::ConfigMap(config_map) => {
                let key = ObjectKey::new(
                    config_map.metadata.namespace.as_deref().unwrap_or_default(),
                    config_map.metadata.name.as_deref().unwrap_or_default(),
                );
                let pods = self.read().configs.get(&key).cloned().unwrap_or_default();
                if !pods.is_empty() {
                    info!(
                        namespace = %key.namespace,
                        name = %key.name,
                        pods = pods.len(),
                        "got ConfigMap update"
                    );
                }
                for pod in &pods {
                    if let Err(err) = updater.update_config_map(pod, config_map).await {
                        warn!(
                            namespace = %key.namespace,
                            name = %key.name,
                            pod = pod.metadata.name.as_deref().unwrap_or_default(),
                            %err,
                            "failed to update ConfigMap in Pod"
                        );
                    }
                }
            }
            ResourceEvent::Secret(secret) => {
                let key = ObjectKey::new(
                    secret.metadata.namespace.as_deref().unwrap_or_default(),
                    secret.metadata.name.as_deref().unwrap_or_default(),
                );
                let pods = self.read().secrets.get(&key).cloned().unwrap_or_default();
                if !pods.is_empty() {
                    info!(
                        namespace = %key.namespace,
                        name = %key.name,
                        pods = pods.len(),
                        "got Secret update"
                    );
                }
                for pod in &pods {
                    if let Err(err) = updater.update_secret(pod, secret).await {
                        warn!(
                            namespace = %key.namespace,
                            name = %key.name,
                            pod = pod.metadata.name.as_deref().unwrap_or_default(),
                            %err,
                            "failed to update Secret in Pod"
                        );
                    }
                }
            }
        }
    }

    /// The Pods currently registered for a ConfigMap.
    pub fn config_map_watchers(&self, key: &ObjectKey) -> Vec<Pod> {
        self.read().configs.get(key).cloned().unwrap_or_default()
    }

    /// The Pods currently registered for a Secret.
    pub fn secret_watchers(&self, key: &ObjectKey) -> Vec<Pod> {
        self.read().secrets.get(key).cloned().unwrap_or_default()
    }

    /// The resource keys registered for a Pod, (configMaps, secrets).
    pub fn keys_for_pod(&self, pod: &Pod) -> (Vec<ObjectKey>, Vec<ObjectKey>) {
        let pod_key = ObjectKey::of_pod(pod);
        let inner = self.read();
        (
            inner
                .config_keys_by_pod
                .get(&pod_key)
                .cloned()
                .unwrap_or_default(),
            inner
                .secret_keys_by_pod
                .get(&pod_key)
                .cloned()
                .unwrap_or_default(),
        )
    }
}

fn index(forward: &mut HashMap<ObjectKey, Vec<Pod>>, key: &ObjectKey, pod: &Pod) {
    let pods = forward.entry(key.clone()).or_default();
    let pod_key = ObjectKey::of_pod(pod);
    if !pods.iter().any(|p| ObjectKey::of_pod(p) == pod_key) {
        pods.push(pod.clone());
    }
}

fn index_key(reverse: &mut HashMap<ObjectKey, Vec<ObjectKey>>, pod_key: &ObjectKey, key: ObjectKey) {
    let keys = reverse.entry(pod_key.clone()).or_default();
    if !keys.contains(&key) {
        keys.push(key);
    }
}

fn unindex(forward: &mut HashMap<ObjectKey, Vec<Pod>>, key: &ObjectKey, pod_key: &ObjectKey) {
    if let Some(pods) = forward.get_mut(key) {
        pods.retain(|p| ObjectKey::of_pod(p) != *pod_key);
        if pods.is_empty() {
            forward.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{
        ConfigMapVolumeSource, PodSpec, SecretVolumeSource, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod_with_volumes(namespace: &str, name: &str, volumes: Vec<Volume>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_map_volume(volume: &str, config_map: &str) -> Volume {
        Volume {
            name: volume.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn secret_volume(volume: &str, secret: &str) -> Volume {
        Volume {
            name: volume.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn watch_indexes_both_directions() {
        let watcher = PodResourceWatcher::new();
        let pod = pod_with_volumes(
            "default",
            "uptimed",
            vec![
                config_map_volume("conf", "uptimed-conf"),
                secret_volume("token", "uptimed-secret"),
            ],
        );
        watcher.watch(&pod);

        let cm_key = ObjectKey::new("default", "uptimed-conf");
        assert_eq!(watcher.config_map_watchers(&cm_key).len(), 1);
        let secret_key = ObjectKey::new("default", "uptimed-secret");
        assert_eq!(watcher.secret_watchers(&secret_key).len(), 1);

        let (cm_keys, secret_keys) = watcher.keys_for_pod(&pod);
        assert_eq!(cm_keys, vec![cm_key.clone()]);
        assert_eq!(secret_keys, vec![secret_key.clone()]);

        watcher.unwatch(&pod);
        assert!(watcher.config_map_watchers(&cm_key).is_empty());
        assert!(watcher.secret_watchers(&secret_key).is_empty());
        let (cm_keys, secret_keys) = watcher.keys_for_pod(&pod);
        assert!(cm_keys.is_empty());
        assert!(secret_keys.is_empty());
    }

    #[test]
    fn duplicate_references_index_once() {
        let watcher = PodResourceWatcher::new();
        let pod = pod_with_volumes(
            "default",
            "uptimed",
            vec![
                config_map_volume("a", "uptimed-conf"),
                config_map_volume("b", "uptimed-conf"),
            ],
        );
        watcher.watch(&pod);

        let key = ObjectKey::new("default", "uptimed-conf");
        assert_eq!(watcher.config_map_watchers(&key).len(), 1);
    }

    #[test]
    fn unwatch_keeps_other_pods() {
        let watcher = PodResourceWatcher::new();
        let one = pod_with_volumes("default", "one", vec![config_map_volume("c", "shared")]);
        let two = pod_with_volumes("default", "two", vec![config_map_volume("c", "shared")]);
        watcher.watch(&one);
        watcher.watch(&two);

        watcher.unwatch(&one);
        let key = ObjectKey::new("default", "shared");
        let left = watcher.config_map_watchers(&key);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].metadata.name.as_deref(), Some("two"));
    }

    struct Recorder {
        config_maps: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ResourceUpdater for Recorder {
        async fn update_config_map(&self, pod: &Pod, config_map: &ConfigMap) -> Result<()> {
            self.config_maps
                .lock()
                .unwrap()
                .push((
                    pod.metadata.name.clone().unwrap_or_default(),
                    config_map.metadata.name.clone().unwrap_or_default(),
                ));
            Ok(())
        }

        async fn update_secret(&self, _pod: &Pod, _secret: &Secret) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_registered_pods() {
        let watcher = PodResourceWatcher::new();
        let pod = pod_with_volumes("default", "uptimed", vec![config_map_volume("c", "uptimed-conf")]);
        watcher.watch(&pod);

        let recorder = Recorder {
            config_maps: Mutex::new(Vec::new()),
        };
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("uptimed-conf".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        watcher
            .handle_event(&ResourceEvent::ConfigMap(config_map.clone()), &recorder)
            .await;
        assert_eq!(
            recorder.config_maps.lock().unwrap().as_slice(),
            &[("uptimed".to_string(), "uptimed-conf".to_string())]
        );

        // An update for an unreferenced ConfigMap dispatches nothing.
        let other = ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("other".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        watcher
            .handle_event(&ResourceEvent::ConfigMap(other), &recorder)
            .await;
        assert_eq!(recorder.config_maps.lock().unwrap().len(), 1);
    }
}
