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

//! Cluster access: client construction, ConfigMap/Secret listers backed by
//! reflector caches, and the informer tasks that feed them.

use std::collections::HashMap;
use std::path::Path;
use std::pin::pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::warn;

use super::watcher::{ObjectKey, PodResourceWatcher, ResourceEvent, ResourceUpdater};
use crate::shared::error::{Result, SystemkError};

/// Query ConfigMaps by name within a namespace.
pub trait ConfigMapLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap>;
}

/// Query Secrets by name within a namespace, and list a namespace.
pub trait SecretLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret>;
    fn list(&self, namespace: &str) -> Vec<Secret>;
}

/// Create a client from the default environment, or from an explicit
/// kubeconfig when one is given.
pub async fn new_client(kubeconfig_path: Option<&Path>) -> Result<Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    let Some(path) = kubeconfig_path else {
        return Client::try_default()
            .await
            .map_err(|e| SystemkError::Kube(format!("failed to create Kubernetes client: {e}")));
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| SystemkError::Kube(format!("failed to load kubeconfig: {e}")))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| SystemkError::Kube(format!("failed to create Kubernetes config: {e}")))?;
    Client::try_from(config)
        .map_err(|e| SystemkError::Kube(format!("failed to create Kubernetes client: {e}")))
}

/// Lister over a reflector cache of ConfigMaps.
pub struct StoreConfigMaps(Store<ConfigMap>);

impl ConfigMapLister for StoreConfigMaps {
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        let key = ObjectRef::new(name).within(namespace);
        self.0.get(&key).map(|cm| (*cm).clone())
    }
}

/// Lister over a reflector cache of Secrets.
pub struct StoreSecrets(Store<Secret>);

impl SecretLister for StoreSecrets {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        let key = ObjectRef::new(name).within(namespace);
        self.0.get(&key).map(|s| (*s).clone())
    }

    fn list(&self, namespace: &str) -> Vec<Secret> {
        self.0
            .state()
            .into_iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .map(|s| (*s).clone())
            .collect()
    }
}

/// The reflector-backed listers plus the informer tasks feeding them and
/// the pod-resource watcher.
pub struct ResourceInformers {
    pub config_maps: Arc<StoreConfigMaps>,
    pub secrets: Arc<StoreSecrets>,
    config_map_reader: Store<ConfigMap>,
    secret_reader: Store<Secret>,
    handles: Vec<JoinHandle<()>>,
}

impl ResourceInformers {
    /// Spawn ConfigMap and Secret informers. Updates for resources
    /// referenced by watched Pods are fanned out through `resources` to
    /// `updater`.
    pub fn start(
        client: Client,
        resources: Arc<PodResourceWatcher>,
        updater: Arc<dyn ResourceUpdater>,
    ) -> Self {
        let (cm_reader, cm_writer) = reflector::store::<ConfigMap>();
        let cm_api: Api<ConfigMap> = Api::all(client.clone());
        let cm_stream =
            reflector::reflector(cm_writer, watcher::watcher(cm_api, watcher::Config::default()));
        let cm_resources = resources.clone();
        let cm_updater = updater.clone();
        let cm_handle = tokio::spawn(async move {
            let mut stream = pin!(cm_stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Apply(cm)) | Ok(Event::InitApply(cm)) => {
                        cm_resources
                            .handle_event(&ResourceEvent::ConfigMap(cm), cm_updater.as_ref())
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "ConfigMap watch error"),
                }
            }
        });

        let (secret_reader, secret_writer) = reflector::store::<Secret>();
        let secret_api: Api<Secret> = Api::all(client);
        let secret_stream = reflector::reflector(
            secret_writer,
            watcher::watcher(secret_api, watcher::Config::default()),
        );
        let secret_handle = tokio::spawn(async move {
            let mut stream = pin!(secret_stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Apply(secret)) | Ok(Event::InitApply(secret)) => {
                        resources
                            .handle_event(&ResourceEvent::Secret(secret), updater.as_ref())
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "Secret watch error"),
                }
            }
        });

        Self {
            config_maps: Arc::new(StoreConfigMaps(cm_reader.clone())),
            secrets: Arc::new(StoreSecrets(secret_reader.clone())),
            config_map_reader: cm_reader,
            secret_reader,
            handles: vec![cm_handle, secret_handle],
        }
    }

    /// Wait for the caches to be populated, with a deadline.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let ready = async {
            let _ = self.config_map_reader.wait_until_ready().await;
            let _ = self.secret_reader.wait_until_ready().await;
        };
        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| SystemkError::Kube("timed out waiting for informer caches".to_string()))
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// The pod lifecycle surface driven by the pod informer. Implemented by
/// the provider.
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<()>;
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// Watch Pods scheduled onto this node and drive the provider. The
/// re-list on restart brings previously created Pods back through the
/// create path.
pub fn spawn_pod_informer(
    client: Client,
    node_name: &str,
    lifecycle: Arc<dyn PodLifecycle>,
) -> JoinHandle<()> {
    let api: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
    let stream = watcher::watcher(api, config);

    tokio::spawn(async move {
        let mut stream = pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                    if let Err(err) = sync_pod(lifecycle.as_ref(), &pod).await {
                        warn!(%err, "failed to sync Pod");
                    }
                }
                Ok(Event::Delete(pod)) => {
                    if let Err(err) = lifecycle.delete_pod(&pod).await {
                        warn!(%err, "failed to delete Pod");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "Pod watch error"),
            }
        }
    })
}

async fn sync_pod(lifecycle: &dyn PodLifecycle, pod: &Pod) -> Result<()> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    if pod.metadata.deletion_timestamp.is_some() {
        return lifecycle.delete_pod(pod).await;
    }
    // Only translate Pods that have not been materialized yet; spec updates
    // are not applied to running units.
    if lifecycle.get_pod(namespace, name).await?.is_none() {
        return lifecycle.create_pod(pod).await;
    }
    Ok(())
}

/// In-memory ConfigMap lister for tests.
#[derive(Default)]
pub struct MemoryConfigMaps {
    inner: RwLock<HashMap<ObjectKey, ConfigMap>>,
}

impl MemoryConfigMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config_map: ConfigMap) {
        let key = ObjectKey::new(
            config_map.metadata.namespace.clone().unwrap_or_default(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, config_map);
    }
}

impl ConfigMapLister for MemoryConfigMaps {
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }
}

/// In-memory Secret lister for tests.
#[derive(Default)]
pub struct MemorySecrets {
    inner: RwLock<HashMap<ObjectKey, Secret>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: Secret) {
        let key = ObjectKey::new(
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, secret);
    }
}

impl SecretLister for MemorySecrets {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn list(&self, namespace: &str) -> Vec<Secret> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect()
    }
}
