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

//! End-to-end provider scenarios against the in-memory unit manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use systemk::infrastructure::kubernetes::watcher::ObjectKey;
use systemk::infrastructure::ospkg::NoopManager;
use systemk::{
    Config, MemoryConfigMaps, MemorySecrets, MockManager, PodResourceWatcher, Provider,
    ResourceEvent, UnitFile, KUBERNETES_SECTION,
};

const POD_UID: &str = "6a20e315-0bd2-4509-9c9f-b5a4c2b96d6b";

struct Fixture {
    provider: Arc<Provider>,
    manager: Arc<MockManager>,
    config_maps: Arc<MemoryConfigMaps>,
    resources: Arc<PodResourceWatcher>,
    _run_root: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let run_root = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(Config {
        node_name: "systemk-test-node".to_string(),
        node_internal_ip: Some("192.168.1.1".parse().unwrap()),
        allowed_host_paths: vec![run_root.path().to_path_buf()],
        run_root: run_root.path().to_path_buf(),
        ..Default::default()
    });
    let manager = Arc::new(MockManager::new());
    let config_maps = Arc::new(MemoryConfigMaps::new());
    let secrets = Arc::new(MemorySecrets::new());
    let resources = Arc::new(PodResourceWatcher::new());
    let provider = Arc::new(Provider::new(
        config,
        manager.clone(),
        Arc::new(NoopManager),
        resources.clone(),
        config_maps.clone(),
        secrets,
    ));
    Fixture {
        provider,
        manager,
        config_maps,
        resources,
        _run_root: run_root,
    }
}

fn pod(name: &str, containers: Vec<Container>, init: Vec<Container>, volumes: Vec<Volume>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            uid: Some(POD_UID.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            init_containers: if init.is_empty() { None } else { Some(init) },
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn single_container_from_a_package() {
    let fx = fixture();
    let mut uptimed = container("uptimed", "uptimed");
    uptimed.env = Some(vec![EnvVar {
        name: "UPTIMED_OPTS".to_string(),
        value: Some("-f".to_string()),
        ..Default::default()
    }]);
    let pod = pod("uptimed", vec![uptimed], vec![], vec![]);

    fx.provider.create_pod(&pod).await.expect("create");

    let unit_name = "systemk.default.uptimed.uptimed.service";
    let text = fx.manager.unit(unit_name).expect("unit loaded");
    let uf = UnitFile::parse(&text).expect("unit parses");

    // Isolation directives.
    assert_eq!(uf.values("Service", "ProtectSystem"), vec!["true"]);
    assert_eq!(uf.values("Service", "ProtectHome"), vec!["tmpfs"]);
    assert_eq!(uf.values("Service", "PrivateMounts"), vec!["true"]);
    assert_eq!(uf.values("Service", "ReadOnlyPaths"), vec!["/"]);
    assert_eq!(uf.values("Service", "TemporaryFileSystem"), vec!["/var /run"]);
    assert_eq!(uf.values("Service", "RemainAfterExit"), vec!["true"]);

    // Workload identity.
    assert_eq!(uf.values(KUBERNETES_SECTION, "Namespace"), vec!["default"]);
    assert_eq!(uf.values(KUBERNETES_SECTION, "Id"), vec![POD_UID]);
    assert_eq!(uf.values(KUBERNETES_SECTION, "Image"), vec!["uptimed"]);

    // Default environment plus the container's own, quoted.
    let env = uf.values("Service", "Environment");
    assert!(env.contains(&"HOSTNAME=systemk-test-node"));
    assert!(env.contains(&"SYSTEMK_NODE_INTERNAL_IP=192.168.1.1"));
    assert!(env.contains(&"UPTIMED_OPTS=\"-f\""));

    // Started asynchronously, and the freshly installed package's own
    // unit cannot race ours.
    assert_eq!(fx.manager.started(), vec![unit_name.to_string()]);
    assert_eq!(fx.manager.masked(), vec!["uptimed.service".to_string()]);

    // Once the service manager reports running, so does the pod status.
    fx.manager.set_state(unit_name, "loaded", "active", "running");
    fx.manager
        .set_service_property(unit_name, "ExecMainStartTimestamp", "1611313420000000");
    let status = fx
        .provider
        .get_pod_status("default", "uptimed")
        .await
        .expect("status")
        .expect("pod exists");
    assert_eq!(status.phase.as_deref(), Some("Running"));
}

#[tokio::test]
async fn init_and_main_share_an_empty_dir() {
    let fx = fixture();
    let volume = Volume {
        name: "etc-uptimed".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: "etc-uptimed".to_string(),
        mount_path: "/etc/uptimed".to_string(),
        ..Default::default()
    };

    let mut init = container("init-uptimed", "/bin/bash");
    init.command = Some(vec!["/bin/bash".to_string(), "-c".to_string()]);
    init.args = Some(vec!["echo goodbye > /etc/uptimed/hello".to_string()]);
    init.volume_mounts = Some(vec![mount.clone()]);

    let mut main = container("uptimed", "uptimed");
    main.volume_mounts = Some(vec![mount]);

    let pod = pod("uptimed", vec![main], vec![init], vec![volume]);
    fx.provider.create_pod(&pod).await.expect("create");

    let init_name = "systemk.default.uptimed.init-uptimed.service";
    let main_name = "systemk.default.uptimed.uptimed.service";

    let init_uf = UnitFile::parse(&fx.manager.unit(init_name).expect("init unit")).unwrap();
    assert_eq!(init_uf.values("Service", "Type"), vec!["oneshot"]);
    assert_eq!(init_uf.values(KUBERNETES_SECTION, "InitContainer"), vec!["true"]);

    // The main unit is chained after the init unit.
    let main_uf = UnitFile::parse(&fx.manager.unit(main_name).expect("main unit")).unwrap();
    assert_eq!(main_uf.values("Unit", "After"), vec![init_name]);

    // Both bind-mount the same staged emptyDir.
    let staged = fx
        .provider
        .config()
        .run_root
        .join(POD_UID)
        .join("emptydirs")
        .join("#0");
    assert!(staged.is_dir());
    let bind = format!("{}:/etc/uptimed", staged.display());
    assert_eq!(init_uf.values("Service", "BindPaths"), vec![bind.as_str()]);
    assert_eq!(main_uf.values("Service", "BindPaths"), vec![bind.as_str()]);

    // Start order follows initContainers ++ containers.
    assert_eq!(
        fx.manager.started(),
        vec![init_name.to_string(), main_name.to_string()]
    );
}

#[tokio::test]
async fn config_map_projection_and_update() {
    let fx = fixture();
    fx.config_maps.insert(config_map("uptimed-conf", "interval=5\n"));

    let volume = Volume {
        name: "conf".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: "uptimed-conf".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pod = pod("uptimed", vec![container("uptimed", "uptimed")], vec![], vec![volume]);
    fx.provider.create_pod(&pod).await.expect("create");

    let staged = fx
        .provider
        .config()
        .run_root
        .join(POD_UID)
        .join("configmaps")
        .join("#0")
        .join("uptimed.conf");
    assert_eq!(
        std::fs::read_to_string(&staged).expect("projected file"),
        "interval=5\n"
    );

    // The watcher indexes the pod for this ConfigMap, exactly once.
    let key = ObjectKey::new("default", "uptimed-conf");
    assert_eq!(fx.resources.config_map_watchers(&key).len(), 1);

    // An update event re-materializes the projection atomically.
    let updated = config_map("uptimed-conf", "interval=10\n");
    fx.config_maps.insert(updated.clone());
    fx.resources
        .handle_event(&ResourceEvent::ConfigMap(updated), fx.provider.as_ref())
        .await;
    assert_eq!(
        std::fs::read_to_string(&staged).expect("projected file"),
        "interval=10\n"
    );
}

fn config_map(name: &str, contents: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "uptimed.conf".to_string(),
            contents.to_string(),
        )])),
        ..Default::default()
    }
}

#[tokio::test]
async fn absolute_path_image_synthesizes_a_unit() {
    let fx = fixture();
    let mut bash = container("bash", "/bin/bash");
    bash.command = Some(vec!["/bin/bash".to_string(), "-c".to_string()]);
    bash.args = Some(vec!["echo ok".to_string()]);
    let pod = pod("bash", vec![bash], vec![], vec![]);

    fx.provider.create_pod(&pod).await.expect("create");

    // Already installed: nothing to mask.
    assert!(fx.manager.masked().is_empty());

    let uf = UnitFile::parse(
        &fx.manager
            .unit("systemk.default.bash.bash.service")
            .expect("unit loaded"),
    )
    .unwrap();
    assert_eq!(
        uf.values("Service", "ExecStart"),
        vec!["/bin/bash -c \"echo ok\""]
    );
    assert_eq!(uf.values(KUBERNETES_SECTION, "Image"), vec!["bash"]);
    // Synthesized template, not a packaged one.
    assert_eq!(uf.description(), "systemk");
}

#[tokio::test]
async fn delete_stops_unloads_and_cleans_up() {
    let fx = fixture();
    let volume = Volume {
        name: "conf".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: "uptimed-conf".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    fx.config_maps.insert(config_map("uptimed-conf", "x\n"));

    let init = container("init-uptimed", "/bin/true");
    let main = container("uptimed", "uptimed");
    let pod = pod("uptimed", vec![main], vec![init], vec![volume]);
    fx.provider.create_pod(&pod).await.expect("create");

    let run_dir = fx.provider.config().run_root.join(POD_UID);
    assert!(run_dir.is_dir());

    fx.provider.delete_pod(&pod).await.expect("delete");

    let init_name = "systemk.default.uptimed.init-uptimed.service".to_string();
    let main_name = "systemk.default.uptimed.uptimed.service".to_string();
    assert_eq!(fx.manager.stopped(), vec![init_name.clone(), main_name.clone()]);
    assert_eq!(fx.manager.unloaded(), vec![init_name, main_name]);
    assert_eq!(fx.manager.reloads(), 1);
    assert!(!run_dir.exists());

    // Both indexes are empty for the workload.
    let key = ObjectKey::new("default", "uptimed-conf");
    assert!(fx.resources.config_map_watchers(&key).is_empty());
    let (config_keys, secret_keys) = fx.resources.keys_for_pod(&pod);
    assert!(config_keys.is_empty() && secret_keys.is_empty());
}

#[tokio::test]
async fn terminated_units_reduce_to_a_terminal_phase() {
    let fx = fixture();
    let pod = pod("batch", vec![container("job", "/bin/true")], vec![], vec![]);
    fx.provider.create_pod(&pod).await.expect("create");

    let unit_name = "systemk.default.batch.job.service";
    fx.manager.set_state(unit_name, "loaded", "inactive", "exited");
    fx.manager
        .set_service_property(unit_name, "ExecMainStatus", "0");
    fx.manager
        .set_service_property(unit_name, "ExecMainStartTimestamp", "1611313420000000");
    fx.manager
        .set_service_property(unit_name, "ExecMainExitTimestamp", "1611313425000000");
    fx.manager.set_service_property(unit_name, "MainPID", "4242");

    let status = fx
        .provider
        .get_pod_status("default", "batch")
        .await
        .expect("status")
        .expect("pod exists");
    assert_eq!(status.phase.as_deref(), Some("Succeeded"));
    let statuses = status.container_statuses.expect("container statuses");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].container_id.as_deref(), Some("pid://4242"));
    let terminated = statuses[0]
        .state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .expect("terminated state");
    assert_eq!(terminated.exit_code, 0);
    assert_eq!(terminated.reason.as_deref(), Some("Succeeded"));
}

#[tokio::test]
async fn contradictory_log_parameters_are_a_bad_request() {
    let fx = fixture();
    let pod = pod("uptimed", vec![container("uptimed", "uptimed")], vec![], vec![]);
    fx.provider.create_pod(&pod).await.expect("create");

    let api = systemk::http::KubeletApi::new(fx.provider.clone());
    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(
            "/containerLogs/default/uptimed/uptimed?sinceSeconds=10&sinceTime=2024-01-01T00:00:00Z",
        )
        .body(())
        .expect("request");
    let response = api.handle(request).await;
    assert_eq!(response.status(), hyper::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_pod_logs_are_not_found() {
    let fx = fixture();
    let api = systemk::http::KubeletApi::new(fx.provider.clone());
    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri("/containerLogs/default/missing/missing")
        .body(())
        .expect("request");
    let response = api.handle(request).await;
    assert_eq!(response.status(), hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn foreign_units_are_not_reported() {
    let fx = fixture();
    let pods = fx.provider.get_pods().await.expect("get pods");
    assert!(pods.is_empty());
}

#[tokio::test]
async fn security_context_from_manifest_sets_unit_identity() {
    const UPTIMED_POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: uptimed
  namespace: default
  uid: 6a20e315-0bd2-4509-9c9f-b5a4c2b96d6b
spec:
  securityContext:
    runAsUser: 0
    runAsGroup: 0
  containers:
  - name: uptimed
    image: uptimed
"#;
    let pod: Pod = serde_yaml::from_str(UPTIMED_POD).expect("manifest parses");

    let fx = fixture();
    fx.provider.create_pod(&pod).await.expect("create");

    let uf = UnitFile::parse(
        &fx.manager
            .unit("systemk.default.uptimed.uptimed.service")
            .expect("unit loaded"),
    )
    .unwrap();
    assert_eq!(uf.values("Service", "User"), vec!["0"]);
    assert_eq!(uf.values("Service", "Group"), vec!["0"]);
}

#[tokio::test]
async fn get_pods_groups_by_workload() {
    let fx = fixture();
    let one = pod("uptimed", vec![container("uptimed", "uptimed")], vec![], vec![]);
    fx.provider.create_pod(&one).await.expect("create");

    let mut two = pod("bash", vec![container("bash", "/bin/bash")], vec![], vec![]);
    two.metadata.uid = Some("11111111-2222-3333-4444-555555555555".to_string());
    fx.provider.create_pod(&two).await.expect("create");

    let pods = fx.provider.get_pods().await.expect("get pods");
    let mut names: Vec<_> = pods
        .iter()
        .map(|p| p.metadata.name.clone().unwrap_or_default())
        .collect();
    names.sort();
    assert_eq!(names, vec!["bash".to_string(), "uptimed".to_string()]);
}
