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

use super::config::Config;

/// The environment injected into every unit, formatted as `VAR=VALUE`:
/// the node name, the API server host and port parsed from the cluster
/// URL, and the node addresses.
pub fn default_environment(config: &Config) -> Vec<String> {
    let mut host = "127.0.0.1".to_string();
    let mut port = "6444".to_string();
    if let Some(raw) = &config.kubernetes_url {
        if let Ok(parsed) = url::Url::parse(raw) {
            if let Some(h) = parsed.host_str() {
                host = h.to_string();
            }
            if let Some(p) = parsed.port_or_known_default() {
                port = p.to_string();
            }
        }
    }

    let internal = config
        .node_internal_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let external = config
        .node_external_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default();

    vec![
        format!("HOSTNAME={}", config.node_name),
        format!("KUBERNETES_SERVICE_PORT={port}"),
        format!("KUBERNETES_SERVICE_HOST={host}"),
        mk_env_var("NODE_INTERNAL_IP", &internal),
        mk_env_var("NODE_EXTERNAL_IP", &external),
    ]
}

fn mk_env_var(name: &str, value: &str) -> String {
    format!("SYSTEMK_{name}={value}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_addresses_are_exported() {
        let config = Config {
            node_internal_ip: Some("192.168.1.1".parse().unwrap()),
            node_external_ip: Some("172.16.0.1".parse().unwrap()),
            ..Default::default()
        };
        let env = default_environment(&config);
        assert!(env.contains(&"SYSTEMK_NODE_INTERNAL_IP=192.168.1.1".to_string()));
        assert!(env.contains(&"SYSTEMK_NODE_EXTERNAL_IP=172.16.0.1".to_string()));
    }

    #[test]
    fn cluster_url_sets_service_host_and_port() {
        let config = Config {
            kubernetes_url: Some("https://master.example.org:6443".to_string()),
            ..Default::default()
        };
        let env = default_environment(&config);
        assert!(env.contains(&"KUBERNETES_SERVICE_HOST=master.example.org".to_string()));
        assert!(env.contains(&"KUBERNETES_SERVICE_PORT=6443".to_string()));
    }
}
