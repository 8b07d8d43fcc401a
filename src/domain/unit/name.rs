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

//! Unit naming
//!
//! Units managed by this agent are named
//! `systemk.<namespace>.<pod>.<container>.service`. The dot is the
//! separator, so namespace, pod and container names must not contain dots;
//! this is enforced when the name is composed, which keeps the reverse
//! parse unambiguous.

use std::sync::OnceLock;

use regex::Regex;

use crate::shared::error::{Result, SystemkError};

/// Prefix for every unit owned by this agent.
pub const PREFIX: &str = "systemk";

/// Separator between the name components.
pub const SEPARATOR: char = '.';

/// Suffix of every service unit.
pub const SERVICE_SUFFIX: &str = ".service";

fn component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // DNS-1123 labels, the character set Kubernetes enforces for
    // namespaces, pod names and container names.
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap())
}

fn check_component(kind: &str, value: &str) -> Result<()> {
    if component_re().is_match(value) {
        return Ok(());
    }
    Err(SystemkError::UnitName(format!(
        "{kind} {value:?} must be a DNS-1123 label (no dots)"
    )))
}

/// Compose the canonical unit name for a container of a pod.
pub fn compose(namespace: &str, pod: &str, container: &str) -> Result<String> {
    check_component("namespace", namespace)?;
    check_component("pod name", pod)?;
    check_component("container name", container)?;
    Ok(format!(
        "{PREFIX}{SEPARATOR}{namespace}{SEPARATOR}{pod}{SEPARATOR}{container}{SERVICE_SUFFIX}"
    ))
}

/// Prefix matching every unit of the given pod, including the trailing
/// separator so that `update` does not also match `update2`.
pub fn pod_prefix(namespace: &str, pod: &str) -> String {
    format!("{PREFIX}{SEPARATOR}{namespace}{SEPARATOR}{pod}{SEPARATOR}")
}

/// The identity encoded in a well-formed unit name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName<'a> {
    pub namespace: &'a str,
    pub pod: &'a str,
    pub container: &'a str,
}

/// Parse a unit name back into its components. Names that do not carry the
/// prefix or the full four-component form are foreign to this agent and
/// yield `None`.
pub fn parse(name: &str) -> Option<ParsedName<'_>> {
    let stem = name.strip_suffix(SERVICE_SUFFIX)?;
    let parts: Vec<&str> = stem.split(SEPARATOR).collect();
    if parts.len() != 4 || parts[0] != PREFIX {
        return None;
    }
    Some(ParsedName {
        namespace: parts[1],
        pod: parts[2],
        container: parts[3],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for (ns, pod, ctr) in [
            ("default", "uptimed", "uptimed"),
            ("kube-system", "openssh-server", "openssh-server-container"),
        ] {
            let name = compose(ns, pod, ctr).unwrap();
            let parsed = parse(&name).unwrap();
            assert_eq!(parsed.namespace, ns);
            assert_eq!(parsed.pod, pod);
            assert_eq!(parsed.container, ctr);
        }
    }

    #[test]
    fn name_splitting() {
        let parsed = parse("systemk.default.openssh-server.openssh-server-container.service")
            .unwrap();
        assert_eq!(parsed.namespace, "default");
        assert_eq!(parsed.pod, "openssh-server");
        assert_eq!(parsed.container, "openssh-server-container");
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert!(parse("ssh.service").is_none());
        assert!(parse("systemk.default.service").is_none());
        assert!(parse("cron.daily.timer").is_none());
        assert!(parse("other.default.uptimed.uptimed.service").is_none());
    }

    #[test]
    fn dots_are_rejected_at_compose_time() {
        assert!(compose("name.space", "pod", "ctr").is_err());
        assert!(compose("default", "my.pod", "ctr").is_err());
        assert!(compose("default", "pod", "c.tr").is_err());
        assert!(compose("default", "", "ctr").is_err());
    }

    #[test]
    fn pod_prefix_ends_with_separator() {
        assert_eq!(pod_prefix("default", "update"), "systemk.default.update.");
    }
}
