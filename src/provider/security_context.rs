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

use k8s_openapi::api::core::v1::Pod;
use nix::unistd::{Uid, User};

use crate::shared::error::{Result, SystemkError};

/// Resolve the uid and gid (as strings) from the Pod's security context.
///
/// A principal name set in `windowsOptions.runAsUserName` takes precedence
/// over `runAsUser`/`runAsGroup`: its numeric uid is authoritative and its
/// primary group becomes the default gid. If a uid is found but no gid, the
/// primary group of that uid is used. Empty strings mean the values from
/// the unit template are inherited.
///
/// When the resolved uid is 0 and `override_root_uid` is configured, that
/// principal's uid and primary gid are substituted. An unresolvable
/// principal name or root override is an error.
pub fn uid_gid_from_security_context(
    pod: &Pod,
    override_root_uid: Option<u32>,
) -> Result<(String, String)> {
    let mut uid = String::new();
    let mut gid = String::new();
    let mut primary_gid: Option<String> = None;

    if let Some(sc) = pod.spec.as_ref().and_then(|s| s.security_context.as_ref()) {
        if let Some(user) = sc.run_as_user {
            uid = user.to_string();
            if let Some(found) = lookup_uid(user)? {
                primary_gid = Some(found.gid.to_string());
            }
        }
        if let Some(group) = sc.run_as_group {
            gid = group.to_string();
        }
        if let Some(name) = sc
            .windows_options
            .as_ref()
            .and_then(|w| w.run_as_user_name.as_deref())
        {
            let found = User::from_name(name)
                .map_err(|e| SystemkError::Principal(format!("lookup of {name:?}: {e}")))?
                .ok_or_else(|| SystemkError::Principal(format!("user {name:?} not found")))?;
            uid = found.uid.to_string();
            primary_gid = Some(found.gid.to_string());
        }

        if !uid.is_empty() && gid.is_empty() {
            if let Some(primary) = primary_gid {
                gid = primary;
            }
        }
    }

    if uid == "0" {
        if let Some(mapped) = override_root_uid.filter(|n| *n > 0) {
            let found = lookup_uid(i64::from(mapped))?.ok_or_else(|| {
                SystemkError::Principal(format!("root override UID {mapped} not found"))
            })?;
            uid = found.uid.to_string();
            gid = found.gid.to_string();
        }
    }

    Ok((uid, gid))
}

fn lookup_uid(uid: i64) -> Result<Option<User>> {
    let Ok(raw) = u32::try_from(uid) else {
        return Ok(None);
    };
    User::from_uid(Uid::from_raw(raw))
        .map_err(|e| SystemkError::Principal(format!("lookup of uid {uid}: {e}")))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodSecurityContext, PodSpec, WindowsSecurityContextOptions};

    use super::*;

    fn pod_with_context(sc: Option<PodSecurityContext>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                security_context: sc,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_uid_and_gid() {
        let pod = pod_with_context(Some(PodSecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            ..Default::default()
        }));
        assert_eq!(
            uid_gid_from_security_context(&pod, None).unwrap(),
            ("0".to_string(), "0".to_string())
        );
    }

    #[test]
    fn root_is_overridden() {
        let pod = pod_with_context(Some(PodSecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            ..Default::default()
        }));
        // uid 1 is "daemon" on any Linux host; its primary group is gid 1.
        assert_eq!(
            uid_gid_from_security_context(&pod, Some(1)).unwrap(),
            ("1".to_string(), "1".to_string())
        );
    }

    #[test]
    fn missing_gid_falls_back_to_primary_group() {
        let pod = pod_with_context(Some(PodSecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }));
        let (uid, gid) = uid_gid_from_security_context(&pod, None).unwrap();
        assert_eq!(uid, "0");
        assert_eq!(gid, "0");
    }

    #[test]
    fn named_principal_wins() {
        let pod = pod_with_context(Some(PodSecurityContext {
            windows_options: Some(WindowsSecurityContextOptions {
                run_as_user_name: Some("root".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }));
        let (uid, gid) = uid_gid_from_security_context(&pod, Some(1)).unwrap();
        assert_eq!(uid, "1");
        assert_eq!(gid, "1");
    }

    #[test]
    fn unknown_principal_is_fatal() {
        let pod = pod_with_context(Some(PodSecurityContext {
            windows_options: Some(WindowsSecurityContextOptions {
                run_as_user_name: Some("no-such-user-systemk".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }));
        assert!(uid_gid_from_security_context(&pod, None).is_err());
    }

    #[test]
    fn no_context_inherits() {
        let pod = pod_with_context(None);
        assert_eq!(
            uid_gid_from_security_context(&pod, None).unwrap(),
            (String::new(), String::new())
        );
    }
}
