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

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, info};

use super::{clean, PackageManager};
use crate::domain::unit::name::SERVICE_SUFFIX;
use crate::shared::error::{Result, SystemkError};

const APT_GET: &str = "/usr/bin/apt-get";
const DPKG: &str = "/usr/bin/dpkg";
const UNIT_FILE_DIR: &str = "/lib/systemd/system/";

/// Manages packages on Debian and Ubuntu.
pub struct DebianManager;

#[async_trait]
impl PackageManager for DebianManager {
    async fn install(&self, pkg: &str, version: &str) -> Result<bool> {
        debug!(os = "debian", pkg = %clean(pkg), "checking if installed");
        if Path::new(pkg).is_absolute() {
            return Ok(false);
        }
        let check = Command::new(DPKG)
            .args(["-s", &clean(pkg)])
            .output()
            .await?;
        if check.status.success() {
            return Ok(false);
        }

        // Keep the downloaded archive alive until dpkg has consumed it.
        let mut downloaded: Option<TempPath> = None;
        let mut cmd;
        if pkg.starts_with("https://") {
            let archive = fetch(pkg).await?;
            cmd = Command::new(DPKG);
            cmd.arg("-i").arg(archive.as_os_str());
            downloaded = Some(archive);
        } else {
            let target = if version.is_empty() {
                pkg.to_string()
            } else {
                format!("{pkg}={version}*")
            };
            cmd = Command::new(APT_GET);
            cmd.args(["-qq", "--assume-yes", "--no-install-recommends", "install"])
                .arg(target);
        }

        // Newly installed services must not auto-start; the policy helper
        // makes invoke-rc.d refuse every action.
        let policy = policy_script()?;
        cmd.env_clear().env("POLICYRCD", policy.as_os_str());
        for var in ["PATH", "HOME", "LOGNAME"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        info!(pkg, "installing package");
        let output = cmd.output().await?;
        drop(downloaded);
        if !output.status.success() {
            return Err(SystemkError::Package(format!(
                "failed to install {pkg}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(true)
    }

    async fn unit_file(&self, pkg: &str) -> Result<PathBuf> {
        let output = Command::new(DPKG).args(["-L", pkg]).output().await?;
        if !output.status.success() {
            return Err(SystemkError::Package(format!(
                "failed to list files of package {pkg}"
            )));
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.starts_with(UNIT_FILE_DIR) && line.ends_with(SERVICE_SUFFIX) {
                return Ok(PathBuf::from(line));
            }
        }

        // Not listed by the package; see if one exists under the basic name.
        let basic = PathBuf::from(format!("{UNIT_FILE_DIR}{pkg}{SERVICE_SUFFIX}"));
        if basic.exists() {
            return Ok(basic);
        }
        Err(SystemkError::Package(format!(
            "no unit file found for package {pkg}"
        )))
    }
}

/// Write a policy helper script that refuses to start any service.
fn policy_script() -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("policy-donotstart")
        .tempfile()?;
    file.write_all(b"#!/bin/sh\nexit 101\n")?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    Ok(file.into_temp_path())
}

/// Download a remote package archive to a temporary file.
async fn fetch(url: &str) -> Result<TempPath> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let body = response.bytes().await?;
    let mut file = tempfile::Builder::new()
        .prefix("package")
        .suffix(".deb")
        .tempfile()?;
    file.write_all(&body)?;
    Ok(file.into_temp_path())
}
