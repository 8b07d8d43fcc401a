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

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{clean, PackageManager};
use crate::domain::unit::name::SERVICE_SUFFIX;
use crate::shared::error::{Result, SystemkError};

const PACMAN: &str = "/usr/bin/pacman";
const UNIT_FILE_DIR: &str = "/usr/lib/systemd/system/";

/// Manages packages on Arch Linux.
pub struct ArchLinuxManager;

#[async_trait]
impl PackageManager for ArchLinuxManager {
    async fn install(&self, pkg: &str, _version: &str) -> Result<bool> {
        debug!(os = "archlinux", pkg = %clean(pkg), "checking if installed");
        if Path::new(pkg).is_absolute() {
            return Ok(false);
        }
        let check = Command::new(PACMAN).args(["-Qi", pkg]).output().await?;
        if check.status.success() {
            return Ok(false);
        }

        // pacman has no way to pin a package version.
        let output = Command::new(PACMAN)
            .args(["-S", "--noconfirm", pkg])
            .output()
            .await?;
        if !output.status.success() {
            return Err(SystemkError::Package(format!(
                "failed to install {pkg}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(true)
    }

    async fn unit_file(&self, pkg: &str) -> Result<PathBuf> {
        let output = Command::new(PACMAN).args(["-Ql", pkg]).output().await?;
        if !output.status.success() {
            return Err(SystemkError::Package(format!(
                "failed to list files of package {pkg}"
            )));
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            // Lines look like "<pkg> <path>".
            let Some((_, path)) = line.split_once(' ') else {
                return Err(SystemkError::Package(format!(
                    "unexpected pacman output line: {line:?}"
                )));
            };
            if path.starts_with(UNIT_FILE_DIR) && path.ends_with(SERVICE_SUFFIX) {
                return Ok(PathBuf::from(path));
            }
        }

        let basic = PathBuf::from(format!("{UNIT_FILE_DIR}{pkg}{SERVICE_SUFFIX}"));
        if basic.exists() {
            return Ok(basic);
        }
        Err(SystemkError::Package(format!(
            "no unit file found for package {pkg}"
        )))
    }
}
