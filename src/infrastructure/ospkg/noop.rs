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

use super::PackageManager;
use crate::shared::error::{Result, SystemkError};

/// A no-op package manager for hosts where no package handling is wanted,
/// i.e. the necessary executables are already available.
pub struct NoopManager;

#[async_trait]
impl PackageManager for NoopManager {
    async fn install(&self, pkg: &str, _version: &str) -> Result<bool> {
        Ok(!Path::new(pkg).is_absolute())
    }

    async fn unit_file(&self, _pkg: &str) -> Result<PathBuf> {
        // Pod creation synthesizes a unit file when this fails.
        Err(SystemkError::Package("noop".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absolute_paths_are_already_installed() {
        let mgr = NoopManager;
        assert!(!mgr.install("/bin/bash", "").await.unwrap());
        assert!(mgr.install("uptimed", "").await.unwrap());
        assert!(mgr.unit_file("uptimed").await.is_err());
    }
}
