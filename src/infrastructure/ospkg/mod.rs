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

//! OS package management
//!
//! Container images are either package names, absolute paths to existing
//! binaries, or HTTPS URLs of downloadable packages. Each supported OS
//! family implements the same small surface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::shared::error::Result;

pub mod archlinux;
pub mod debian;
pub mod noop;

pub use archlinux::ArchLinuxManager;
pub use debian::DebianManager;
pub use noop::NoopManager;

/// OS package management.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Install the given package at the given version and return `true`.
    /// Does nothing if the package is already installed, in which case
    /// `false` is returned. Absolute paths are always already installed.
    async fn install(&self, pkg: &str, version: &str) -> Result<bool>;

    /// The location of the unit file shipped by the given package.
    /// Errors when no unit file is found.
    async fn unit_file(&self, pkg: &str) -> Result<PathBuf>;
}

/// Reduce an image reference to a bare package identifier: the last path
/// segment of a URL up to the first `_` (Debian archives are named
/// `<pkg>_<version>_<arch>.deb`), or the file name of an absolute path.
/// Anything else is returned unchanged.
pub fn clean(pkg: &str) -> String {
    let path = Path::new(pkg);
    if path.is_absolute() {
        if let Some(base) = path.file_name() {
            return base.to_string_lossy().into_owned();
        }
        return pkg.to_string();
    }

    if !pkg.starts_with("http://") && !pkg.starts_with("https://") {
        return pkg.to_string();
    }
    let Ok(parsed) = url::Url::parse(pkg) else {
        return pkg.to_string();
    };
    let base = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default();
    match base.find('_') {
        Some(i) if i >= 2 => base[..i].to_string(),
        _ => pkg.to_string(),
    }
}

/// The OS identifier from `/etc/os-release`, e.g. `debian` or `arch`.
pub fn os_release_id() -> String {
    let contents = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
    for line in contents.lines() {
        if let Some(id) = line.strip_prefix("ID=") {
            return id.trim_matches('"').to_string();
        }
    }
    String::new()
}

/// Pick the package manager matching the host OS.
pub fn detect() -> Box<dyn PackageManager> {
    match os_release_id().as_str() {
        "debian" | "ubuntu" => Box::new(DebianManager),
        "arch" => Box::new(ArchLinuxManager),
        id => {
            tracing::warn!(
                os = id,
                "unsupported package manager, limiting to existing binaries"
            );
            Box::new(NoopManager)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_reduces_references() {
        assert_eq!(clean("uptimed"), "uptimed");
        assert_eq!(clean("/bin/bash"), "bash");
        assert_eq!(
            clean("https://ftp.debian.org/pool/main/u/uptimed/uptimed_0.4.6-1_amd64.deb"),
            "uptimed"
        );
        // Too short before the underscore to be a package name.
        assert_eq!(
            clean("https://example.com/a_b.deb"),
            "https://example.com/a_b.deb"
        );
        assert_eq!(clean("not a url"), "not a url");
    }
}
