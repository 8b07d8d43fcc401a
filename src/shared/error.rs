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

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SystemkError>;

#[derive(Error, Debug)]
pub enum SystemkError {
    #[error("Kubernetes API error: {0}")]
    Kube(String),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("unit file parse error: {0}")]
    UnitParse(String),

    #[error("invalid unit name: {0}")]
    UnitName(String),

    #[error("{kind} '{name}' in namespace '{namespace}' not found")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("path {path:?} is not below any of the allowed roots {roots:?}")]
    UnsafePath { path: PathBuf, roots: Vec<PathBuf> },

    #[error("user or group lookup failed: {0}")]
    Principal(String),

    #[error("package operation failed: {0}")]
    Package(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<kube::Error> for SystemkError {
    fn from(err: kube::Error) -> Self {
        SystemkError::Kube(err.to_string())
    }
}

impl From<reqwest::Error> for SystemkError {
    fn from(err: reqwest::Error) -> Self {
        SystemkError::Package(err.to_string())
    }
}

impl SystemkError {
    pub fn not_found(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn invalid_input(context: impl Into<String>) -> Self {
        Self::InvalidInput(context.into())
    }

    pub fn config_error(context: impl Into<String>) -> Self {
        Self::Config(context.into())
    }

    /// True for errors that map to a 404 on the kubelet API surface.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for errors that map to a 400 on the kubelet API surface.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
