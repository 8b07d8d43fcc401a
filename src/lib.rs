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

// Core modules
pub mod cli;
pub mod domain;
pub mod http;
pub mod infrastructure;
pub mod provider;
pub mod shared;

// Re-export commonly used types
pub use domain::unit::{UnitFile, UnitOption, KUBERNETES_SECTION};
pub use infrastructure::kubernetes::{PodResourceWatcher, ResourceEvent, ResourceUpdater};
pub use infrastructure::systemd::{SystemdManager, UnitManager, UnitState};
pub use provider::{Config, Provider};
pub use shared::{Result, SystemkError};

// Re-export test doubles for integration tests
#[doc(hidden)]
pub use infrastructure::kubernetes::client::{MemoryConfigMaps, MemorySecrets};
#[doc(hidden)]
pub use infrastructure::systemd::MockManager;
