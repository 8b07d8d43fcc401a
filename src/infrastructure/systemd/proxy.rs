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

//! D-Bus proxy for `org.freedesktop.systemd1.Manager`.

use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

/// One entry of the `ListUnits` reply, signature `(ssssssouso)`.
pub type ListedUnit = (
    String,          // unit name
    String,          // description
    String,          // load state
    String,          // active state
    String,          // sub state
    String,          // followed unit
    OwnedObjectPath, // unit object path
    u32,             // queued job id
    String,          // job type
    OwnedObjectPath, // job object path
);

/// Result entries of the unit-file install methods, signature `(sss)`:
/// change type, symlink name, symlink destination.
pub type UnitFileChange = (String, String, String);

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
pub trait SystemdBus {
    /// Queue a start job for the unit. Returns the job object path.
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Queue a stop job for the unit. Returns the job object path.
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Load the unit (if needed) and return its object path.
    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn list_units(&self) -> zbus::Result<Vec<ListedUnit>>;

    fn link_unit_files(
        &self,
        files: Vec<&str>,
        runtime: bool,
        force: bool,
    ) -> zbus::Result<Vec<UnitFileChange>>;

    /// The boolean in the reply reports whether the unit files carried
    /// install information.
    fn enable_unit_files(
        &self,
        files: Vec<&str>,
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<UnitFileChange>)>;

    fn disable_unit_files(
        &self,
        files: Vec<&str>,
        runtime: bool,
    ) -> zbus::Result<Vec<UnitFileChange>>;

    fn mask_unit_files(
        &self,
        files: Vec<&str>,
        runtime: bool,
        force: bool,
    ) -> zbus::Result<Vec<UnitFileChange>>;

    fn reset_failed_unit(&self, name: &str) -> zbus::Result<()>;

    /// Ask the service manager to re-read all unit files.
    fn reload(&self) -> zbus::Result<()>;
}
