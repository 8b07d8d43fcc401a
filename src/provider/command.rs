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

use std::path::Path;

use k8s_openapi::api::core::v1::Container;

use crate::domain::unit::UnitFile;

/// Compute the `ExecStart` value from the unit template and the container's
/// `command`/`args`. A `command` replaces the template's executable, its
/// first element resolved via PATH lookup when not absolute. `args` are
/// quoted and appended after the executable, dropping any template-provided
/// arguments. An invalid result yields an invalid unit, which the control
/// plane deals with.
pub fn command_and_args(uf: &UnitFile, container: &Container) -> Vec<String> {
    let exec_start = uf.values("Service", "ExecStart");
    let mut cmdargs: Vec<String> = if exec_start.len() == 1 {
        exec_start[0].split_whitespace().map(String::from).collect()
    } else {
        exec_start.iter().map(|s| s.to_string()).collect()
    };
    if cmdargs.is_empty() {
        cmdargs.push(String::new());
    }

    if let Some(command) = container.command.as_ref().filter(|c| !c.is_empty()) {
        let mut command = command.clone();
        if !Path::new(&command[0]).is_absolute() {
            if let Ok(full) = which::which(&command[0]) {
                command[0] = full.to_string_lossy().into_owned();
            }
        }
        cmdargs[0] = command.join(" ");
    }
    if let Some(args) = container.args.as_ref() {
        cmdargs.truncate(1);
        for arg in args {
            cmdargs.push(format!("{arg:?}"));
        }
    }

    cmdargs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(exec_start: &str) -> UnitFile {
        UnitFile::parse(&format!("[Service]\nExecStart={exec_start}\n")).unwrap()
    }

    #[test]
    fn template_exec_start_is_kept() {
        let uf = template("/usr/sbin/uptimed -f");
        let container = Container::default();
        assert_eq!(
            command_and_args(&uf, &container),
            vec!["/usr/sbin/uptimed", "-f"]
        );
    }

    #[test]
    fn command_replaces_executable() {
        let uf = template("/usr/sbin/uptimed -f");
        let container = Container {
            command: Some(vec!["/bin/sleep".to_string(), "5".to_string()]),
            ..Default::default()
        };
        assert_eq!(command_and_args(&uf, &container), vec!["/bin/sleep 5", "-f"]);
    }

    #[test]
    fn args_drop_template_arguments() {
        let uf = template("/usr/sbin/uptimed -f");
        let container = Container {
            args: Some(vec!["--debug".to_string(), "two words".to_string()]),
            ..Default::default()
        };
        assert_eq!(
            command_and_args(&uf, &container),
            vec!["/usr/sbin/uptimed", "\"--debug\"", "\"two words\""]
        );
    }

    #[test]
    fn command_and_args_combine() {
        let uf = template("");
        let container = Container {
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
            args: Some(vec!["echo ok".to_string()]),
            ..Default::default()
        };
        assert_eq!(
            command_and_args(&uf, &container),
            vec!["/bin/bash -c", "\"echo ok\""]
        );
    }
}
