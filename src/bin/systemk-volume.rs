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

//! Helper binary cleaning up the run directory of a single pod.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "systemk-volume", version, about = "Manage systemk pod volumes")]
struct Cli {
    /// The pod UID
    #[arg(long, short)]
    poduid: String,

    /// Per-pod run directories live under this root
    #[arg(long, default_value = "/var/run")]
    run_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove the pod's run directory
    Clean,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.poduid.is_empty() {
        bail!("poduid must be specified");
    }
    if cli.poduid.contains("..") || cli.poduid.contains('/') {
        bail!("poduid can not contain {:?}: {}", "..", cli.poduid);
    }

    match cli.command {
        Command::Clean => {
            let dir = cli.run_root.join(&cli.poduid);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to clean {}", dir.display()))
                }
            }
        }
    }
}
