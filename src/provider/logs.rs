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

//! Container log retrieval via a `journalctl` subprocess.
//!
//! Follow mode runs one producer task reading lines from the subprocess
//! into a channel; the HTTP layer consumes the channel. When the consumer
//! goes away the channel send fails, and the producer kills and reaps the
//! child before exiting.

use std::process::Stdio;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::shared::error::{Result, SystemkError};

const JOURNALCTL: &str = "journalctl";

/// Log options parsed from the kubelet API query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub tail: Option<u64>,
    pub follow: bool,
    pub limit_bytes: Option<usize>,
    pub previous: bool,
    pub since_seconds: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
    pub timestamps: bool,
}

impl LogOptions {
    /// Parse a raw query string. Contradictory or out-of-range options are
    /// invalid input.
    pub fn from_query(query: &str) -> Result<Self> {
        let mut opts = LogOptions::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "tailLines" => {
                    let tail = value.parse::<i64>().map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"tailLines\": {e}"))
                    })?;
                    if tail < 0 {
                        return Err(SystemkError::invalid_input(format!(
                            "\"tailLines\" is {tail}"
                        )));
                    }
                    opts.tail = Some(tail as u64);
                }
                "follow" => {
                    opts.follow = value.parse().map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"follow\": {e}"))
                    })?;
                }
                "limitBytes" => {
                    let limit = value.parse::<i64>().map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"limitBytes\": {e}"))
                    })?;
                    if limit < 1 {
                        return Err(SystemkError::invalid_input(format!(
                            "\"limitBytes\" is {limit}"
                        )));
                    }
                    opts.limit_bytes = Some(limit as usize);
                }
                "previous" => {
                    opts.previous = value.parse().map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"previous\": {e}"))
                    })?;
                }
                "sinceSeconds" => {
                    let seconds = value.parse::<i64>().map_err(|e| {
                        SystemkError::invalid_input(format!(
                            "could not parse \"sinceSeconds\": {e}"
                        ))
                    })?;
                    if seconds < 1 {
                        return Err(SystemkError::invalid_input(format!(
                            "\"sinceSeconds\" is {seconds}"
                        )));
                    }
                    opts.since_seconds = Some(seconds);
                }
                "sinceTime" => {
                    let time = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"sinceTime\": {e}"))
                    })?;
                    opts.since_time = Some(time.with_timezone(&Utc));
                }
                "timestamps" => {
                    opts.timestamps = value.parse().map_err(|e| {
                        SystemkError::invalid_input(format!("could not parse \"timestamps\": {e}"))
                    })?;
                }
                _ => {}
            }
        }
        if opts.since_seconds.is_some() && opts.since_time.is_some() {
            return Err(SystemkError::invalid_input(
                "both \"sinceSeconds\" and \"sinceTime\" are set",
            ));
        }
        Ok(opts)
    }
}

/// The `journalctl` invocation for a unit and options.
pub(crate) fn journalctl_args(unit: &str, opts: &LogOptions, now: DateTime<Utc>) -> Vec<String> {
    let mut args = vec!["-u".to_string(), unit.to_string()];
    if let Some(tail) = opts.tail {
        args.push("-n".to_string());
        args.push(tail.to_string());
    }
    if opts.follow {
        args.push("-f".to_string());
    }
    if !opts.timestamps {
        // Kubernetes defaults to no timestamps; the journal defaults to
        // showing them.
        args.push("-o".to_string());
        args.push("cat".to_string());
    }
    let since = if let Some(seconds) = opts.since_seconds {
        Some(now - Duration::seconds(seconds))
    } else {
        opts.since_time
    };
    if let Some(since) = since {
        args.push(format!("--since={}", since.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    args
}

/// Spawn `journalctl` for the unit and stream its lines. The subprocess is
/// killed and reaped as soon as the receiver is dropped or the byte limit
/// is reached.
pub fn spawn_journal_reader(unit: String, opts: LogOptions) -> Result<mpsc::Receiver<Bytes>> {
    let args = journalctl_args(&unit, &opts, Utc::now());
    info!(unit = %unit, ?args, "reading container logs");

    let mut child = Command::new(JOURNALCTL)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SystemkError::Config("journalctl stdout not captured".to_string()))?;

    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut sent = 0usize;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut buf = line.into_bytes();
                    buf.push(b'\n');
                    if let Some(limit) = opts.limit_bytes {
                        if sent + buf.len() > limit {
                            buf.truncate(limit.saturating_sub(sent));
                            let _ = tx.send(Bytes::from(buf)).await;
                            break;
                        }
                    }
                    sent += buf.len();
                    if tx.send(Bytes::from(buf)).await.is_err() {
                        // Consumer is gone.
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(unit = %unit, %err, "journal read ended");
                    break;
                }
            }
        }
        // Release the OS process.
        let _ = child.kill().await;
        let _ = child.wait().await;
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_are_applied() {
        let opts = LogOptions::from_query("tailLines=10").unwrap();
        assert_eq!(opts.tail, Some(10));
        let args = journalctl_args("systemk.default.uptimed.uptimed.service", &opts, Utc::now());
        assert!(args.contains(&"-n".to_string()));
        assert!(args.contains(&"10".to_string()));
    }

    #[test]
    fn contradictory_since_options_are_rejected() {
        let err = LogOptions::from_query("sinceSeconds=10&sinceTime=2024-01-01T00:00:00Z")
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(LogOptions::from_query("tailLines=minus").is_err());
        assert!(LogOptions::from_query("tailLines=-1").is_err());
        assert!(LogOptions::from_query("limitBytes=0").is_err());
        assert!(LogOptions::from_query("sinceSeconds=0").is_err());
        assert!(LogOptions::from_query("follow=perhaps").is_err());
    }

    #[test]
    fn follow_and_timestamps() {
        let opts = LogOptions::from_query("follow=true&timestamps=true").unwrap();
        assert!(opts.follow && opts.timestamps);
        let args = journalctl_args("u.service", &opts, Utc::now());
        assert!(args.contains(&"-f".to_string()));
        // Timestamps requested, so the plain `cat` output is not used.
        assert!(!args.contains(&"cat".to_string()));
    }

    #[test]
    fn since_seconds_becomes_absolute() {
        let opts = LogOptions::from_query("sinceSeconds=60").unwrap();
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:01:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let args = journalctl_args("u.service", &opts, now);
        assert!(args.contains(&"--since=2024-01-01 00:00:00 UTC".to_string()));
    }
}
