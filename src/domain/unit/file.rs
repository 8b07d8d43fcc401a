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

//! Systemd unit file model
//!
//! A unit file is an ordered list of `(section, key, value)` options.
//! Duplicate keys within a section are legal and order-preserving, so the
//! list is the source of truth; the section/key/values view is derived.

use std::fmt;
use std::str::FromStr;

use crate::shared::error::{Result, SystemkError};

/// A single `Key=Value` option tagged with the section it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOption {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl UnitOption {
    pub fn new(
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A parsed systemd unit file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFile {
    options: Vec<UnitOption>,
}

impl UnitFile {
    /// Parse `input` in the unit file grammar: `[Section]` headers,
    /// `Key=Value` lines, `;`/`#` comments and backslash continuations.
    ///
    /// The parser is permissive about keys, matching systemd: any line with
    /// an `=` is an option. A non-blank, non-comment line without one is a
    /// parse error. A trailing backslash continues the value on the next
    /// line; the backslash and the newline are preserved in the value so
    /// that serialization round-trips.
    pub fn parse(input: &str) -> Result<Self> {
        let mut options = Vec::new();
        let mut section: Option<String> = None;

        let mut lines = input.lines();
        while let Some(raw) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(SystemkError::UnitParse(format!(
                        "malformed section header: {line:?}"
                    )));
                }
                section = Some(line[1..line.len() - 1].to_string());
                continue;
            }
            let current = section.as_ref().ok_or_else(|| {
                SystemkError::UnitParse(format!("option outside of any section: {line:?}"))
            })?;
            let (key, rest) = line.split_once('=').ok_or_else(|| {
                SystemkError::UnitParse(format!("expected Key=Value, got {line:?}"))
            })?;

            let mut value = rest.trim_start().to_string();
            while value.ends_with('\\') {
                match lines.next() {
                    Some(cont) => {
                        value.push('\n');
                        value.push_str(cont);
                    }
                    None => break,
                }
            }

            options.push(UnitOption {
                section: current.clone(),
                key: key.trim_end().to_string(),
                value,
            });
        }

        Ok(Self { options })
    }

    pub fn from_options(options: Vec<UnitOption>) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &[UnitOption] {
        &self.options
    }

    /// All values recorded for `(section, key)`, in file order.
    pub fn values(&self, section: &str, key: &str) -> Vec<&str> {
        self.options
            .iter()
            .filter(|o| o.section == section && o.key == key)
            .map(|o| o.value.as_str())
            .collect()
    }

    /// The first value recorded for `(section, key)`, if any.
    pub fn first_value(&self, section: &str, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.section == section && o.key == key)
            .map(|o| o.value.as_str())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.options.iter().any(|o| o.section == section)
    }

    /// The first `[Unit] Description` value, or the empty string.
    pub fn description(&self) -> &str {
        self.first_value("Unit", "Description").unwrap_or("")
    }

    /// Append one option per value.
    pub fn insert(mut self, section: &str, key: &str, values: &[&str]) -> Self {
        for value in values {
            self.options.push(UnitOption::new(section, key, *value));
        }
        self
    }

    /// Remove every prior `(section, key)` occurrence, then append the new
    /// values.
    pub fn overwrite(self, section: &str, key: &str, values: &[&str]) -> Self {
        self.delete(section, key).insert(section, key, values)
    }

    /// Remove every `(section, key)` occurrence.
    pub fn delete(mut self, section: &str, key: &str) -> Self {
        self.options
            .retain(|o| !(o.section == section && o.key == key));
        self
    }
}

impl fmt::Display for UnitFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<&str> = None;
        for opt in &self.options {
            if current != Some(opt.section.as_str()) {
                if current.is_some() {
                    writeln!(f)?;
                }
                writeln!(f, "[{}]", opt.section)?;
                current = Some(opt.section.as_str());
            }
            writeln!(f, "{}={}", opt.key, opt.value)?;
        }
        Ok(())
    }
}

impl FromStr for UnitFile {
    type Err = SystemkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPTIMED: &str = r#"[Unit]
Description=uptime record daemon
Documentation=man:uptimed(8)

[Service]
ExecStart=/usr/sbin/uptimed -f
User=uptimed

[Install]
WantedBy=multi-user.target
"#;

    #[test]
    fn parse_and_description() {
        let uf = UnitFile::parse(UPTIMED).unwrap();
        assert_eq!(uf.description(), "uptime record daemon");
        assert_eq!(uf.values("Service", "ExecStart"), vec!["/usr/sbin/uptimed -f"]);
        assert!(uf.has_section("Install"));
        assert!(!uf.has_section("X-Kubernetes"));
    }

    #[test]
    fn round_trip() {
        let uf = UnitFile::parse(UPTIMED).unwrap();
        let reparsed = UnitFile::parse(&uf.to_string()).unwrap();
        assert_eq!(uf, reparsed);
    }

    #[test]
    fn comments_are_skipped() {
        let uf = UnitFile::parse("[Unit]\n; a comment\n# another\nDescription=x\n").unwrap();
        assert_eq!(uf.options().len(), 1);
    }

    #[test]
    fn continuation_preserves_newline() {
        let uf = UnitFile::parse("[Service]\nExecStart=/bin/echo \\\n  hello\n").unwrap();
        let values = uf.values("Service", "ExecStart");
        assert_eq!(values, vec!["/bin/echo \\\n  hello"]);
        // The continuation survives a serialize/parse cycle.
        let reparsed = UnitFile::parse(&uf.to_string()).unwrap();
        assert_eq!(uf, reparsed);
    }

    #[test]
    fn permissive_keys() {
        let uf = UnitFile::parse("[Service]\n<<<<=x\n").unwrap();
        assert_eq!(uf.values("Service", "<<<<"), vec!["x"]);
    }

    #[test]
    fn missing_equals_is_an_error() {
        assert!(UnitFile::parse("[Service]\nthis is not an option\n").is_err());
    }

    #[test]
    fn option_outside_section_is_an_error() {
        assert!(UnitFile::parse("Key=value\n").is_err());
    }

    #[test]
    fn insert_appends() {
        let uf = UnitFile::parse(UPTIMED).unwrap();
        let uf = uf.insert("Service", "Environment", &["A=1", "B=2"]);
        assert_eq!(uf.values("Service", "Environment"), vec!["A=1", "B=2"]);
        let uf = uf.insert("Service", "Environment", &["C=3"]);
        assert_eq!(
            uf.values("Service", "Environment").last().copied(),
            Some("C=3")
        );
    }

    #[test]
    fn overwrite_replaces_all() {
        let uf = UnitFile::parse(UPTIMED).unwrap();
        let uf = uf
            .insert("Service", "User", &["root"])
            .overwrite("Service", "User", &["65534"]);
        assert_eq!(uf.values("Service", "User"), vec!["65534"]);
    }

    #[test]
    fn delete_removes_all() {
        let uf = UnitFile::parse(UPTIMED).unwrap();
        let uf = uf.delete("Service", "User");
        assert!(uf.values("Service", "User").is_empty());
    }

    #[test]
    fn duplicate_keys_keep_order() {
        let input = "[Service]\nEnvironment=A=1\nEnvironment=B=2\n";
        let uf = UnitFile::parse(input).unwrap();
        assert_eq!(uf.values("Service", "Environment"), vec!["A=1", "B=2"]);
    }
}
