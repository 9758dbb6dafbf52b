//! Script environment assembly.
//!
//! Three layers, later wins: appstack default variables, instance variable
//! overrides, then the host snapshot captured at provision time. Insertion
//! order is preserved so scripts see variables in a stable order.

use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::appstack::VariableSet;

/// An insertion-ordered name/value map.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentMap {
    vars: Vec<(String, String)>,
}

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer the appstack defaults under the instance overrides.
    pub fn from_variable_sets(defaults: &VariableSet, instance: &VariableSet) -> Self {
        let mut env = Self::new();
        for (name, spec) in &defaults.variables {
            env.set(name, &spec.resolved());
        }
        for (name, spec) in &instance.variables {
            env.set(name, &spec.resolved());
        }
        env
    }

    /// Insert or overwrite, keeping the original position of an existing
    /// name. Values are trimmed and surrounding double quotes stripped.
    pub fn set(&mut self, name: &str, value: &str) {
        let value = clean_value(value);
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Layer the host snapshot on top. The snapshot is `KEY=VALUE` lines;
    /// lines without exactly one `=` are ignored. A missing snapshot file
    /// contributes nothing.
    pub fn apply_snapshot(&mut self, path: &Path) -> anyhow::Result<()> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no environment snapshot at {}", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading snapshot {}", path.display()));
            }
        };
        for line in content.lines() {
            let parts: Vec<&str> = line.split('=').collect();
            if parts.len() == 2 {
                self.set(parts[0], parts[1]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl EnvironmentMap {
    /// Lookup by name; the agent only ever iterates, so this is a test
    /// convenience.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn clean_value(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_overrides_defaults() {
        let defaults =
            VariableSet::parse(r#"{"variables": {"PORT": {"value": "80"}, "HOST": {"value": "a"}}}"#);
        let instance = VariableSet::parse(r#"{"variables": {"PORT": {"value": "8080"}}}"#);
        let env = EnvironmentMap::from_variable_sets(&defaults, &instance);
        assert_eq!(env.get("PORT"), Some("8080"));
        assert_eq!(env.get("HOST"), Some("a"));
    }

    #[test]
    fn overwrite_keeps_insertion_position() {
        let mut env = EnvironmentMap::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        let names: Vec<&str> = env.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(env.get("A"), Some("3"));
    }

    #[test]
    fn values_are_trimmed_and_unquoted() {
        let mut env = EnvironmentMap::new();
        env.set("A", r#"  "quoted"  "#);
        env.set("B", " plain ");
        assert_eq!(env.get("A"), Some("quoted"));
        assert_eq!(env.get("B"), Some("plain"));
    }

    #[test]
    fn snapshot_wins_over_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = tmp.path().join("env.out");
        std::fs::write(&snapshot, "PORT=9999\nmalformed line\nA=B=C\nNAME=\"srv\"\n").unwrap();

        let defaults = VariableSet::parse(r#"{"variables": {"PORT": {"value": "80"}}}"#);
        let mut env = EnvironmentMap::from_variable_sets(&defaults, &VariableSet::default());
        env.apply_snapshot(&snapshot).unwrap();

        assert_eq!(env.get("PORT"), Some("9999"));
        assert_eq!(env.get("NAME"), Some("srv"));
        // Lines without exactly one '=' are dropped.
        assert_eq!(env.get("A"), None);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn missing_snapshot_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = EnvironmentMap::new();
        env.apply_snapshot(&tmp.path().join("env.out")).unwrap();
        assert!(env.is_empty());
    }
}
