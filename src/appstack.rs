//! Appstack and instance metadata documents.
//!
//! Host provisioning drops these JSON files into the work dir before the
//! agent starts; the agent only reads them. The appstack carries the
//! repository location and default variables, the instance carries the
//! branch/revision pin and instance-specific variable overrides.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const APPSTACK_FILE: &str = "appstack.json";
pub const INSTANCE_FILE: &str = "appstack_instance.json";
pub const INSTANCE_CONFIG_FILE: &str = "appstack_instance_config.json";
pub const DEPLOY_KEY_FILE: &str = "git_key.json";

/// The appstack definition: repository URL plus an embedded JSON document
/// holding default variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Appstack {
    #[serde(alias = "gitUrl")]
    pub git_url: String,
    /// Embedded JSON text of the default [`VariableSet`].
    #[serde(default)]
    pub config: String,
}

/// One deployment of an appstack: the revision pin for the checkout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Instance-specific variable overrides, embedded as JSON text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub document: String,
}

/// Credential material for the repository fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployKey {
    #[serde(alias = "keyMaterial")]
    pub key_material: String,
}

fn load_json<T: serde::de::DeserializeOwned>(work_dir: &Path, name: &str) -> anyhow::Result<T> {
    let path = work_dir.join(name);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading metadata {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing metadata {}", path.display()))
}

impl Appstack {
    pub fn load(work_dir: &Path) -> anyhow::Result<Self> {
        load_json(work_dir, APPSTACK_FILE)
    }
}

impl Instance {
    pub fn load(work_dir: &Path) -> anyhow::Result<Self> {
        load_json(work_dir, INSTANCE_FILE)
    }
}

impl InstanceConfig {
    pub fn load(work_dir: &Path) -> anyhow::Result<Self> {
        load_json(work_dir, INSTANCE_CONFIG_FILE)
    }
}

impl DeployKey {
    pub fn load(work_dir: &Path) -> anyhow::Result<Self> {
        load_json(work_dir, DEPLOY_KEY_FILE)
    }
}

/// A `{"variables": {NAME: {value, default}}}` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableSet {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl VariableSet {
    /// Parse an embedded variables document. An empty or malformed document
    /// contributes no variables.
    pub fn parse(document: &str) -> Self {
        if document.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(document) {
            Ok(set) => set,
            Err(e) => {
                warn!("ignoring malformed variables document: {e}");
                Self::default()
            }
        }
    }
}

impl VariableSpec {
    /// Explicit value wins over the default; a missing pair resolves empty.
    pub fn resolved(&self) -> String {
        let chosen = match &self.value {
            Some(v) if !v.is_null() => Some(v),
            _ => self.default.as_ref().filter(|v| !v.is_null()),
        };
        match chosen {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}
