use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default location of the agent config, written by host provisioning.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetd/agent.yaml";

/// Agent configuration, loaded once at startup from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Queue to long-poll for remote commands.
    pub queue_url: String,
    /// Topic that receives script results, heartbeats, and batched logs.
    pub topic_url: String,
    /// Working directory holding the repo checkout, ledger, and metadata.
    pub work_dir: PathBuf,
    /// Server label used to filter manifests (e.g. "servers-nat").
    pub server_name: String,
    /// Instance identity reported in every published envelope.
    pub instance_id: String,
    #[serde(default)]
    pub account_id: String,
    /// Foreground mode: cycle errors are fatal instead of retried.
    #[serde(default)]
    pub debug: bool,
    /// Script output log. Defaults to `<work_dir>/fleetd.log`.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Long-poll wait passed to the queue, in seconds.
    #[serde(default = "default_poll_wait")]
    pub poll_wait_secs: u64,
    /// Minimum spacing between heartbeat events, in seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Command run to upgrade the agent package on an `update` message.
    #[serde(default)]
    pub upgrade_command: Option<String>,
}

fn default_poll_wait() -> u64 {
    20
}

fn default_heartbeat() -> u64 {
    60
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

/// Everything the components need, constructed once at startup and passed
/// by reference. Derived paths all live under the work dir so deleting the
/// work dir (or just the ledger) is the documented reset mechanism.
#[derive(Debug)]
pub struct AgentContext {
    pub config: AgentConfig,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    /// The checked-out appstack repository.
    pub fn repo_dir(&self) -> PathBuf {
        self.config.work_dir.join("repo")
    }

    /// Append-only idempotency ledger. Delete it to re-run bootstrap.
    pub fn ledger_path(&self) -> PathBuf {
        self.config.work_dir.join("bootstrap.lock")
    }

    /// Processed message ids, one JSON object per line.
    pub fn processed_path(&self) -> PathBuf {
        self.config.work_dir.join("processed-messages.jsonl")
    }

    /// Host environment snapshot captured at provision time.
    pub fn snapshot_path(&self) -> PathBuf {
        self.config.work_dir.join("env.out")
    }

    pub fn log_path(&self) -> PathBuf {
        self.config
            .log_file
            .clone()
            .unwrap_or_else(|| self.config.work_dir.join("fleetd.log"))
    }
}
