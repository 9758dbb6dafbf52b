//! Remote command intake.
//!
//! The queue hands back batches of opaque messages; each body is a JSON
//! command document. Processed message ids are persisted one JSON object
//! per line so a crash between dispatch and completion never replays a
//! command on restart.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ExitError;

/// One message as delivered by the queue. The delivery handle is carried
/// for diagnostics; dedup by id makes explicit acknowledgement unnecessary
/// under the at-least-once contract.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub delivery_handle: Option<String>,
}

pub trait CommandQueue {
    /// Long-poll for the next batch. An empty batch is a normal idle poll.
    fn receive(&self) -> anyhow::Result<Vec<QueueMessage>>;
}

#[derive(Debug, Deserialize)]
struct QueueBatch {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    body: String,
    #[serde(default, alias = "receipt_handle")]
    delivery_handle: Option<String>,
}

/// Long-polls the configured queue URL over HTTP.
pub struct HttpQueue {
    agent: ureq::Agent,
    queue_url: String,
    wait_secs: u64,
}

impl HttpQueue {
    pub fn new(queue_url: String, wait_secs: u64) -> Self {
        // Leave headroom over the server-side long-poll window.
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(wait_secs + 10)))
            .build()
            .new_agent();
        Self {
            agent,
            queue_url,
            wait_secs,
        }
    }
}

impl CommandQueue for HttpQueue {
    fn receive(&self) -> anyhow::Result<Vec<QueueMessage>> {
        let batch: QueueBatch = self
            .agent
            .get(&self.queue_url)
            .query("wait", self.wait_secs.to_string())
            .call()
            .map_err(|e| ExitError::Queue(format!("{e}")))?
            .into_body()
            .read_json()
            .map_err(|e| ExitError::Queue(format!("decoding batch: {e}")))?;
        debug!("received {} message(s)", batch.messages.len());
        Ok(batch
            .messages
            .into_iter()
            .map(|m| QueueMessage {
                id: m.id,
                body: m.body,
                delivery_handle: m.delivery_handle,
            })
            .collect())
    }
}

/// A parsed command body.
#[derive(Debug, Deserialize)]
pub struct CommandMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    RunCommand,
    Update,
    Unknown,
}

impl CommandMessage {
    pub fn parse(body: &str) -> anyhow::Result<Self> {
        serde_json::from_str(body).context("parsing command body")
    }

    pub fn kind(&self) -> CommandKind {
        match self.kind.to_lowercase().as_str() {
            "runcommand" | "run-command" => CommandKind::RunCommand,
            "update" => CommandKind::Update,
            _ => CommandKind::Unknown,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedRecord {
    id: String,
    first_seen: i64,
}

/// Durable set of already-handled message ids.
#[derive(Debug)]
pub struct ProcessedMessages {
    path: PathBuf,
    seen: HashMap<String, i64>,
}

impl ProcessedMessages {
    /// Load the set from disk. A missing file is an empty set; unparsable
    /// lines are skipped.
    pub fn load(path: PathBuf) -> Self {
        let mut seen = HashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<ProcessedRecord>(line) {
                        Ok(record) => {
                            seen.insert(record.id, record.first_seen);
                        }
                        Err(e) => warn!("skipping bad processed-message line: {e}"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not read {}: {e}", path.display()),
        }
        Self { path, seen }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Mark an id as seen, appending it to disk immediately. Returns false
    /// when the id was already known.
    pub fn mark(&mut self, id: &str) -> anyhow::Result<bool> {
        if self.seen.contains_key(id) {
            return Ok(false);
        }
        let record = ProcessedRecord {
            id: id.to_string(),
            first_seen: Utc::now().timestamp(),
        };
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.flush()?;
        self.seen.insert(record.id, record.first_seen);
        Ok(true)
    }

    /// Rewrite the whole file from the in-memory set. Used before the agent
    /// replaces itself, so the successor starts from a clean, compact file.
    pub fn persist(&self) -> anyhow::Result<()> {
        let mut lines = String::new();
        let mut records: Vec<(&String, &i64)> = self.seen.iter().collect();
        records.sort_by_key(|(_, first_seen)| **first_seen);
        for (id, first_seen) in records {
            let record = ProcessedRecord {
                id: id.clone(),
                first_seen: *first_seen,
            };
            lines.push_str(&serde_json::to_string(&record)?);
            lines.push('\n');
        }
        std::fs::write(&self.path, lines)
            .with_context(|| format!("rewriting {}", self.path.display()))
    }
}
