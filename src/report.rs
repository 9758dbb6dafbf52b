//! Outbound reporting.
//!
//! Every event leaves the agent wrapped in the same envelope: instance
//! identity, agent version, account, and a typed body. Log lines are
//! buffered in memory and shipped as a single `logs` event per flush so a
//! chatty script cannot turn into one HTTP request per line.

use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::config::AgentConfig;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub instance_id: String,
    pub agent_version: String,
    pub account_id: String,
    pub body: EventBody,
}

#[derive(Debug, Serialize)]
pub struct EventBody {
    pub timestamp: String,
    pub message_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub text: String,
    pub date: i64,
}

pub trait Reporter {
    /// Publish one enveloped event.
    fn publish(&self, message_type: &str, data: serde_json::Value) -> anyhow::Result<()>;

    /// Buffer a log line for the next flush.
    fn log(&self, text: &str);

    fn has_buffered_logs(&self) -> bool;

    /// Ship buffered log lines as one `logs` event. The buffer is only
    /// cleared when publishing succeeds.
    fn flush_logs(&self) -> anyhow::Result<()>;
}

/// Posts envelopes to the configured topic URL.
pub struct HttpReporter {
    agent: ureq::Agent,
    topic_url: String,
    instance_id: String,
    account_id: String,
    buffer: Mutex<Vec<LogEntry>>,
}

impl HttpReporter {
    pub fn new(config: &AgentConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(30)))
            .build()
            .new_agent();
        Self {
            agent,
            topic_url: config.topic_url.clone(),
            instance_id: config.instance_id.clone(),
            account_id: config.account_id.clone(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn envelope(&self, message_type: &str, data: serde_json::Value) -> Envelope {
        Envelope {
            instance_id: self.instance_id.clone(),
            agent_version: AGENT_VERSION.to_string(),
            account_id: self.account_id.clone(),
            body: EventBody {
                timestamp: Utc::now().to_rfc3339(),
                message_type: message_type.to_string(),
                data,
            },
        }
    }
}

impl Reporter for HttpReporter {
    fn publish(&self, message_type: &str, data: serde_json::Value) -> anyhow::Result<()> {
        let envelope = self.envelope(message_type, data);
        self.agent
            .post(&self.topic_url)
            .send_json(&envelope)
            .with_context(|| format!("publishing {message_type} to {}", self.topic_url))?;
        debug!("published {message_type}");
        Ok(())
    }

    fn log(&self, text: &str) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.push(LogEntry {
            text: text.to_string(),
            date: Utc::now().timestamp(),
        });
    }

    fn has_buffered_logs(&self) -> bool {
        match self.buffer.lock() {
            Ok(buffer) => !buffer.is_empty(),
            Err(poisoned) => !poisoned.into_inner().is_empty(),
        }
    }

    fn flush_logs(&self) -> anyhow::Result<()> {
        let entries: Vec<LogEntry> = {
            let buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.clone()
        };
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        self.publish("logs", serde_json::json!({ "entries": entries }))?;
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.drain(..count);
        Ok(())
    }
}
