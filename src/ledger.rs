//! Append-only idempotency ledger.
//!
//! One line per completed step: a repo URL once fetched, a script path once
//! it exits zero, and the two sentinels. Re-running the agent consults the
//! ledger and skips anything already recorded; deleting the file re-runs
//! bootstrap from scratch.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

/// Written once every boot script has succeeded.
pub const BOOTSTRAP_COMPLETE: &str = "BOOTSTRAP_COMPLETE";
/// Written once the operational-script inventory has been published.
pub const OP_SCRIPTS_SENT: &str = "OP_SCRIPTS_SENT";

#[derive(Debug)]
pub struct LockLedger {
    path: PathBuf,
}

impl LockLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Whether `entry` was recorded as a whole line. A missing ledger file
    /// is an empty ledger.
    pub fn contains(&self, entry: &str) -> anyhow::Result<bool> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading ledger {}", self.path.display()));
            }
        };
        Ok(content.lines().any(|line| line == entry))
    }

    /// Append `entry` as its own line, creating the ledger if needed.
    pub fn record(&self, entry: &str) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("opening ledger {}", self.path.display()))?;
        writeln!(file, "{entry}")
            .with_context(|| format!("appending to ledger {}", self.path.display()))?;
        file.flush()?;
        debug!("ledger: recorded {entry}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = LockLedger::new(tmp.path().join("bootstrap.lock"));
        assert!(!ledger.contains(BOOTSTRAP_COMPLETE).unwrap());
    }

    #[test]
    fn record_then_contains() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = LockLedger::new(tmp.path().join("bootstrap.lock"));
        ledger.record("git@example:app.git").unwrap();
        ledger.record(BOOTSTRAP_COMPLETE).unwrap();
        assert!(ledger.contains("git@example:app.git").unwrap());
        assert!(ledger.contains(BOOTSTRAP_COMPLETE).unwrap());
        assert!(!ledger.contains(OP_SCRIPTS_SENT).unwrap());
    }

    #[test]
    fn matching_is_whole_line() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = LockLedger::new(tmp.path().join("bootstrap.lock"));
        ledger.record("/repo/boot-scripts/install.sh").unwrap();
        assert!(!ledger.contains("install.sh").unwrap());
        assert!(!ledger.contains("/repo/boot-scripts/install").unwrap());
        assert!(ledger.contains("/repo/boot-scripts/install.sh").unwrap());
    }

    #[test]
    fn entries_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bootstrap.lock");
        LockLedger::new(path.clone()).record("step-1").unwrap();
        assert!(LockLedger::new(path).contains("step-1").unwrap());
    }
}
