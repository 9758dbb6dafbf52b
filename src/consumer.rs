//! The long-running command consumer.
//!
//! Each cycle verifies bootstrap, drains one queue batch, dispatches fresh
//! messages, flushes buffered logs, and heartbeats. Any cycle error backs
//! off with doubling delays (capped) and retries forever; in debug mode the
//! first error is fatal so operators see it immediately.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{self, Bootstrap};
use crate::config::AgentContext;
use crate::ledger::LockLedger;
use crate::queue::{CommandKind, CommandMessage, CommandQueue, ProcessedMessages, QueueMessage};
use crate::report::{AGENT_VERSION, Reporter};
use crate::repo::RepoFetcher;
use crate::script::ScriptRunner;

pub const BACKOFF_BASE_SECS: u64 = 1;
pub const BACKOFF_MAX_SECS: u64 = 60;

/// Doubling retry delay: 2, 4, 8, ... capped, reset on success.
#[derive(Debug)]
pub struct Backoff {
    current: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_BASE_SECS,
        }
    }

    pub fn next_delay(&mut self) -> u64 {
        self.current = (self.current * 2).min(BACKOFF_MAX_SECS);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_BASE_SECS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// How the agent replaces itself on an `update` command.
pub trait SelfUpdater {
    fn upgrade(&self) -> anyhow::Result<()>;
    /// Re-invoke the current binary with the original arguments. On unix
    /// this does not return on success.
    fn respawn(&self) -> anyhow::Result<()>;
}

/// Runs the configured package upgrade command, then execs the current
/// binary in place.
pub struct PackageUpdater {
    pub upgrade_command: Option<String>,
}

impl SelfUpdater for PackageUpdater {
    fn upgrade(&self) -> anyhow::Result<()> {
        let Some(command) = &self.upgrade_command else {
            info!("no upgrade command configured, respawning as-is");
            return Ok(());
        };
        info!("upgrading: {command}");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .with_context(|| format!("running upgrade command: {command}"))?;
        if !status.success() {
            bail!("upgrade command exited with {status}");
        }
        Ok(())
    }

    fn respawn(&self) -> anyhow::Result<()> {
        let exe = std::env::current_exe().context("locating current executable")?;
        let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
        info!("respawning {}", exe.display());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let err = Command::new(&exe).args(&args).exec();
            Err(err).with_context(|| format!("replacing process with {}", exe.display()))
        }
        #[cfg(not(unix))]
        {
            Command::new(&exe)
                .args(&args)
                .spawn()
                .with_context(|| format!("spawning {}", exe.display()))?;
            std::process::exit(0);
        }
    }
}

pub struct Consumer<'a> {
    ctx: &'a AgentContext,
    queue: &'a dyn CommandQueue,
    reporter: &'a dyn Reporter,
    fetcher: &'a dyn RepoFetcher,
    updater: &'a dyn SelfUpdater,
    ledger: LockLedger,
    processed: ProcessedMessages,
    backoff: Backoff,
    last_heartbeat: Option<Instant>,
}

impl<'a> Consumer<'a> {
    pub fn new(
        ctx: &'a AgentContext,
        queue: &'a dyn CommandQueue,
        reporter: &'a dyn Reporter,
        fetcher: &'a dyn RepoFetcher,
        updater: &'a dyn SelfUpdater,
    ) -> Self {
        Self {
            ctx,
            queue,
            reporter,
            fetcher,
            updater,
            ledger: LockLedger::new(ctx.ledger_path()),
            processed: ProcessedMessages::load(ctx.processed_path()),
            backoff: Backoff::new(),
            last_heartbeat: None,
        }
    }

    /// Run cycles forever. Returns only in debug mode, on the first error.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let online = self.reporter.publish(
            "online",
            serde_json::json!({
                "instance_id": self.ctx.config.instance_id,
                "version": AGENT_VERSION,
            }),
        );
        if let Err(e) = online {
            warn!("online event not delivered: {e:#}");
        }

        loop {
            match self.cycle() {
                Ok(()) => self.backoff.reset(),
                Err(e) => {
                    error!("cycle failed: {e:#}");
                    self.reporter.log(&format!("cycle failed: {e:#}"));
                    if self.ctx.config.debug {
                        return Err(e);
                    }
                    let delay = self.backoff.next_delay();
                    warn!("retrying in {delay}s");
                    std::thread::sleep(Duration::from_secs(delay));
                }
            }
        }
    }

    /// One full pass: bootstrap, drain, flush, heartbeat.
    pub fn cycle(&mut self) -> anyhow::Result<()> {
        let bootstrap = Bootstrap::new(self.ctx, &self.ledger, self.fetcher, self.reporter);
        let operational = bootstrap.ensure_complete()?;

        let batch = self.queue.receive()?;
        if batch.is_empty() {
            debug!("idle poll");
        }
        for message in batch {
            if !self.processed.mark(&message.id)? {
                debug!("already processed {}, dropping", message.id);
                continue;
            }
            debug!(
                "handling {} (delivery handle {:?})",
                message.id, message.delivery_handle
            );
            if let Err(e) = self.dispatch(&message, &operational) {
                warn!("message {} failed: {e:#}", message.id);
                self.reporter
                    .log(&format!("message {} failed: {e:#}", message.id));
            }
        }

        if self.reporter.has_buffered_logs() {
            self.reporter.flush_logs()?;
        }
        self.maybe_heartbeat()?;
        Ok(())
    }

    fn dispatch(&mut self, message: &QueueMessage, operational: &[PathBuf]) -> anyhow::Result<()> {
        let command = CommandMessage::parse(&message.body)?;
        debug!(
            "dispatching {} (command id {:?}, timestamp {:?})",
            message.id, command.id, command.timestamp
        );
        match command.kind() {
            CommandKind::RunCommand => {
                let payload = command
                    .payload
                    .as_deref()
                    .context("run-command without a payload")?;
                self.run_operational_script(payload, operational)
            }
            CommandKind::Update => self.update(),
            CommandKind::Unknown => {
                warn!("ignoring message of unknown type {:?}", command.kind);
                Ok(())
            }
        }
    }

    /// The payload names a script from the published inventory, either by
    /// file name or full path.
    fn run_operational_script(
        &self,
        payload: &str,
        operational: &[PathBuf],
    ) -> anyhow::Result<()> {
        let script = operational
            .iter()
            .find(|p| {
                p.as_path() == Path::new(payload)
                    || p.file_name().is_some_and(|n| n == payload)
            })
            .with_context(|| format!("no operational script named {payload}"))?;

        let env = bootstrap::build_environment(self.ctx)?;
        let runner = ScriptRunner::new(self.ctx.log_path(), self.reporter);
        let outcome = runner.run(script, &env)?;
        if !outcome.success() {
            bail!(
                "{} exited with code {}",
                outcome.script.display(),
                outcome.exit_code
            );
        }
        Ok(())
    }

    /// Persist the processed-message set, upgrade the package, and replace
    /// this process with the new binary.
    fn update(&mut self) -> anyhow::Result<()> {
        info!("update requested");
        self.processed.persist()?;
        self.updater.upgrade()?;
        self.updater.respawn()
    }

    fn maybe_heartbeat(&mut self) -> anyhow::Result<()> {
        let interval = Duration::from_secs(self.ctx.config.heartbeat_secs);
        let due = self
            .last_heartbeat
            .is_none_or(|last| last.elapsed() >= interval);
        if due {
            self.reporter.publish(
                "heartbeat",
                serde_json::json!({ "timestamp": Utc::now().to_rfc3339() }),
            )?;
            self.last_heartbeat = Some(Instant::now());
        }
        Ok(())
    }
}
