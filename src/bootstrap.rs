//! Bootstrap orchestration.
//!
//! Drives a host from bare metadata to a fully bootstrapped appstack:
//! fetch the repo, materialize override layers, announce the operational
//! script inventory, then run every boot script exactly once. Each step is
//! guarded by the ledger, so the whole sequence is safe to re-enter after a
//! crash or a failed script.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::appstack::{Appstack, DeployKey, Instance, InstanceConfig, VariableSet};
use crate::config::AgentContext;
use crate::environment::EnvironmentMap;
use crate::error::ExitError;
use crate::ledger::{BOOTSTRAP_COMPLETE, LockLedger, OP_SCRIPTS_SENT};
use crate::precedence;
use crate::report::Reporter;
use crate::repo::{CheckoutSpec, RepoFetcher};
use crate::script::ScriptRunner;

pub const BOOT_PATTERN: &str = "boot-scripts/order.yaml";
pub const OPERATIONAL_PATTERN: &str = "operational-scripts/order.yaml";
/// Label retried when the server label matches no boot manifest.
pub const FALLBACK_LABEL: &str = "repo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    Fetching,
    MergingOverrides,
    RunningScripts,
    Complete,
}

pub struct Bootstrap<'a> {
    ctx: &'a AgentContext,
    ledger: &'a LockLedger,
    fetcher: &'a dyn RepoFetcher,
    reporter: &'a dyn Reporter,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        ctx: &'a AgentContext,
        ledger: &'a LockLedger,
        fetcher: &'a dyn RepoFetcher,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            ctx,
            ledger,
            fetcher,
            reporter,
        }
    }

    /// Bring the host to the bootstrapped state if it is not there already,
    /// and return the operational scripts discovered in the checkout.
    pub fn ensure_complete(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.ledger.contains(BOOTSTRAP_COMPLETE)? {
            let mut state = BootstrapState::NotStarted;
            while state != BootstrapState::Complete {
                state = self.advance(state)?;
            }
        }
        self.operational_scripts()
    }

    fn advance(&self, state: BootstrapState) -> anyhow::Result<BootstrapState> {
        match state {
            BootstrapState::NotStarted => Ok(BootstrapState::Fetching),
            BootstrapState::Fetching => {
                self.fetch()?;
                Ok(BootstrapState::MergingOverrides)
            }
            BootstrapState::MergingOverrides => {
                let copied = precedence::apply_overrides(&self.ctx.repo_dir(), "", "")?;
                info!("applied {} override file(s)", copied.len());
                self.announce_operational_scripts()?;
                Ok(BootstrapState::RunningScripts)
            }
            BootstrapState::RunningScripts => {
                self.run_boot_scripts()?;
                self.ledger.record(BOOTSTRAP_COMPLETE)?;
                info!("bootstrap complete");
                Ok(BootstrapState::Complete)
            }
            BootstrapState::Complete => Ok(BootstrapState::Complete),
        }
    }

    fn fetch(&self) -> anyhow::Result<()> {
        let work_dir = self.ctx.work_dir();
        let appstack = Appstack::load(work_dir)?;
        let url = appstack.git_url.trim().to_string();
        if self.ledger.contains(&url)? {
            info!("repo already fetched, skipping clone");
            return Ok(());
        }

        let instance = Instance::load(work_dir).unwrap_or_default();
        let key_material = DeployKey::load(work_dir).ok().map(|k| k.key_material);
        let spec = CheckoutSpec {
            url: url.clone(),
            branch: instance.branch,
            revision: instance.revision,
            key_material,
        };
        self.fetcher.fetch(&spec, work_dir).map_err(|e| {
            ExitError::Fetch {
                url: url.clone(),
                message: format!("{e:#}"),
            }
        })?;
        self.ledger.record(&url)?;
        Ok(())
    }

    /// Boot manifests for the configured server label, retrying with the
    /// generic label when the specific one matches nothing.
    fn boot_manifests(&self) -> anyhow::Result<Vec<PathBuf>> {
        let repo_dir = self.ctx.repo_dir();
        let label = &self.ctx.config.server_name;
        let found = precedence::resolve(&repo_dir, BOOT_PATTERN, label)?;
        if found.is_empty() && label != FALLBACK_LABEL {
            info!("no boot manifests for {label}, falling back to {FALLBACK_LABEL}");
            return precedence::resolve(&repo_dir, BOOT_PATTERN, FALLBACK_LABEL);
        }
        Ok(found)
    }

    /// Operational scripts named by the checkout, in precedence order.
    pub fn operational_scripts(&self) -> anyhow::Result<Vec<PathBuf>> {
        let manifests = precedence::resolve(
            &self.ctx.repo_dir(),
            OPERATIONAL_PATTERN,
            &self.ctx.config.server_name,
        )?;
        Ok(manifests
            .iter()
            .flat_map(|m| crate::manifest::scripts(m))
            .collect())
    }

    /// Publish the operational-script inventory, at most once per host.
    fn announce_operational_scripts(&self) -> anyhow::Result<()> {
        if self.ledger.contains(OP_SCRIPTS_SENT)? {
            return Ok(());
        }
        let scripts = self.operational_scripts()?;
        let names: Vec<String> = scripts
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        self.reporter
            .publish("operational-scripts", serde_json::json!({ "scripts": names }))?;
        self.ledger.record(OP_SCRIPTS_SENT)?;
        Ok(())
    }

    fn run_boot_scripts(&self) -> anyhow::Result<()> {
        let env = build_environment(self.ctx)?;
        let runner = ScriptRunner::new(self.ctx.log_path(), self.reporter);
        let mut failed = 0;
        let mut total = 0;

        for manifest in self.boot_manifests()? {
            for script in crate::manifest::scripts(&manifest) {
                total += 1;
                let entry = script.to_string_lossy().into_owned();
                if self.ledger.contains(&entry)? {
                    info!("already ran {entry}, skipping");
                    continue;
                }
                match runner.run(&script, &env) {
                    Ok(outcome) if outcome.success() => self.ledger.record(&entry)?,
                    Ok(outcome) => {
                        failed += 1;
                        warn!("{entry} exited with code {}", outcome.exit_code);
                    }
                    Err(e) => {
                        failed += 1;
                        warn!("{entry} could not run: {e:#}");
                    }
                }
            }
        }

        if failed > 0 {
            return Err(ExitError::ScriptsFailed { failed, total }.into());
        }
        Ok(())
    }
}

/// Assemble the script environment: appstack defaults, then instance
/// overrides, then the host snapshot.
pub fn build_environment(ctx: &AgentContext) -> anyhow::Result<EnvironmentMap> {
    let work_dir = ctx.work_dir();
    let appstack = Appstack::load(work_dir).context("loading appstack metadata")?;
    let defaults = VariableSet::parse(&appstack.config);
    let instance = match InstanceConfig::load(work_dir) {
        Ok(config) => VariableSet::parse(&config.document),
        Err(_) => VariableSet::default(),
    };
    let mut env = EnvironmentMap::from_variable_sets(&defaults, &instance);
    env.apply_snapshot(&ctx.snapshot_path())?;
    if env.is_empty() {
        debug!("script environment is empty");
    } else {
        debug!("script environment carries {} variable(s)", env.len());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;

    use crate::config::AgentConfig;
    use crate::report::testing::MemoryReporter;

    /// Writes a canned tree into `<work_dir>/repo` instead of cloning.
    struct FakeFetcher {
        files: Vec<(String, String)>,
        calls: RefCell<usize>,
    }

    impl FakeFetcher {
        fn new(files: Vec<(String, String)>) -> Self {
            Self {
                files,
                calls: RefCell::new(0),
            }
        }
    }

    impl RepoFetcher for FakeFetcher {
        fn fetch(&self, _spec: &CheckoutSpec, work_dir: &Path) -> anyhow::Result<PathBuf> {
            *self.calls.borrow_mut() += 1;
            let repo_dir = work_dir.join("repo");
            for (rel, content) in &self.files {
                let path = repo_dir.join(rel);
                std::fs::create_dir_all(path.parent().unwrap())?;
                std::fs::write(path, content)?;
            }
            Ok(repo_dir)
        }
    }

    fn test_ctx(work_dir: &Path, server_name: &str) -> AgentContext {
        AgentContext::new(AgentConfig {
            queue_url: "http://localhost/queue".into(),
            topic_url: "http://localhost/topic".into(),
            work_dir: work_dir.to_path_buf(),
            server_name: server_name.into(),
            instance_id: "i-test".into(),
            account_id: String::new(),
            debug: false,
            log_file: None,
            poll_wait_secs: 20,
            heartbeat_secs: 60,
            upgrade_command: None,
        })
    }

    fn write_metadata(work_dir: &Path) {
        std::fs::write(
            work_dir.join("appstack.json"),
            r#"{"git_url": "git@example:app.git", "config": ""}"#,
        )
        .unwrap();
        std::fs::write(work_dir.join("appstack_instance.json"), "{}").unwrap();
    }

    fn script_body(marker: &str, exit: i32) -> String {
        format!("#!/bin/sh\necho {marker}\nexit {exit}\n")
    }

    fn vpn_fixture() -> Vec<(String, String)> {
        vec![
            (
                "stack-servers-vpn/boot-scripts/order.yaml".into(),
                "script-order:\n  - setup.sh\n".into(),
            ),
            (
                "stack-servers-vpn/boot-scripts/setup.sh".into(),
                script_body("setup", 0),
            ),
            (
                "stack-servers-vpn/operational-scripts/order.yaml".into(),
                "script-order:\n  - rotate.sh\n".into(),
            ),
            (
                "stack-servers-vpn/operational-scripts/rotate.sh".into(),
                script_body("rotate", 0),
            ),
        ]
    }

    #[test]
    fn full_bootstrap_runs_once_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path());
        let ctx = test_ctx(tmp.path(), "servers-vpn");
        let ledger = LockLedger::new(ctx.ledger_path());
        let fetcher = FakeFetcher::new(vpn_fixture());
        let reporter = MemoryReporter::default();

        let bootstrap = Bootstrap::new(&ctx, &ledger, &fetcher, &reporter);
        let operational = bootstrap.ensure_complete().unwrap();
        assert_eq!(operational.len(), 1);
        assert!(ledger.contains(BOOTSTRAP_COMPLETE).unwrap());
        assert!(ledger.contains("git@example:app.git").unwrap());
        assert_eq!(reporter.events_of("script-result").len(), 1);
        assert_eq!(reporter.events_of("operational-scripts").len(), 1);

        // Second pass: nothing fetched, nothing re-run, inventory not
        // re-published.
        let operational = bootstrap.ensure_complete().unwrap();
        assert_eq!(operational.len(), 1);
        assert_eq!(*fetcher.calls.borrow(), 1);
        assert_eq!(reporter.events_of("script-result").len(), 1);
        assert_eq!(reporter.events_of("operational-scripts").len(), 1);
    }

    #[test]
    fn failed_script_blocks_completion_and_only_it_reruns() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path());
        let ctx = test_ctx(tmp.path(), "servers-vpn");
        let ledger = LockLedger::new(ctx.ledger_path());
        let mut files = vpn_fixture();
        files[0].1 = "script-order:\n  - setup.sh\n  - broken.sh\n  - last.sh\n".into();
        files.push((
            "stack-servers-vpn/boot-scripts/broken.sh".into(),
            script_body("broken", 1),
        ));
        files.push((
            "stack-servers-vpn/boot-scripts/last.sh".into(),
            script_body("last", 0),
        ));
        let fetcher = FakeFetcher::new(files);
        let reporter = MemoryReporter::default();
        let bootstrap = Bootstrap::new(&ctx, &ledger, &fetcher, &reporter);

        let err = bootstrap.ensure_complete().unwrap_err();
        let exit = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(
            exit,
            ExitError::ScriptsFailed { failed: 1, total: 3 }
        ));
        // Siblings after the failure still ran.
        assert_eq!(reporter.events_of("script-result").len(), 3);
        assert!(!ledger.contains(BOOTSTRAP_COMPLETE).unwrap());

        // Repair the script; only it runs on the next pass.
        std::fs::write(
            ctx.repo_dir()
                .join("stack-servers-vpn/boot-scripts/broken.sh"),
            script_body("fixed", 0),
        )
        .unwrap();
        bootstrap.ensure_complete().unwrap();
        assert_eq!(reporter.events_of("script-result").len(), 4);
        assert!(ledger.contains(BOOTSTRAP_COMPLETE).unwrap());
    }

    #[test]
    fn label_falls_back_to_repo_when_nothing_matches() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path());
        let ctx = test_ctx(tmp.path(), "servers-db");
        let ledger = LockLedger::new(ctx.ledger_path());
        let fetcher = FakeFetcher::new(vec![
            (
                "repo-common/boot-scripts/order.yaml".into(),
                "script-order:\n  - base.sh\n".into(),
            ),
            (
                "repo-common/boot-scripts/base.sh".into(),
                script_body("base", 0),
            ),
        ]);
        let reporter = MemoryReporter::default();
        let bootstrap = Bootstrap::new(&ctx, &ledger, &fetcher, &reporter);

        bootstrap.ensure_complete().unwrap();
        assert_eq!(reporter.events_of("script-result").len(), 1);
        assert!(ledger.contains(BOOTSTRAP_COMPLETE).unwrap());
    }

    #[test]
    fn overrides_are_applied_before_scripts_run() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path());
        let ctx = test_ctx(tmp.path(), "servers-vpn");
        let ledger = LockLedger::new(ctx.ledger_path());
        let mut files = vpn_fixture();
        // The override replaces setup.sh with a version printing a marker.
        files.push((
            "overrides/stack-servers-vpn/boot-scripts/setup.sh".into(),
            script_body("overridden", 0),
        ));
        let fetcher = FakeFetcher::new(files);
        let reporter = MemoryReporter::default();
        let bootstrap = Bootstrap::new(&ctx, &ledger, &fetcher, &reporter);

        bootstrap.ensure_complete().unwrap();
        let log = std::fs::read_to_string(ctx.log_path()).unwrap();
        assert!(log.contains("overridden"));
        assert!(!log.contains("\nsetup\n"));
    }

    #[test]
    fn fetch_failure_reports_exit_code_and_retries() {
        struct BrokenFetcher;
        impl RepoFetcher for BrokenFetcher {
            fn fetch(&self, _: &CheckoutSpec, _: &Path) -> anyhow::Result<PathBuf> {
                anyhow::bail!("network down")
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path());
        let ctx = test_ctx(tmp.path(), "servers-vpn");
        let ledger = LockLedger::new(ctx.ledger_path());
        let reporter = MemoryReporter::default();
        let bootstrap = Bootstrap::new(&ctx, &ledger, &BrokenFetcher, &reporter);

        let err = bootstrap.ensure_complete().unwrap_err();
        let exit = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit, ExitError::Fetch { .. }));
        // URL was not recorded, so the next pass clones again.
        assert!(!ledger.contains("git@example:app.git").unwrap());
    }

    #[test]
    fn environment_layers_defaults_instance_and_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("appstack.json"),
            r#"{"git_url": "u", "config": "{\"variables\": {\"PORT\": {\"value\": \"80\"}, \"REGION\": {\"default\": \"east\"}}}"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("appstack_instance_config.json"),
            r#"{"document": "{\"variables\": {\"PORT\": {\"value\": \"8080\"}}}"}"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("env.out"), "REGION=west\n").unwrap();

        let ctx = test_ctx(tmp.path(), "servers-vpn");
        let env = build_environment(&ctx).unwrap();
        assert_eq!(env.get("PORT"), Some("8080"));
        assert_eq!(env.get("REGION"), Some("west"));
    }
}
