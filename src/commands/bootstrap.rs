use std::path::PathBuf;

use clap::Args;

use crate::bootstrap::Bootstrap;
use crate::config::{AgentConfig, AgentContext, DEFAULT_CONFIG_PATH};
use crate::error::ExitError;
use crate::ledger::LockLedger;
use crate::repo::GitFetcher;
use crate::report::HttpReporter;

/// Bring the host to the bootstrapped state, then exit.
#[derive(Debug, Args)]
pub struct BootstrapArgs {
    /// Path to the agent config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl BootstrapArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let config = AgentConfig::load(&self.config)
            .map_err(|e| ExitError::Config(format!("{e:#}")))?;
        std::fs::create_dir_all(&config.work_dir)?;
        let ctx = AgentContext::new(config);

        let ledger = LockLedger::new(ctx.ledger_path());
        let reporter = HttpReporter::new(&ctx.config);
        let bootstrap = Bootstrap::new(&ctx, &ledger, &GitFetcher, &reporter);
        let operational = bootstrap.ensure_complete()?;

        println!(
            "bootstrap complete, {} operational script(s) available",
            operational.len()
        );
        Ok(())
    }
}
