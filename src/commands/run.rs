use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::config::{AgentConfig, AgentContext, DEFAULT_CONFIG_PATH};
use crate::consumer::{Consumer, PackageUpdater};
use crate::error::ExitError;
use crate::queue::HttpQueue;
use crate::repo::GitFetcher;
use crate::report::HttpReporter;

/// Run the agent: bootstrap if needed, then consume commands forever.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the agent config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Treat any cycle error as fatal instead of retrying.
    #[arg(long)]
    pub debug: bool,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let mut config = AgentConfig::load(&self.config)
            .map_err(|e| ExitError::Config(format!("{e:#}")))?;
        if self.debug {
            config.debug = true;
        }
        std::fs::create_dir_all(&config.work_dir)?;
        let ctx = AgentContext::new(config);

        ctrlc::set_handler(|| {
            eprintln!("interrupted, exiting");
            std::process::exit(0);
        })?;

        info!("agent starting for {}", ctx.config.instance_id);
        let queue = HttpQueue::new(ctx.config.queue_url.clone(), ctx.config.poll_wait_secs);
        let reporter = HttpReporter::new(&ctx.config);
        let updater = PackageUpdater {
            upgrade_command: ctx.config.upgrade_command.clone(),
        };
        let mut consumer = Consumer::new(&ctx, &queue, &reporter, &GitFetcher, &updater);
        consumer.run()
    }
}
