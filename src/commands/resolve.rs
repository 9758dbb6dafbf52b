use std::path::PathBuf;

use clap::Args;

use crate::precedence;

/// Walk a configuration tree and print matching files in precedence order.
#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Root of the tree to walk.
    #[arg(long)]
    pub root: PathBuf,

    /// Substring the full path must contain (case-insensitive).
    #[arg(long, default_value = "")]
    pub pattern: String,

    /// Additional substring filter, typically a server label.
    #[arg(long, default_value = "")]
    pub label: String,

    /// Materialize overrides layers instead of looking files up.
    #[arg(long)]
    pub apply_overrides: bool,
}

impl ResolveArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let matches = if self.apply_overrides {
            precedence::apply_overrides(&self.root, &self.pattern, &self.label)?
        } else {
            precedence::resolve(&self.root, &self.pattern, &self.label)?
        };
        for path in matches {
            println!("{}", path.display());
        }
        Ok(())
    }
}
