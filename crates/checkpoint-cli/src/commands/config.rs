//! Configuration inspection command

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use checkpoint_core::CheckpointConfig;

/// Print or validate checkpoint configuration
#[derive(Debug)]
pub struct ConfigCommand {
    pub print_default: bool,
    pub check: Option<PathBuf>,
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        if let Some(path) = &self.check {
            let config = CheckpointConfig::from_toml_file(path)
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            print!("{}", config.to_toml_string()?);
            return Ok(());
        }

        if self.print_default {
            print!("{}", CheckpointConfig::default().to_toml_string()?);
            return Ok(());
        }

        bail!("nothing to do; pass --print-default or --check FILE")
    }
}
