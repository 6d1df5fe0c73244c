//! Shell completions and man page

use crate::cli::commands::Cli;
use crate::Result;
use anyhow::{anyhow, Context};
use clap::CommandFactory;
use clap_complete::{generate, Shell};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

const BIN: &str = "pxevm";

/// Write completions for `shell` to stdout
pub fn print_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN, &mut io::stdout());
}

fn fish_completions_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| anyhow!("could not find a config directory"))?;
    Ok(config_dir.join("fish").join("completions"))
}

/// Install Fish completions into the user's fish config
pub fn install_fish_completions() -> Result<PathBuf> {
    let dir = fish_completions_dir()?;
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let path = dir.join(format!("{BIN}.fish"));
    let mut file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    generate(Shell::Fish, &mut Cli::command(), BIN, &mut file);
    Ok(path)
}

/// Render the man page to stdout
pub fn generate_man_page() -> Result<()> {
    let mut out = io::stdout().lock();
    clap_mangen::Man::new(Cli::command()).render(&mut out)?;
    out.flush()?;
    Ok(())
}
