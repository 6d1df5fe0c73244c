//! Config file loading

use crate::config::schema::{ProvisionRecord, ProvisionerConfig};
use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::path::Path;

/// Load a provisioner config from a JSON file
pub fn load_config(path: &Path) -> Result<ProvisionerConfig> {
    let f = File::open(path).with_context(|| format!("failed to open config {}", path.display()))?;
    let cfg: ProvisionerConfig = serde_json::from_reader(f)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(cfg)
}

/// Load the config file if one was given, otherwise defaults
pub fn load_config_or_default(path: Option<&Path>) -> Result<ProvisionerConfig> {
    match path {
        Some(p) => load_config(p),
        None => Ok(ProvisionerConfig::default()),
    }
}

/// Save a provision record next to other automation output
pub fn save_record(record: &ProvisionRecord, path: &Path) -> Result<()> {
    let f = File::create(path)?;
    serde_json::to_writer_pretty(f, record)?;
    Ok(())
}
