//! System utility functions

use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// Get current UTC timestamp in RFC3339 format
pub fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Locate a PowerShell executable, preferring PowerShell 7
pub fn pick_powershell() -> Result<PathBuf> {
    for candidate in ["pwsh", "pwsh.exe", "powershell.exe", "powershell"] {
        if let Ok(p) = which::which(candidate) {
            return Ok(p);
        }
    }
    Err(anyhow!(
        "PowerShell not found on PATH (tried pwsh and powershell.exe); the Hyper-V backend needs it"
    ))
}
