//! Capabilities the provisioner and reclaimer need from a hypervisor

use crate::config::schema::Generation;
use crate::vm::firmware::FirmwareSettings;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Power state of a VM, reduced to what the tool acts on
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Off,
    Running,
    /// Saved, paused, starting, stopping, ...
    Other,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Off => write!(f, "Off"),
            PowerState::Running => write!(f, "Running"),
            PowerState::Other => write!(f, "Other"),
        }
    }
}

/// Inventory entry for a VM
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub name: String,
    pub generation: Generation,
    pub state: PowerState,
}

/// Arguments for creating a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVm<'a> {
    pub name: &'a str,
    pub generation: Generation,
    pub memory_bytes: u64,
    /// Switch to connect the default adapter to; `None` leaves it disconnected
    pub switch_name: Option<&'a str>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub count: u32,
    pub expose_virtualization_extensions: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    pub name: String,
    pub switch_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
}

/// An external hypervisor's management interface.
///
/// Every call is synchronous and blocking. Implementations report failures
/// with context naming the operation; callers decide whether a failure is
/// fatal.
pub trait Hypervisor {
    /// Look up a VM by exact name
    fn vm(&self, name: &str) -> Result<Option<VmInfo>>;

    fn vm_exists(&self, name: &str) -> Result<bool> {
        Ok(self.vm(name)?.is_some())
    }

    /// All VMs whose name matches `pattern` (see [`name_matches`])
    fn list_vms(&self, pattern: &str) -> Result<Vec<VmInfo>>;

    fn create_vm(&self, args: &NewVm<'_>) -> Result<()>;
    fn delete_vm(&self, name: &str) -> Result<()>;
    fn start_vm(&self, name: &str) -> Result<()>;
    fn stop_vm(&self, name: &str, force: bool) -> Result<()>;

    fn automatic_checkpoints_enabled(&self, name: &str) -> Result<bool>;
    fn set_automatic_checkpoints(&self, name: &str, enabled: bool) -> Result<()>;

    fn processor(&self, name: &str) -> Result<ProcessorSettings>;
    /// Change the vCPU count and/or virtualization extension passthrough;
    /// `None` leaves a setting untouched.
    fn set_processor(
        &self,
        name: &str,
        count: Option<u32>,
        expose_virtualization_extensions: Option<bool>,
    ) -> Result<()>;

    /// Create a dynamically expanding disk image
    fn create_disk_image(&self, path: &Path, size_bytes: u64) -> Result<()>;
    fn attached_disks(&self, name: &str) -> Result<Vec<PathBuf>>;
    fn attach_disk(&self, name: &str, path: &Path) -> Result<()>;

    /// Whether an external virtual switch with this name exists
    fn switch_exists(&self, switch_name: &str) -> Result<bool>;
    /// The VM's first network adapter, if it has one
    fn network_adapter(&self, name: &str) -> Result<Option<NetworkAdapter>>;
    fn connect_adapter(&self, name: &str, switch_name: &str) -> Result<()>;

    fn firmware(&self, name: &str) -> Result<FirmwareSettings>;
    fn set_firmware(&self, name: &str, settings: &FirmwareSettings) -> Result<()>;

    fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>>;
    fn delete_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()>;
}

/// Case-insensitive name match. A pattern containing `*` is a glob,
/// anything else is a prefix.
pub fn name_matches(name: &str, pattern: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if !pattern.contains('*') {
        return name.starts_with(&pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(p) => p,
        None => return true,
    };
    if !name.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    for (i, part) in rest.iter().enumerate() {
        let last = i == rest.len() - 1;
        if last {
            return name.len() >= pos + part.len() && name.ends_with(part);
        }
        match name[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_is_case_insensitive() {
        assert!(name_matches("PXE-CLIENT-UEFI-A1B", "PXE-CLIENT-"));
        assert!(name_matches("pxe-client-X9Z", "PXE-CLIENT-"));
        assert!(!name_matches("OTHER-VM", "PXE-CLIENT-"));
        assert!(!name_matches("PXE-CLIENT", "PXE-CLIENT-"));
    }

    #[test]
    fn glob_match() {
        assert!(name_matches("PXE-CLIENT-UEFI-A1B", "PXE-*-UEFI-*"));
        assert!(name_matches("PXE-CLIENT-A1B", "*A1B"));
        assert!(name_matches("anything", "*"));
        assert!(!name_matches("PXE-CLIENT-A1B", "PXE-*-UEFI-*"));
        assert!(!name_matches("AB", "A*BB"));
    }
}
