//! Sweep matching VMs and the disks they own.
//!
//! Each VM is handled independently: a failure is recorded on that VM's
//! report and the sweep continues. Disk files are only deleted when they
//! live inside the storage root. Re-running a sweep on the same pattern is
//! safe.

use crate::utils::paths::{dir_is_empty, is_within};
use crate::vm::hypervisor::{Hypervisor, PowerState, VmInfo};
use crate::Result;
use anyhow::{bail, Context};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiskDisposition {
    Deleted,
    /// Outside the storage root; left in place
    Protected,
    /// Already gone from storage
    Missing,
    Failed(String),
}

#[derive(Serialize, Debug, Clone)]
pub struct DiskReport {
    pub path: PathBuf,
    pub disposition: DiskDisposition,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ReclaimedVm {
    pub name: String,
    pub stopped: bool,
    pub snapshots_removed: usize,
    pub deleted: bool,
    pub disks: Vec<DiskReport>,
    pub errors: Vec<String>,
}

impl ReclaimedVm {
    fn error(&mut self, what: &str, e: anyhow::Error) {
        warn!(vm = %self.name, "{what}: {e:#}");
        self.errors.push(format!("{what}: {e:#}"));
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ReclaimReport {
    pub pattern: String,
    pub vms: Vec<ReclaimedVm>,
    pub storage_root_removed: bool,
}

impl ReclaimReport {
    pub fn protected_disks(&self) -> impl Iterator<Item = &Path> {
        self.vms
            .iter()
            .flat_map(|vm| &vm.disks)
            .filter(|d| d.disposition == DiskDisposition::Protected)
            .map(|d| d.path.as_path())
    }

    pub fn has_errors(&self) -> bool {
        self.vms.iter().any(|vm| !vm.errors.is_empty())
    }
}

/// Reject patterns with no literal name characters, since they select the
/// whole inventory
pub fn check_pattern(pattern: &str) -> Result<()> {
    if pattern.chars().all(|c| c == '*' || c.is_whitespace()) {
        bail!("refusing to reclaim with pattern '{pattern}': it would match every VM");
    }
    Ok(())
}

pub struct Reclaimer<'a> {
    hv: &'a dyn Hypervisor,
    storage_root: PathBuf,
}

impl<'a> Reclaimer<'a> {
    pub fn new(hv: &'a dyn Hypervisor, storage_root: &Path) -> Self {
        Self {
            hv,
            storage_root: storage_root.to_path_buf(),
        }
    }

    /// Remove every VM matching `pattern`, then the storage root if empty.
    ///
    /// Fails when the pattern would match every VM, or when the inventory
    /// cannot be listed.
    pub fn reclaim(&self, pattern: &str) -> Result<ReclaimReport> {
        check_pattern(pattern)?;
        let vms = self
            .hv
            .list_vms(pattern)
            .with_context(|| format!("failed to list VMs matching '{pattern}'"))?;
        info!(pattern, count = vms.len(), "reclaiming VMs");

        let mut report = ReclaimReport {
            pattern: pattern.to_string(),
            vms: vms.iter().map(|vm| self.reclaim_vm(vm)).collect(),
            storage_root_removed: false,
        };
        report.storage_root_removed = self.remove_storage_root_if_empty();
        Ok(report)
    }

    fn reclaim_vm(&self, vm: &VmInfo) -> ReclaimedVm {
        let name = vm.name.as_str();
        let mut out = ReclaimedVm {
            name: name.to_string(),
            ..Default::default()
        };

        if vm.state != PowerState::Off {
            match self.hv.stop_vm(name, true) {
                Ok(()) => {
                    info!(vm = name, "turned off");
                    out.stopped = true;
                }
                Err(e) => out.error("stop failed", e),
            }
        }

        match self.hv.snapshots(name) {
            Ok(snapshots) => {
                for snap in &snapshots {
                    match self.hv.delete_snapshot(name, snap) {
                        Ok(()) => out.snapshots_removed += 1,
                        Err(e) => out.error(&format!("removing snapshot '{}' failed", snap.name), e),
                    }
                }
            }
            Err(e) => out.error("listing snapshots failed", e),
        }

        // attachment info disappears with the VM, so read it first
        let disks = match self.hv.attached_disks(name) {
            Ok(disks) => disks,
            Err(e) => {
                out.error("listing disks failed", e);
                Vec::new()
            }
        };

        match self.hv.delete_vm(name) {
            Ok(()) => {
                info!(vm = name, "deleted");
                out.deleted = true;
            }
            Err(e) => out.error("delete failed", e),
        }

        out.disks = disks
            .into_iter()
            .map(|path| {
                let disposition = self.remove_disk(name, &path);
                DiskReport { path, disposition }
            })
            .collect();
        out
    }

    fn remove_disk(&self, vm: &str, path: &Path) -> DiskDisposition {
        if !path.exists() {
            return DiskDisposition::Missing;
        }
        if !is_within(path, &self.storage_root) {
            warn!(vm, path = %path.display(), "disk is outside the storage root; leaving it");
            return DiskDisposition::Protected;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                info!(vm, path = %path.display(), "deleted disk");
                DiskDisposition::Deleted
            }
            Err(e) => {
                warn!(vm, path = %path.display(), "failed to delete disk: {e}");
                DiskDisposition::Failed(e.to_string())
            }
        }
    }

    fn remove_storage_root_if_empty(&self) -> bool {
        let root = &self.storage_root;
        if !root.is_dir() {
            return false;
        }
        match dir_is_empty(root) {
            Ok(true) => match fs::remove_dir(root) {
                Ok(()) => {
                    info!(path = %root.display(), "removed empty storage root");
                    true
                }
                Err(e) => {
                    warn!(path = %root.display(), "failed to remove storage root: {e}");
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                warn!(path = %root.display(), "failed to read storage root: {e}");
                false
            }
        }
    }
}
