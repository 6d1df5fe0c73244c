//! UEFI firmware settings and boot order

use crate::config::schema::{BootOrder, SecureBoot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One entry in the UEFI boot order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootDevice {
    HardDisk { path: PathBuf },
    NetworkAdapter { name: String },
    /// Anything else the firmware lists (DVD, file entries, ...)
    Other { description: String },
}

impl BootDevice {
    /// Same device, comparing disk paths case-insensitively
    pub fn matches(&self, other: &BootDevice) -> bool {
        match (self, other) {
            (BootDevice::HardDisk { path: a }, BootDevice::HardDisk { path: b }) => {
                same_disk_path(a, b)
            }
            (BootDevice::NetworkAdapter { name: a }, BootDevice::NetworkAdapter { name: b }) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }
}

/// Firmware configuration as observed on, or desired for, a UEFI VM
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSettings {
    pub secure_boot: SecureBoot,
    pub boot_order: Vec<BootDevice>,
}

impl FirmwareSettings {
    /// Desired firmware for a PXE client: the adapter and the disk, in `order`
    pub fn pxe(secure_boot: SecureBoot, order: BootOrder, disk: &Path, adapter: &str) -> Self {
        let disk = BootDevice::HardDisk {
            path: disk.to_path_buf(),
        };
        let nic = BootDevice::NetworkAdapter {
            name: adapter.to_string(),
        };
        let boot_order = match order {
            BootOrder::NetworkFirst => vec![nic, disk],
            BootOrder::DiskFirst => vec![disk, nic],
        };
        Self {
            secure_boot,
            boot_order,
        }
    }

    /// True when `self` already has `desired`'s Secure Boot setting and its
    /// boot order starts with `desired`'s entries.
    pub fn satisfies(&self, desired: &FirmwareSettings) -> bool {
        self.secure_boot == desired.secure_boot
            && self.boot_order.len() >= desired.boot_order.len()
            && self
                .boot_order
                .iter()
                .zip(&desired.boot_order)
                .all(|(have, want)| have.matches(want))
    }
}

/// Hyper-V treats disk paths case-insensitively
pub fn same_disk_path(a: &Path, b: &Path) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(&b.to_string_lossy())
}
