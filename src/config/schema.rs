//! Provisioning configuration schema definitions

use crate::error::PxeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const GIB: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_BASE_PREFIX: &str = "PXE-CLIENT";
pub const DEFAULT_SWITCH: &str = "PXENetwork";

/// Secure Boot setting for UEFI guests
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SecureBoot {
    On,
    Off,
}

impl std::fmt::Display for SecureBoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecureBoot::On => write!(f, "On"),
            SecureBoot::Off => write!(f, "Off"),
        }
    }
}

/// Firmware class, fixed when the VM is created.
///
/// Generation 1 boots legacy BIOS, generation 2 boots UEFI.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum Generation {
    One,
    Two,
}

impl Generation {
    pub fn for_uefi(uefi_mode: bool) -> Self {
        if uefi_mode {
            Generation::Two
        } else {
            Generation::One
        }
    }

    pub fn is_uefi(self) -> bool {
        self == Generation::Two
    }
}

impl From<Generation> for u8 {
    fn from(g: Generation) -> u8 {
        match g {
            Generation::One => 1,
            Generation::Two => 2,
        }
    }
}

impl TryFrom<u8> for Generation {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Generation::One),
            2 => Ok(Generation::Two),
            other => Err(format!("unknown VM generation {other}")),
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Order of the two PXE-relevant boot entries
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BootOrder {
    /// Network adapter, then disk (PXE boot first)
    #[default]
    NetworkFirst,
    /// Disk, then network adapter
    DiskFirst,
}

/// Desired state of a single disposable VM
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub uefi_mode: bool,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub switch_name: String,
    pub secure_boot: SecureBoot,
    pub auto_start: bool,
    pub nested_virtualization: bool,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            uefi_mode: true,
            cpu_count: 2,
            memory_bytes: 2 * GIB,
            disk_bytes: 20 * GIB,
            switch_name: DEFAULT_SWITCH.to_string(),
            secure_boot: SecureBoot::Off,
            auto_start: false,
            nested_virtualization: true,
        }
    }
}

impl VmSpec {
    /// Validate sizes and force Secure Boot off for legacy firmware
    pub fn normalized(mut self) -> Result<Self, PxeError> {
        if self.cpu_count < 1 {
            return Err(PxeError::InvalidSpec("cpu count must be at least 1".into()));
        }
        if self.memory_bytes == 0 {
            return Err(PxeError::InvalidSpec("memory size must be positive".into()));
        }
        if self.disk_bytes == 0 {
            return Err(PxeError::InvalidSpec("disk size must be positive".into()));
        }
        if self.switch_name.trim().is_empty() {
            return Err(PxeError::InvalidSpec("switch name must not be empty".into()));
        }
        if !self.uefi_mode {
            self.secure_boot = SecureBoot::Off;
        }
        Ok(self)
    }

    pub fn generation(&self) -> Generation {
        Generation::for_uefi(self.uefi_mode)
    }

    /// Nested virtualization only works on UEFI guests with two or more vCPUs
    pub fn nested_supported(&self) -> bool {
        self.uefi_mode && self.cpu_count >= 2
    }
}

/// Name and disk location assigned to a VM once
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub name: String,
    pub disk_path: PathBuf,
}

impl VmIdentity {
    pub fn new(name: String, config: &ProvisionerConfig, storage_root: &Path) -> Self {
        let disk_path = storage_root.join(format!("{}.{}", name, config.disk_extension));
        Self { name, disk_path }
    }
}

/// Tool-wide settings passed explicitly to the allocator, reconciler and reclaimer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub base_prefix: String,
    pub uefi_tag: String,
    pub storage_root: Option<PathBuf>,
    pub disk_extension: String,
    pub name_attempts: u32,
    pub boot_order: BootOrder,
    pub reclaim_pattern: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            base_prefix: DEFAULT_BASE_PREFIX.to_string(),
            uefi_tag: "UEFI".to_string(),
            storage_root: None,
            disk_extension: "vhdx".to_string(),
            name_attempts: 10,
            boot_order: BootOrder::default(),
            reclaim_pattern: None,
        }
    }
}

impl ProvisionerConfig {
    /// Prefix the random suffix is appended to, e.g. `PXE-CLIENT-UEFI-`
    pub fn name_prefix(&self, uefi_mode: bool) -> String {
        if uefi_mode {
            format!("{}-{}-", self.base_prefix, self.uefi_tag)
        } else {
            format!("{}-", self.base_prefix)
        }
    }

    /// Pattern swept by the reclaimer when none is given
    pub fn reclaim_pattern(&self) -> String {
        self.reclaim_pattern
            .clone()
            .unwrap_or_else(|| format!("{}-", self.base_prefix))
    }
}

/// Result of a provisioning run, handed back for further automation
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProvisionRecord {
    pub name: String,
    pub disk_path: PathBuf,
    pub uefi_mode: bool,
    pub generation: Generation,
    pub created_at: String,
    pub steps: Vec<crate::vm::reconciler::StepReport>,
}
