//! CLI command definitions

use crate::config::schema::{BootOrder, SecureBoot, VmSpec, DEFAULT_SWITCH, GIB};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// PXE test VM provisioner
#[derive(Parser, Debug)]
#[command(name = "pxevm", about = "Provision and reclaim disposable PXE-boot test VMs")]
pub struct Cli {
    /// Hypervisor to drive
    #[arg(long, global = true, value_enum, default_value_t = Backend::Hyperv)]
    pub backend: Backend,

    /// Directory owned by this tool for VM disks
    #[arg(long, global = true, env = "PXEVM_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// JSON config file
    #[arg(long, global = true, env = "PXEVM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local Hyper-V via PowerShell
    Hyperv,
    /// Simulated in-process host with the default switch
    Memory,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create (or converge) a PXE client VM
    Create {
        /// UEFI (generation 2) firmware; false for legacy BIOS
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        uefi: bool,

        #[arg(long, default_value_t = 2)]
        cpu_count: u32,

        /// Startup memory (GiB)
        #[arg(long, default_value_t = 2)]
        memory_gb: u64,

        /// Disk capacity (GiB)
        #[arg(long, default_value_t = 20)]
        disk_size_gb: u64,

        /// Virtual switch the adapter connects to
        #[arg(long, default_value = DEFAULT_SWITCH)]
        switch_name: String,

        /// Secure Boot (UEFI only)
        #[arg(long, value_enum, default_value_t = SecureBoot::Off)]
        secure_boot: SecureBoot,

        /// Start the VM once configured
        #[arg(long)]
        auto_start: bool,

        /// Expose virtualization extensions (UEFI with 2+ vCPUs)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        nested_virtualization: bool,

        /// Boot order override (default from config: network first)
        #[arg(long, value_enum)]
        boot_order: Option<BootOrder>,

        /// Use this name instead of allocating one; the VM may already exist
        #[arg(long)]
        name: Option<String>,

        /// Seed for name allocation
        #[arg(long)]
        seed: Option<u64>,

        /// Also write the provision record to this file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Print the provision record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete matching VMs and the disks they own
    Reclaim {
        /// Name prefix, or glob with `*` (default: `<base prefix>-`)
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// List matching VMs
    List {
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Install Fish shell completions automatically
    InstallFish,

    /// Generate man page
    ManPage,
}

/// Build a [`VmSpec`] from `create` flags
#[allow(clippy::too_many_arguments)]
pub fn spec_from_args(
    uefi: bool,
    cpu_count: u32,
    memory_gb: u64,
    disk_size_gb: u64,
    switch_name: String,
    secure_boot: SecureBoot,
    auto_start: bool,
    nested_virtualization: bool,
) -> VmSpec {
    VmSpec {
        uefi_mode: uefi,
        cpu_count,
        memory_bytes: memory_gb.saturating_mul(GIB),
        disk_bytes: disk_size_gb.saturating_mul(GIB),
        switch_name,
        secure_boot,
        auto_start,
        nested_virtualization,
    }
}
