//! pxevm - disposable PXE-boot test VMs
//!
//! Provisions VMs by reconciling them step by step against a hypervisor's
//! management interface, and reclaims them with a sweep that only deletes
//! disks inside the tool's own storage root.

pub mod cli;
pub mod config;
pub mod error;
pub mod utils;
pub mod vm;

// Re-export commonly used types
pub use cli::commands::Cli;
pub use config::schema::{ProvisionRecord, ProvisionerConfig, VmIdentity, VmSpec};
pub use error::PxeError;
pub use vm::hypervisor::Hypervisor;
pub use vm::provisioner::Provisioner;
pub use vm::reclaimer::Reclaimer;

/// Library error type
pub type Result<T> = anyhow::Result<T>;
