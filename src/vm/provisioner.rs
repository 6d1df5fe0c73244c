//! Allocate a name and reconcile a fresh PXE client VM

use crate::config::schema::{ProvisionRecord, ProvisionerConfig, VmIdentity, VmSpec};
use crate::error::PxeError;
use crate::utils::system::now_utc;
use crate::vm::hypervisor::Hypervisor;
use crate::vm::naming::NameAllocator;
use crate::vm::reconciler::reconcile;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct Provisioner<'a> {
    hv: &'a dyn Hypervisor,
    config: &'a ProvisionerConfig,
    storage_root: PathBuf,
}

impl<'a> Provisioner<'a> {
    pub fn new(hv: &'a dyn Hypervisor, config: &'a ProvisionerConfig, storage_root: &Path) -> Self {
        Self {
            hv,
            config,
            storage_root: storage_root.to_path_buf(),
        }
    }

    /// Pick an unused name for `spec`
    pub fn allocate<R: Rng>(&self, spec: &VmSpec, rng: R) -> Result<VmIdentity, PxeError> {
        let prefix = self.config.name_prefix(spec.uefi_mode);
        let mut allocator = NameAllocator::new(rng, self.config.name_attempts);
        let name = allocator.allocate(&prefix, |candidate| self.hv.vm_exists(candidate))?;
        Ok(VmIdentity::new(name, self.config, &self.storage_root))
    }

    /// Provision a new VM under a freshly allocated name
    pub fn provision<R: Rng>(&self, spec: VmSpec, rng: R) -> Result<ProvisionRecord, PxeError> {
        let spec = spec.normalized()?;
        let identity = self.allocate(&spec, rng)?;
        self.reconcile(&identity, &spec)
    }

    /// Reconcile a VM with a caller-chosen name, which may already exist
    pub fn provision_named(&self, name: &str, spec: VmSpec) -> Result<ProvisionRecord, PxeError> {
        let spec = spec.normalized()?;
        let identity = VmIdentity::new(name.to_string(), self.config, &self.storage_root);
        self.reconcile(&identity, &spec)
    }

    fn reconcile(&self, identity: &VmIdentity, spec: &VmSpec) -> Result<ProvisionRecord, PxeError> {
        fs::create_dir_all(&self.storage_root).map_err(|source| PxeError::StorageRoot {
            path: self.storage_root.clone(),
            source,
        })?;

        info!(vm = %identity.name, disk = %identity.disk_path.display(), "reconciling");
        let result = reconcile(self.hv, identity, spec, self.config)?;

        Ok(ProvisionRecord {
            name: identity.name.clone(),
            disk_path: identity.disk_path.clone(),
            uefi_mode: result.generation.is_uefi(),
            generation: result.generation,
            created_at: now_utc(),
            steps: result.steps,
        })
    }
}
