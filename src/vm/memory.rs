//! Simulated hypervisor kept entirely in memory.
//!
//! Disk images are written as empty placeholder files so that storage-root
//! handling sees real files; their nominal capacity is tracked here. Every
//! mutating call is appended to a call log, and any operation can be made
//! to fail by name.

use crate::config::schema::{Generation, SecureBoot};
use crate::vm::firmware::{same_disk_path, BootDevice, FirmwareSettings};
use crate::vm::hypervisor::{
    name_matches, Hypervisor, NetworkAdapter, NewVm, PowerState, ProcessorSettings, Snapshot,
    VmInfo,
};
use crate::Result;
use anyhow::{anyhow, bail, Context};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEFAULT_ADAPTER: &str = "Network Adapter";

/// Simulated VM record
#[derive(Debug, Clone)]
pub struct SimVm {
    pub id: String,
    pub generation: Generation,
    pub state: PowerState,
    pub memory_bytes: u64,
    pub processor: ProcessorSettings,
    pub automatic_checkpoints: bool,
    pub disks: Vec<PathBuf>,
    pub adapter: Option<NetworkAdapter>,
    pub firmware: FirmwareSettings,
    pub snapshots: Vec<Snapshot>,
}

impl SimVm {
    /// A VM as a fresh `New-VM` leaves it
    pub fn new(generation: Generation, memory_bytes: u64, switch_name: Option<&str>) -> Self {
        let adapter = NetworkAdapter {
            name: DEFAULT_ADAPTER.to_string(),
            switch_name: switch_name.map(str::to_string),
        };
        let firmware = FirmwareSettings {
            secure_boot: if generation.is_uefi() {
                SecureBoot::On
            } else {
                SecureBoot::Off
            },
            boot_order: Vec::new(),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generation,
            state: PowerState::Off,
            memory_bytes,
            processor: ProcessorSettings {
                count: 1,
                expose_virtualization_extensions: false,
            },
            automatic_checkpoints: true,
            disks: Vec::new(),
            adapter: Some(adapter),
            firmware,
            snapshots: Vec::new(),
        }
    }

    fn info(&self, name: &str) -> VmInfo {
        VmInfo {
            name: name.to_string(),
            generation: self.generation,
            state: self.state,
        }
    }
}

#[derive(Default)]
struct Inventory {
    vms: BTreeMap<String, SimVm>,
    switches: HashSet<String>,
    disks: HashMap<PathBuf, u64>,
    calls: Vec<String>,
    failing: HashSet<String>,
}

/// In-process hypervisor used by tests and `--backend memory`
#[derive(Default)]
pub struct InMemoryHypervisor {
    inner: RefCell<Inventory>,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_switch(self, name: &str) -> Self {
        self.inner.borrow_mut().switches.insert(name.to_string());
        self
    }

    pub fn insert_vm(&self, name: &str, vm: SimVm) {
        self.inner.borrow_mut().vms.insert(name.to_string(), vm);
    }

    pub fn get_vm(&self, name: &str) -> Option<SimVm> {
        self.inner.borrow().vms.get(name).cloned()
    }

    /// Make every call to `op` (e.g. `"set_firmware"`) fail
    pub fn fail_on(&self, op: &str) {
        self.inner.borrow_mut().failing.insert(op.to_string());
    }

    /// Mutating calls made so far, as `op name`
    pub fn calls(&self) -> Vec<String> {
        self.inner.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.borrow_mut().calls.clear();
    }

    /// Nominal capacity of a disk created through this hypervisor
    pub fn disk_capacity(&self, path: &Path) -> Option<u64> {
        self.inner.borrow().disks.get(path).copied()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.inner.borrow().failing.contains(op) {
            bail!("{op}: injected failure");
        }
        Ok(())
    }

    fn record(&self, op: &str, target: &str) {
        self.inner.borrow_mut().calls.push(format!("{op} {target}"));
    }

    fn with_vm<T>(&self, name: &str, f: impl FnOnce(&SimVm) -> T) -> Result<T> {
        let inv = self.inner.borrow();
        let vm = inv
            .vms
            .get(name)
            .ok_or_else(|| anyhow!("VM '{name}' not found"))?;
        Ok(f(vm))
    }

    fn with_vm_mut<T>(&self, name: &str, f: impl FnOnce(&mut SimVm) -> Result<T>) -> Result<T> {
        let mut inv = self.inner.borrow_mut();
        let vm = inv
            .vms
            .get_mut(name)
            .ok_or_else(|| anyhow!("VM '{name}' not found"))?;
        f(vm)
    }

    /// Check for injected failure, log the call, then mutate the VM
    fn mutate<T>(&self, op: &str, name: &str, f: impl FnOnce(&mut SimVm) -> Result<T>) -> Result<T> {
        self.check(op)?;
        self.record(op, name);
        self.with_vm_mut(name, f).context(op.to_string())
    }
}

impl Hypervisor for InMemoryHypervisor {
    fn vm(&self, name: &str) -> Result<Option<VmInfo>> {
        self.check("vm")?;
        Ok(self.inner.borrow().vms.get(name).map(|vm| vm.info(name)))
    }

    fn list_vms(&self, pattern: &str) -> Result<Vec<VmInfo>> {
        self.check("list_vms")?;
        Ok(self
            .inner
            .borrow()
            .vms
            .iter()
            .filter(|(name, _)| name_matches(name, pattern))
            .map(|(name, vm)| vm.info(name))
            .collect())
    }

    fn create_vm(&self, args: &NewVm<'_>) -> Result<()> {
        self.check("create_vm")?;
        self.record("create_vm", args.name);
        let mut inv = self.inner.borrow_mut();
        if inv.vms.contains_key(args.name) {
            bail!("VM '{}' already exists", args.name);
        }
        if let Some(switch) = args.switch_name {
            if !inv.switches.contains(switch) {
                bail!("switch '{switch}' not found");
            }
        }
        inv.vms.insert(
            args.name.to_string(),
            SimVm::new(args.generation, args.memory_bytes, args.switch_name),
        );
        Ok(())
    }

    fn delete_vm(&self, name: &str) -> Result<()> {
        self.check("delete_vm")?;
        self.record("delete_vm", name);
        self.inner
            .borrow_mut()
            .vms
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("VM '{name}' not found"))
    }

    fn start_vm(&self, name: &str) -> Result<()> {
        self.mutate("start_vm", name, |vm| {
            vm.state = PowerState::Running;
            Ok(())
        })
    }

    fn stop_vm(&self, name: &str, _force: bool) -> Result<()> {
        self.mutate("stop_vm", name, |vm| {
            vm.state = PowerState::Off;
            Ok(())
        })
    }

    fn automatic_checkpoints_enabled(&self, name: &str) -> Result<bool> {
        self.check("automatic_checkpoints_enabled")?;
        self.with_vm(name, |vm| vm.automatic_checkpoints)
    }

    fn set_automatic_checkpoints(&self, name: &str, enabled: bool) -> Result<()> {
        self.mutate("set_automatic_checkpoints", name, |vm| {
            vm.automatic_checkpoints = enabled;
            Ok(())
        })
    }

    fn processor(&self, name: &str) -> Result<ProcessorSettings> {
        self.check("processor")?;
        self.with_vm(name, |vm| vm.processor)
    }

    fn set_processor(
        &self,
        name: &str,
        count: Option<u32>,
        expose_virtualization_extensions: Option<bool>,
    ) -> Result<()> {
        self.mutate("set_processor", name, |vm| {
            if let Some(count) = count {
                vm.processor.count = count;
            }
            if let Some(expose) = expose_virtualization_extensions {
                vm.processor.expose_virtualization_extensions = expose;
            }
            Ok(())
        })
    }

    fn create_disk_image(&self, path: &Path, size_bytes: u64) -> Result<()> {
        self.check("create_disk_image")?;
        self.record("create_disk_image", &path.display().to_string());
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        self.inner
            .borrow_mut()
            .disks
            .insert(path.to_path_buf(), size_bytes);
        Ok(())
    }

    fn attached_disks(&self, name: &str) -> Result<Vec<PathBuf>> {
        self.check("attached_disks")?;
        self.with_vm(name, |vm| vm.disks.clone())
    }

    fn attach_disk(&self, name: &str, path: &Path) -> Result<()> {
        self.mutate("attach_disk", name, |vm| {
            if vm.disks.iter().any(|d| same_disk_path(d, path)) {
                bail!("{} is already attached", path.display());
            }
            vm.disks.push(path.to_path_buf());
            Ok(())
        })
    }

    fn switch_exists(&self, switch_name: &str) -> Result<bool> {
        self.check("switch_exists")?;
        Ok(self.inner.borrow().switches.contains(switch_name))
    }

    fn network_adapter(&self, name: &str) -> Result<Option<NetworkAdapter>> {
        self.check("network_adapter")?;
        self.with_vm(name, |vm| vm.adapter.clone())
    }

    fn connect_adapter(&self, name: &str, switch_name: &str) -> Result<()> {
        if !self.inner.borrow().switches.contains(switch_name) {
            bail!("switch '{switch_name}' not found");
        }
        self.mutate("connect_adapter", name, |vm| {
            let adapter = vm
                .adapter
                .as_mut()
                .ok_or_else(|| anyhow!("VM has no network adapter"))?;
            adapter.switch_name = Some(switch_name.to_string());
            Ok(())
        })
    }

    fn firmware(&self, name: &str) -> Result<FirmwareSettings> {
        self.check("firmware")?;
        let (generation, firmware) = self.with_vm(name, |vm| (vm.generation, vm.firmware.clone()))?;
        if !generation.is_uefi() {
            bail!("generation 1 VMs have no UEFI firmware");
        }
        Ok(firmware)
    }

    fn set_firmware(&self, name: &str, settings: &FirmwareSettings) -> Result<()> {
        self.mutate("set_firmware", name, |vm| {
            if !vm.generation.is_uefi() {
                bail!("generation 1 VMs have no UEFI firmware");
            }
            for dev in &settings.boot_order {
                let known = match dev {
                    BootDevice::HardDisk { path } => {
                        vm.disks.iter().any(|d| same_disk_path(d, path))
                    }
                    BootDevice::NetworkAdapter { name } => vm
                        .adapter
                        .as_ref()
                        .is_some_and(|a| a.name.eq_ignore_ascii_case(name)),
                    BootDevice::Other { .. } => true,
                };
                if !known {
                    bail!("boot device {dev:?} is not attached");
                }
            }
            vm.firmware = settings.clone();
            Ok(())
        })
    }

    fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>> {
        self.check("snapshots")?;
        self.with_vm(name, |vm| vm.snapshots.clone())
    }

    fn delete_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        self.mutate("delete_snapshot", name, |vm| {
            let before = vm.snapshots.len();
            vm.snapshots.retain(|s| s.id != snapshot.id);
            if vm.snapshots.len() == before {
                bail!("snapshot '{}' not found", snapshot.name);
            }
            Ok(())
        })
    }
}
