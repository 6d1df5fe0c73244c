//! Drives a VM toward its desired state one step at a time.
//!
//! Each step probes the hypervisor, feeds what it saw into a pure `decide_*`
//! function, and applies the resulting [`Action`] only on mismatch. Only the
//! existence step is fatal; every other failure is recorded and the run
//! moves on to the next step.

use crate::config::schema::{BootOrder, Generation, ProvisionerConfig, VmIdentity, VmSpec};
use crate::error::PxeError;
use crate::vm::firmware::{same_disk_path, FirmwareSettings};
use crate::vm::hypervisor::{Hypervisor, NetworkAdapter, NewVm, PowerState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reconciliation steps, in the order they run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Existence,
    CheckpointPolicy,
    NestedVirtualization,
    ProcessorCount,
    DiskProvisioning,
    DiskAttachment,
    NetworkAttachment,
    FirmwareBootOrder,
    PowerOn,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Existence => "existence",
            Step::CheckpointPolicy => "checkpoint policy",
            Step::NestedVirtualization => "nested virtualization",
            Step::ProcessorCount => "processor count",
            Step::DiskProvisioning => "disk provisioning",
            Step::DiskAttachment => "disk attachment",
            Step::NetworkAttachment => "network attachment",
            Step::FirmwareBootOrder => "firmware boot order",
            Step::PowerOn => "power on",
        };
        f.write_str(s)
    }
}

/// A mutating call the executor makes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateVm {
        generation: Generation,
        memory_bytes: u64,
        switch_name: Option<String>,
    },
    DisableAutomaticCheckpoints,
    ExposeVirtualizationExtensions,
    SetProcessorCount(u32),
    CreateDisk { path: PathBuf, size_bytes: u64 },
    AttachDisk(PathBuf),
    ConnectAdapter(String),
    ConfigureFirmware(FirmwareSettings),
    Start,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::CreateVm {
                generation,
                memory_bytes,
                switch_name,
            } => {
                write!(f, "created generation {generation} VM with {memory_bytes} bytes of memory")?;
                match switch_name {
                    Some(s) => write!(f, " on switch '{s}'"),
                    None => write!(f, " without a switch"),
                }
            }
            Action::DisableAutomaticCheckpoints => write!(f, "disabled automatic checkpoints"),
            Action::ExposeVirtualizationExtensions => {
                write!(f, "exposed virtualization extensions")
            }
            Action::SetProcessorCount(n) => write!(f, "set processor count to {n}"),
            Action::CreateDisk { path, size_bytes } => {
                write!(f, "created {size_bytes} byte disk {}", path.display())
            }
            Action::AttachDisk(path) => write!(f, "attached {}", path.display()),
            Action::ConnectAdapter(s) => write!(f, "connected adapter to '{s}'"),
            Action::ConfigureFirmware(fw) => write!(
                f,
                "set Secure Boot {} and {} boot entries",
                fw.secure_boot,
                fw.boot_order.len()
            ),
            Action::Start => write!(f, "started VM"),
        }
    }
}

/// What a step should do given what was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply(Action),
    Satisfied(String),
    /// Not attempted because a dependency is missing; reported as a warning
    Skip(String),
    /// Not relevant for this VM spec
    NotApplicable(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied(String),
    Satisfied(String),
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: Step,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

// ---- decisions ----

pub fn decide_existence(
    existing: Option<Generation>,
    spec: &VmSpec,
    switch_exists: bool,
) -> Decision {
    match existing {
        Some(generation) => {
            let mut detail = format!("VM exists (generation {generation})");
            if let Some(msg) = firmware_mismatch(generation, spec) {
                detail = format!("{detail}; warning: {msg}");
            }
            Decision::Satisfied(detail)
        }
        None => Decision::Apply(Action::CreateVm {
            generation: spec.generation(),
            memory_bytes: spec.memory_bytes,
            switch_name: switch_exists.then(|| spec.switch_name.clone()),
        }),
    }
}

/// Warning text when an existing VM's firmware class differs from the requested one
pub fn firmware_mismatch(actual: Generation, spec: &VmSpec) -> Option<String> {
    (actual != spec.generation()).then(|| {
        format!(
            "existing VM is generation {actual} but generation {} was requested; \
             firmware settings follow the existing VM",
            spec.generation()
        )
    })
}

pub fn decide_checkpoints(enabled: bool) -> Decision {
    if enabled {
        Decision::Apply(Action::DisableAutomaticCheckpoints)
    } else {
        Decision::Satisfied("automatic checkpoints already disabled".into())
    }
}

pub fn decide_nested(spec: &VmSpec, exposed: bool) -> Decision {
    if !spec.nested_virtualization {
        return Decision::NotApplicable("nested virtualization not requested".into());
    }
    if !spec.nested_supported() {
        return Decision::NotApplicable(format!(
            "nested virtualization needs UEFI and at least 2 vCPUs (uefi={}, cpus={})",
            spec.uefi_mode, spec.cpu_count
        ));
    }
    if exposed {
        Decision::Satisfied("virtualization extensions already exposed".into())
    } else {
        Decision::Apply(Action::ExposeVirtualizationExtensions)
    }
}

/// The processor count is set on every run, without probing
pub fn decide_processor(spec: &VmSpec) -> Decision {
    Decision::Apply(Action::SetProcessorCount(spec.cpu_count))
}

pub fn decide_disk(disk_exists: bool, path: &Path, size_bytes: u64) -> Decision {
    if disk_exists {
        Decision::Satisfied(format!("disk {} exists", path.display()))
    } else {
        Decision::Apply(Action::CreateDisk {
            path: path.to_path_buf(),
            size_bytes,
        })
    }
}

pub fn decide_attachment(attached: &[PathBuf], path: &Path) -> Decision {
    if attached.iter().any(|p| same_disk_path(p, path)) {
        Decision::Satisfied(format!("{} already attached", path.display()))
    } else {
        Decision::Apply(Action::AttachDisk(path.to_path_buf()))
    }
}

pub fn decide_network(
    adapter: Option<&NetworkAdapter>,
    switch_name: &str,
    switch_exists: bool,
) -> Decision {
    let adapter = match adapter {
        Some(a) => a,
        None => return Decision::Skip("VM has no network adapter".into()),
    };
    if adapter.switch_name.as_deref() == Some(switch_name) {
        return Decision::Satisfied(format!("adapter already on '{switch_name}'"));
    }
    if !switch_exists {
        return Decision::Skip(format!(
            "switch '{switch_name}' does not exist; adapter left as is"
        ));
    }
    Decision::Apply(Action::ConnectAdapter(switch_name.to_string()))
}

pub fn decide_firmware(
    generation: Generation,
    disk_resolved: bool,
    adapter: Option<&NetworkAdapter>,
    current: Option<&FirmwareSettings>,
    spec: &VmSpec,
    order: BootOrder,
    disk_path: &Path,
) -> Decision {
    if !generation.is_uefi() {
        return Decision::NotApplicable("legacy firmware has no UEFI boot order".into());
    }
    if !disk_resolved {
        return Decision::Skip("disk is not attached".into());
    }
    let adapter = match adapter {
        Some(a) => a,
        None => return Decision::Skip("no network adapter to boot from".into()),
    };
    let desired = FirmwareSettings::pxe(spec.secure_boot, order, disk_path, &adapter.name);
    match current {
        Some(current) if current.satisfies(&desired) => {
            Decision::Satisfied("firmware already configured".into())
        }
        _ => Decision::Apply(Action::ConfigureFirmware(desired)),
    }
}

pub fn decide_power(auto_start: bool, state: PowerState) -> Decision {
    if !auto_start {
        return Decision::NotApplicable("auto-start not requested".into());
    }
    if state == PowerState::Running {
        Decision::Satisfied("VM already running".into())
    } else {
        Decision::Apply(Action::Start)
    }
}

// ---- execution ----

/// Outcome of reconciling one VM
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub generation: Generation,
    pub steps: Vec<StepReport>,
}

impl Reconciliation {
    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }
}

/// Apply an action through the hypervisor
pub fn apply(hv: &dyn Hypervisor, name: &str, action: &Action) -> anyhow::Result<()> {
    match action {
        Action::CreateVm {
            generation,
            memory_bytes,
            switch_name,
        } => hv.create_vm(&NewVm {
            name,
            generation: *generation,
            memory_bytes: *memory_bytes,
            switch_name: switch_name.as_deref(),
        }),
        Action::DisableAutomaticCheckpoints => hv.set_automatic_checkpoints(name, false),
        Action::ExposeVirtualizationExtensions => hv.set_processor(name, None, Some(true)),
        Action::SetProcessorCount(n) => hv.set_processor(name, Some(*n), None),
        Action::CreateDisk { path, size_bytes } => hv.create_disk_image(path, *size_bytes),
        Action::AttachDisk(path) => hv.attach_disk(name, path),
        Action::ConnectAdapter(switch) => hv.connect_adapter(name, switch),
        Action::ConfigureFirmware(fw) => hv.set_firmware(name, fw),
        Action::Start => hv.start_vm(name),
    }
}

struct Executor<'a> {
    hv: &'a dyn Hypervisor,
    name: &'a str,
    steps: Vec<StepReport>,
}

impl<'a> Executor<'a> {
    /// Probe, decide and apply one non-fatal step
    fn run<F>(&mut self, step: Step, probe: F) -> &StepOutcome
    where
        F: FnOnce(&dyn Hypervisor) -> anyhow::Result<Decision>,
    {
        let outcome = match probe(self.hv) {
            Ok(decision) => self.execute(step, decision),
            Err(e) => {
                warn!(vm = self.name, %step, "probe failed: {e:#}");
                StepOutcome::Failed(format!("{e:#}"))
            }
        };
        self.record(step, outcome)
    }

    fn execute(&self, step: Step, decision: Decision) -> StepOutcome {
        match decision {
            Decision::Apply(action) => match apply(self.hv, self.name, &action) {
                Ok(()) => {
                    info!(vm = self.name, %step, "{action}");
                    StepOutcome::Applied(action.to_string())
                }
                Err(e) => {
                    warn!(vm = self.name, %step, "failed: {e:#}");
                    StepOutcome::Failed(format!("{e:#}"))
                }
            },
            Decision::Satisfied(msg) => {
                info!(vm = self.name, %step, "{msg}");
                StepOutcome::Satisfied(msg)
            }
            Decision::Skip(msg) => {
                warn!(vm = self.name, %step, "skipped: {msg}");
                StepOutcome::Skipped(msg)
            }
            Decision::NotApplicable(msg) => {
                info!(vm = self.name, %step, "{msg}");
                StepOutcome::Skipped(msg)
            }
        }
    }

    fn record(&mut self, step: Step, outcome: StepOutcome) -> &StepOutcome {
        self.steps.push(StepReport { step, outcome });
        &self.steps[self.steps.len() - 1].outcome
    }
}

/// Reconcile `identity` toward `spec`.
///
/// Fails only when the VM can neither be found nor created.
pub fn reconcile(
    hv: &dyn Hypervisor,
    identity: &VmIdentity,
    spec: &VmSpec,
    config: &ProvisionerConfig,
) -> Result<Reconciliation, PxeError> {
    let name = identity.name.as_str();
    let mut ex = Executor {
        hv,
        name,
        steps: Vec::new(),
    };

    let switch_exists = hv.switch_exists(&spec.switch_name).unwrap_or_else(|e| {
        warn!(vm = name, switch = %spec.switch_name, "switch lookup failed: {e:#}");
        false
    });

    // existence is the one step whose failure ends the run
    let existing = hv.vm(name).map_err(|e| PxeError::probe(name, e))?;
    let generation = match &existing {
        Some(vm) => {
            if let Some(msg) = firmware_mismatch(vm.generation, spec) {
                warn!(vm = name, "{msg}");
            }
            vm.generation
        }
        None => spec.generation(),
    };
    let decision = decide_existence(existing.as_ref().map(|v| v.generation), spec, switch_exists);
    let outcome = match decision {
        Decision::Apply(action) => {
            apply(hv, name, &action).map_err(|e| PxeError::create(name, e))?;
            info!(vm = name, step = %Step::Existence, "{action}");
            StepOutcome::Applied(action.to_string())
        }
        other => ex.execute(Step::Existence, other),
    };
    ex.record(Step::Existence, outcome);

    ex.run(Step::CheckpointPolicy, |hv| {
        Ok(decide_checkpoints(hv.automatic_checkpoints_enabled(name)?))
    });

    ex.run(Step::NestedVirtualization, |hv| {
        if !(spec.nested_virtualization && spec.nested_supported()) {
            return Ok(decide_nested(spec, false));
        }
        let cpu = hv.processor(name)?;
        Ok(decide_nested(spec, cpu.expose_virtualization_extensions))
    });

    ex.run(Step::ProcessorCount, |_| Ok(decide_processor(spec)));

    let disk_path = identity.disk_path.as_path();
    ex.run(Step::DiskProvisioning, |_| {
        Ok(decide_disk(disk_path.exists(), disk_path, spec.disk_bytes))
    });

    let attached = ex.run(Step::DiskAttachment, |hv| {
        Ok(decide_attachment(&hv.attached_disks(name)?, disk_path))
    });
    let disk_resolved = matches!(
        attached,
        StepOutcome::Applied(_) | StepOutcome::Satisfied(_)
    );

    ex.run(Step::NetworkAttachment, |hv| {
        let adapter = hv.network_adapter(name)?;
        Ok(decide_network(adapter.as_ref(), &spec.switch_name, switch_exists))
    });

    ex.run(Step::FirmwareBootOrder, |hv| {
        let (adapter, current) = if generation.is_uefi() && disk_resolved {
            let adapter = hv.network_adapter(name)?;
            let current = match &adapter {
                Some(_) => Some(hv.firmware(name)?),
                None => None,
            };
            (adapter, current)
        } else {
            (None, None)
        };
        Ok(decide_firmware(
            generation,
            disk_resolved,
            adapter.as_ref(),
            current.as_ref(),
            spec,
            config.boot_order,
            disk_path,
        ))
    });

    ex.run(Step::PowerOn, |hv| {
        if !spec.auto_start {
            return Ok(decide_power(false, PowerState::Off));
        }
        let state = hv
            .vm(name)?
            .map(|vm| vm.state)
            .unwrap_or(PowerState::Off);
        Ok(decide_power(true, state))
    });

    Ok(Reconciliation {
        generation,
        steps: ex.steps,
    })
}
