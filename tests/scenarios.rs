use pxevm::config::schema::{BootOrder, Generation, ProvisionerConfig, VmSpec, GIB};
use pxevm::vm::firmware::BootDevice;
use pxevm::vm::hypervisor::{Hypervisor, PowerState, Snapshot};
use pxevm::vm::memory::{InMemoryHypervisor, SimVm, DEFAULT_ADAPTER};
use pxevm::vm::reclaimer::DiskDisposition;
use pxevm::vm::reconciler::{Step, StepOutcome};
use pxevm::{Provisioner, PxeError, Reclaimer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn host() -> InMemoryHypervisor {
    InMemoryHypervisor::new().with_switch("PXENetwork")
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(2024)
}

fn outcome(record: &pxevm::ProvisionRecord, step: Step) -> &StepOutcome {
    &record
        .steps
        .iter()
        .find(|r| r.step == step)
        .unwrap_or_else(|| panic!("no report for {step}"))
        .outcome
}

#[test]
fn scenario_a_fresh_uefi_client() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let hv = host();
    let config = ProvisionerConfig::default();

    let record = Provisioner::new(&hv, &config, &root)
        .provision(VmSpec::default(), rng())
        .unwrap();

    assert!(record.name.starts_with("PXE-CLIENT-UEFI-"));
    assert_eq!(record.name.len(), "PXE-CLIENT-UEFI-".len() + 3);
    assert_eq!(record.disk_path, root.join(format!("{}.vhdx", record.name)));
    assert!(record.uefi_mode);
    assert_eq!(record.generation, Generation::Two);
    assert_eq!(record.steps.len(), 9);
    assert!(record.steps.iter().all(|r| !r.outcome.is_failed()));

    assert!(record.disk_path.is_file());
    assert_eq!(hv.disk_capacity(&record.disk_path), Some(20 * GIB));

    let vm = hv.get_vm(&record.name).unwrap();
    assert_eq!(vm.generation, Generation::Two);
    assert_eq!(vm.memory_bytes, 2 * GIB);
    assert_eq!(vm.disks, vec![record.disk_path.clone()]);
    assert_eq!(
        vm.adapter.as_ref().unwrap().switch_name.as_deref(),
        Some("PXENetwork")
    );
    assert_eq!(vm.processor.count, 2);
    assert!(vm.processor.expose_virtualization_extensions);
    assert!(!vm.automatic_checkpoints);
    assert_eq!(
        vm.firmware.boot_order,
        vec![
            BootDevice::NetworkAdapter {
                name: DEFAULT_ADAPTER.into()
            },
            BootDevice::HardDisk {
                path: record.disk_path.clone()
            },
        ]
    );
    assert_eq!(vm.state, PowerState::Off);
    assert!(matches!(outcome(&record, Step::PowerOn), StepOutcome::Skipped(_)));
}

#[test]
fn scenario_b_missing_switch() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let hv = host();
    let config = ProvisionerConfig::default();
    let spec = VmSpec {
        switch_name: "Missing".into(),
        ..VmSpec::default()
    };

    let record = Provisioner::new(&hv, &config, &root)
        .provision(spec, rng())
        .unwrap();

    assert!(matches!(
        outcome(&record, Step::NetworkAttachment),
        StepOutcome::Skipped(_)
    ));
    assert!(matches!(
        outcome(&record, Step::FirmwareBootOrder),
        StepOutcome::Applied(_)
    ));
    for r in &record.steps {
        assert!(!r.outcome.is_failed(), "{} failed: {:?}", r.step, r.outcome);
    }

    let vm = hv.get_vm(&record.name).unwrap();
    assert_eq!(vm.adapter.unwrap().switch_name, None);
}

#[test]
fn second_pass_only_sets_processor_count() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let hv = host();
    let config = ProvisionerConfig::default();
    let provisioner = Provisioner::new(&hv, &config, &root);

    let first = provisioner
        .provision_named("PXE-CLIENT-UEFI-FIX", VmSpec::default())
        .unwrap();
    assert!(matches!(
        outcome(&first, Step::Existence),
        StepOutcome::Applied(_)
    ));
    assert!(hv.calls().contains(&"create_vm PXE-CLIENT-UEFI-FIX".to_string()));

    hv.clear_calls();
    let second = provisioner
        .provision_named("PXE-CLIENT-UEFI-FIX", VmSpec::default())
        .unwrap();
    assert_eq!(hv.calls(), vec!["set_processor PXE-CLIENT-UEFI-FIX".to_string()]);

    for r in &second.steps {
        match r.step {
            Step::ProcessorCount => assert!(matches!(r.outcome, StepOutcome::Applied(_))),
            Step::PowerOn => assert!(matches!(r.outcome, StepOutcome::Skipped(_))),
            _ => assert!(
                matches!(r.outcome, StepOutcome::Satisfied(_)),
                "{} was {:?}",
                r.step,
                r.outcome
            ),
        }
    }
}

#[test]
fn failed_step_does_not_stop_later_steps() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let hv = host();
    hv.fail_on("set_automatic_checkpoints");
    hv.fail_on("set_firmware");
    let config = ProvisionerConfig::default();

    let record = Provisioner::new(&hv, &config, &root)
        .provision(VmSpec::default(), rng())
        .unwrap();

    assert_eq!(record.steps.len(), 9);
    assert!(outcome(&record, Step::CheckpointPolicy).is_failed());
    assert!(outcome(&record, Step::FirmwareBootOrder).is_failed());
    assert!(matches!(
        outcome(&record, Step::DiskAttachment),
        StepOutcome::Applied(_)
    ));
    assert!(record.disk_path.is_file());
}

#[test]
fn failed_attachment_skips_firmware() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    hv.fail_on("attach_disk");
    let config = ProvisionerConfig::default();

    let record = Provisioner::new(&hv, &config, tmp.path())
        .provision(VmSpec::default(), rng())
        .unwrap();

    assert!(outcome(&record, Step::DiskAttachment).is_failed());
    assert!(matches!(
        outcome(&record, Step::FirmwareBootOrder),
        StepOutcome::Skipped(_)
    ));
}

#[test]
fn create_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    hv.fail_on("create_vm");
    let config = ProvisionerConfig::default();

    let err = Provisioner::new(&hv, &config, tmp.path())
        .provision(VmSpec::default(), rng())
        .unwrap_err();
    assert!(matches!(err, PxeError::Create { .. }));
    assert!(hv.list_vms("*").unwrap().is_empty());
}

#[test]
fn exhausted_names_abort() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    let config = ProvisionerConfig {
        name_attempts: 0,
        ..ProvisionerConfig::default()
    };

    let err = Provisioner::new(&hv, &config, tmp.path())
        .provision(VmSpec::default(), rng())
        .unwrap_err();
    assert!(matches!(err, PxeError::NameExhausted { .. }));
    assert!(hv.calls().is_empty());
}

#[test]
fn allocation_avoids_existing_vm() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    let config = ProvisionerConfig::default();
    let provisioner = Provisioner::new(&hv, &config, tmp.path());

    let taken = provisioner.allocate(&VmSpec::default(), rng()).unwrap();
    hv.insert_vm(&taken.name, SimVm::new(Generation::Two, GIB, None));

    let record = provisioner.provision(VmSpec::default(), rng()).unwrap();
    assert_ne!(record.name, taken.name);
}

#[test]
fn legacy_vm_has_no_firmware_or_nested_step() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    let config = ProvisionerConfig::default();
    let spec = VmSpec {
        uefi_mode: false,
        ..VmSpec::default()
    };

    let record = Provisioner::new(&hv, &config, tmp.path())
        .provision(spec, rng())
        .unwrap();

    assert!(record.name.starts_with("PXE-CLIENT-"));
    assert!(!record.name.contains("UEFI"));
    assert_eq!(record.generation, Generation::One);
    assert!(!record.uefi_mode);
    assert!(matches!(
        outcome(&record, Step::NestedVirtualization),
        StepOutcome::Skipped(_)
    ));
    assert!(matches!(
        outcome(&record, Step::FirmwareBootOrder),
        StepOutcome::Skipped(_)
    ));
    assert!(!hv.calls().iter().any(|c| c.starts_with("set_firmware")));
}

#[test]
fn existing_vm_with_other_generation_keeps_it() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    hv.insert_vm("PXE-CLIENT-OLD", SimVm::new(Generation::One, GIB, Some("PXENetwork")));
    let config = ProvisionerConfig::default();

    let record = Provisioner::new(&hv, &config, tmp.path())
        .provision_named("PXE-CLIENT-OLD", VmSpec::default())
        .unwrap();

    assert_eq!(record.generation, Generation::One);
    match outcome(&record, Step::Existence) {
        StepOutcome::Satisfied(detail) => {
            assert!(detail.contains("warning: existing VM is generation 1"))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        outcome(&record, Step::FirmwareBootOrder),
        StepOutcome::Skipped(_)
    ));
}

#[test]
fn auto_start_and_disk_first_order() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    let config = ProvisionerConfig {
        boot_order: BootOrder::DiskFirst,
        ..ProvisionerConfig::default()
    };
    let spec = VmSpec {
        auto_start: true,
        ..VmSpec::default()
    };

    let record = Provisioner::new(&hv, &config, tmp.path())
        .provision(spec, rng())
        .unwrap();

    assert!(matches!(outcome(&record, Step::PowerOn), StepOutcome::Applied(_)));
    let vm = hv.get_vm(&record.name).unwrap();
    assert_eq!(vm.state, PowerState::Running);
    assert!(matches!(vm.firmware.boot_order[0], BootDevice::HardDisk { .. }));
}

fn sim_vm(state: PowerState, disks: Vec<PathBuf>, snapshots: usize) -> SimVm {
    let mut vm = SimVm::new(Generation::Two, GIB, Some("PXENetwork"));
    vm.state = state;
    vm.disks = disks;
    vm.snapshots = (0..snapshots)
        .map(|i| Snapshot {
            id: format!("snap-{i}"),
            name: format!("checkpoint {i}"),
        })
        .collect();
    vm
}

fn touch(p: &Path) {
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, b"").unwrap();
}

#[test]
fn scenario_c_reclaim_fences_disks() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let inside = root.join("PXE-CLIENT-UEFI-AAA.vhdx");
    let outside = tmp.path().join("elsewhere").join("shared.vhdx");
    touch(&inside);
    touch(&outside);

    let hv = host();
    hv.insert_vm(
        "PXE-CLIENT-UEFI-AAA",
        sim_vm(PowerState::Running, vec![inside.clone()], 2),
    );
    hv.insert_vm("PXE-CLIENT-BBB", sim_vm(PowerState::Off, vec![outside.clone()], 0));
    hv.insert_vm("OTHER-VM", sim_vm(PowerState::Off, vec![], 0));

    let report = Reclaimer::new(&hv, &root).reclaim("PXE-CLIENT-").unwrap();

    assert_eq!(report.vms.len(), 2);
    assert!(report.vms.iter().all(|vm| vm.deleted));
    assert!(!report.has_errors());

    let aaa = report.vms.iter().find(|v| v.name == "PXE-CLIENT-UEFI-AAA").unwrap();
    assert!(aaa.stopped);
    assert_eq!(aaa.snapshots_removed, 2);
    assert_eq!(aaa.disks[0].disposition, DiskDisposition::Deleted);

    let bbb = report.vms.iter().find(|v| v.name == "PXE-CLIENT-BBB").unwrap();
    assert!(!bbb.stopped);
    assert_eq!(bbb.disks[0].disposition, DiskDisposition::Protected);

    assert!(!inside.exists());
    assert!(outside.exists());
    assert_eq!(report.protected_disks().collect::<Vec<_>>(), vec![outside.as_path()]);

    assert!(report.storage_root_removed);
    assert!(!root.exists());
    assert!(hv.get_vm("OTHER-VM").is_some());
    assert!(hv.list_vms("PXE-CLIENT-").unwrap().is_empty());

    let again = Reclaimer::new(&hv, &root).reclaim("PXE-CLIENT-").unwrap();
    assert!(again.vms.is_empty());
    assert!(!again.storage_root_removed);
}

#[test]
fn reclaim_keeps_non_empty_storage_root() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let disk = root.join("PXE-CLIENT-AAA.vhdx");
    touch(&disk);
    touch(&root.join("notes.txt"));

    let hv = host();
    hv.insert_vm("PXE-CLIENT-AAA", sim_vm(PowerState::Off, vec![disk.clone()], 0));

    let report = Reclaimer::new(&hv, &root).reclaim("PXE-CLIENT-").unwrap();
    assert!(!disk.exists());
    assert!(!report.storage_root_removed);
    assert!(root.is_dir());
}

#[test]
fn reclaim_still_fences_disks_after_failed_delete() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let inside = root.join("PXE-CLIENT-AAA.vhdx");
    let outside = tmp.path().join("elsewhere").join("PXE-CLIENT-AAA-data.vhdx");
    let missing = root.join("PXE-CLIENT-BBB.vhdx");
    touch(&inside);
    touch(&outside);

    let hv = host();
    hv.insert_vm(
        "PXE-CLIENT-AAA",
        sim_vm(PowerState::Off, vec![inside.clone(), outside.clone()], 0),
    );
    hv.insert_vm("PXE-CLIENT-BBB", sim_vm(PowerState::Off, vec![missing.clone()], 0));
    hv.fail_on("delete_vm");

    let report = Reclaimer::new(&hv, &root).reclaim("PXE-CLIENT-").unwrap();

    assert_eq!(report.vms.len(), 2);
    assert!(report.has_errors());
    for vm in &report.vms {
        assert!(!vm.deleted);
        assert_eq!(vm.errors.len(), 1);
    }

    let aaa = report.vms.iter().find(|v| v.name == "PXE-CLIENT-AAA").unwrap();
    assert_eq!(aaa.disks[0].disposition, DiskDisposition::Deleted);
    assert_eq!(aaa.disks[1].disposition, DiskDisposition::Protected);
    assert!(!inside.exists());
    assert!(outside.exists());

    let bbb = report.vms.iter().find(|v| v.name == "PXE-CLIENT-BBB").unwrap();
    assert_eq!(bbb.disks[0].disposition, DiskDisposition::Missing);

    assert!(hv.get_vm("PXE-CLIENT-AAA").is_some());
}

#[test]
fn reclaim_refuses_match_all_patterns() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    hv.insert_vm("PXE-CLIENT-AAA", sim_vm(PowerState::Running, vec![], 0));
    hv.insert_vm("OTHER-VM", sim_vm(PowerState::Off, vec![], 0));

    for pattern in ["", "  ", "*"] {
        let err = Reclaimer::new(&hv, tmp.path()).reclaim(pattern).unwrap_err();
        assert!(err.to_string().contains("would match every VM"));
    }
    assert!(hv.calls().is_empty());
    assert!(hv.get_vm("OTHER-VM").is_some());
    assert!(tmp.path().exists());
}

#[test]
fn reclaim_reports_missing_disks_and_snapshot_failures() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("VMs");
    let gone = root.join("PXE-CLIENT-AAA.vhdx");

    let hv = host();
    hv.insert_vm("PXE-CLIENT-AAA", sim_vm(PowerState::Running, vec![gone.clone()], 1));
    hv.fail_on("delete_snapshot");
    hv.fail_on("stop_vm");

    let report = Reclaimer::new(&hv, &root).reclaim("PXE-CLIENT-").unwrap();
    let vm = &report.vms[0];
    assert!(vm.deleted);
    assert!(!vm.stopped);
    assert_eq!(vm.snapshots_removed, 0);
    assert_eq!(vm.errors.len(), 2);
    assert_eq!(vm.disks[0].disposition, DiskDisposition::Missing);
}

#[test]
fn reclaim_fails_when_inventory_is_unreachable() {
    let tmp = TempDir::new().unwrap();
    let hv = host();
    hv.fail_on("list_vms");
    let err = Reclaimer::new(&hv, tmp.path()).reclaim("PXE-CLIENT-").unwrap_err();
    assert!(err.to_string().contains("failed to list VMs"));
}
