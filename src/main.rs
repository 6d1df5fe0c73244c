use anyhow::Result;
use clap::Parser;
use pxevm::cli::commands::{spec_from_args, Backend, Cli, Cmd};
use pxevm::cli::completions::{generate_man_page, install_fish_completions, print_completions};
use pxevm::config::load::{load_config_or_default, save_record};
use pxevm::config::schema::DEFAULT_SWITCH;
use pxevm::utils::logging;
use pxevm::utils::paths::default_storage_root;
use pxevm::vm::hyperv::HyperV;
use pxevm::vm::memory::InMemoryHypervisor;
use pxevm::vm::reclaimer::{DiskDisposition, ReclaimReport};
use pxevm::vm::reconciler::StepOutcome;
use pxevm::{Hypervisor, ProvisionRecord, Provisioner, Reclaimer};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn backend(kind: Backend) -> Result<Box<dyn Hypervisor>> {
    Ok(match kind {
        Backend::Hyperv => Box::new(HyperV::new()?),
        Backend::Memory => Box::new(InMemoryHypervisor::new().with_switch(DEFAULT_SWITCH)),
    })
}

fn print_record(record: &ProvisionRecord) {
    println!(
        "Provisioned VM '{}' (generation {})",
        record.name, record.generation
    );
    println!("  Disk: {}", record.disk_path.display());
    for r in &record.steps {
        let (status, detail) = match &r.outcome {
            StepOutcome::Applied(d) => ("applied", d),
            StepOutcome::Satisfied(d) => ("ok", d),
            StepOutcome::Skipped(d) => ("skipped", d),
            StepOutcome::Failed(d) => ("FAILED", d),
        };
        println!("  {:<22} {:<8} {}", r.step.to_string(), status, detail);
    }
}

fn print_reclaim(report: &ReclaimReport) {
    if report.vms.is_empty() {
        println!("No VMs match '{}'", report.pattern);
    }
    for vm in &report.vms {
        let state = if vm.deleted { "deleted" } else { "NOT deleted" };
        println!(
            "{}: {} ({} snapshot(s) removed)",
            vm.name, state, vm.snapshots_removed
        );
        for disk in &vm.disks {
            let what = match &disk.disposition {
                DiskDisposition::Deleted => "deleted".to_string(),
                DiskDisposition::Protected => "skipped (outside storage root)".to_string(),
                DiskDisposition::Missing => "already gone".to_string(),
                DiskDisposition::Failed(e) => format!("delete failed: {e}"),
            };
            println!("  {}: {}", disk.path.display(), what);
        }
        for err in &vm.errors {
            println!("  error: {err}");
        }
    }
    if report.storage_root_removed {
        println!("Removed empty storage root");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.cmd {
        Cmd::Completions { shell } => {
            print_completions(shell);
            return Ok(());
        }
        Cmd::InstallFish => {
            let path = install_fish_completions()?;
            println!("Fish completions installed to: {}", path.display());
            return Ok(());
        }
        Cmd::ManPage => return generate_man_page(),
        _ => {}
    }

    let mut config = load_config_or_default(cli.config.as_deref())?;
    let storage_root = match cli.storage_root.or_else(|| config.storage_root.clone()) {
        Some(p) => p,
        None => default_storage_root()?,
    };
    let hv = backend(cli.backend)?;

    match cli.cmd {
        Cmd::Create {
            uefi,
            cpu_count,
            memory_gb,
            disk_size_gb,
            switch_name,
            secure_boot,
            auto_start,
            nested_virtualization,
            boot_order,
            name,
            seed,
            record,
            json,
        } => {
            if let Some(order) = boot_order {
                config.boot_order = order;
            }
            let spec = spec_from_args(
                uefi,
                cpu_count,
                memory_gb,
                disk_size_gb,
                switch_name,
                secure_boot,
                auto_start,
                nested_virtualization,
            );
            let provisioner = Provisioner::new(&*hv, &config, &storage_root);
            let result = match name {
                Some(name) => provisioner.provision_named(&name, spec)?,
                None => {
                    let rng = match seed {
                        Some(s) => StdRng::seed_from_u64(s),
                        None => StdRng::from_entropy(),
                    };
                    provisioner.provision(spec, rng)?
                }
            };

            if let Some(path) = record {
                save_record(&result, &path)?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_record(&result);
            }
        }

        Cmd::Reclaim { pattern, json } => {
            let pattern = pattern.unwrap_or_else(|| config.reclaim_pattern());
            let report = Reclaimer::new(&*hv, &storage_root).reclaim(&pattern)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_reclaim(&report);
            }
        }

        Cmd::List { pattern, json } => {
            let pattern = pattern.unwrap_or_else(|| config.reclaim_pattern());
            let vms = hv.list_vms(&pattern)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&vms)?);
            } else {
                for vm in &vms {
                    println!("{}  generation {}  {}", vm.name, vm.generation, vm.state);
                }
            }
        }

        // handled before the backend is set up
        Cmd::Completions { .. } | Cmd::InstallFish | Cmd::ManPage => {}
    }

    Ok(())
}
