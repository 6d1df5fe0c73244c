//! Hyper-V backend driven through PowerShell cmdlets

use crate::config::schema::{Generation, SecureBoot};
use crate::utils::system::pick_powershell;
use crate::vm::firmware::{BootDevice, FirmwareSettings};
use crate::vm::hypervisor::{
    name_matches, Hypervisor, NetworkAdapter, NewVm, PowerState, ProcessorSettings, Snapshot,
    VmInfo,
};
use crate::vm::powershell::{output_lines, parse_json_list, ps_bool, ps_quote, PowerShellBuilder};
use crate::Result;
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawVm {
    name: String,
    generation: u8,
    state: i32,
}

impl RawVm {
    fn into_info(self) -> Result<VmInfo> {
        Ok(VmInfo {
            generation: Generation::try_from(self.generation).map_err(|e| anyhow!(e))?,
            state: power_state(self.state),
            name: self.name,
        })
    }
}

/// Map Microsoft.HyperV.PowerShell.VMState as serialized by ConvertTo-Json
fn power_state(state: i32) -> PowerState {
    match state {
        2 => PowerState::Running,
        3 => PowerState::Off,
        _ => PowerState::Other,
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawProcessor {
    count: u32,
    expose_virtualization_extensions: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawAdapter {
    name: String,
    switch_name: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawBootEntry {
    boot_type: String,
    #[serde(default)]
    disk: bool,
    path: Option<String>,
    name: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawFirmware {
    secure_boot: String,
    #[serde(default)]
    boot_order: Vec<RawBootEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawSnapshot {
    id: String,
    name: String,
}

fn parse_firmware(out: &str) -> Result<FirmwareSettings> {
    let raw: RawFirmware =
        serde_json::from_str(out.trim()).context("unexpected Get-VMFirmware output")?;
    let secure_boot = if raw.secure_boot.eq_ignore_ascii_case("on") {
        SecureBoot::On
    } else {
        SecureBoot::Off
    };
    let boot_order = raw
        .boot_order
        .into_iter()
        .map(|e| match (e.boot_type.as_str(), e.disk, e.path, e.name) {
            ("Drive", true, Some(path), _) => BootDevice::HardDisk {
                path: PathBuf::from(path),
            },
            ("Network", _, _, Some(name)) => BootDevice::NetworkAdapter { name },
            (kind, ..) => BootDevice::Other {
                description: e.description.unwrap_or_else(|| kind.to_string()),
            },
        })
        .collect();
    Ok(FirmwareSettings {
        secure_boot,
        boot_order,
    })
}

/// Names of external switches called `switch_name`
fn external_switch_script(switch_name: &str) -> String {
    format!(
        "Get-VMSwitch -Name {name} -ErrorAction SilentlyContinue \
         | Where-Object SwitchType -eq 'External' \
         | Select-Object -ExpandProperty Name",
        name = ps_quote(switch_name)
    )
}

fn firmware_query_script(name: &str) -> String {
    format!(
        "$f = Get-VMFirmware -VMName {vm}; \
         [pscustomobject]@{{ SecureBoot = [string]$f.SecureBoot; BootOrder = @($f.BootOrder | ForEach-Object {{ \
         [pscustomobject]@{{ BootType = [string]$_.BootType; \
         Disk = ($_.Device -is [Microsoft.HyperV.PowerShell.HardDiskDrive]); \
         Path = $_.Device.Path; Name = $_.Device.Name; Description = $_.Description }} }}) }} \
         | ConvertTo-Json -Compress -Depth 4",
        vm = ps_quote(name)
    )
}

fn set_firmware_script(name: &str, settings: &FirmwareSettings) -> String {
    let devices: Vec<String> = settings
        .boot_order
        .iter()
        .filter_map(|dev| match dev {
            BootDevice::HardDisk { path } => Some(format!(
                "(Get-VMHardDiskDrive -VMName $vm | Where-Object {{ $_.Path -eq {} }} | Select-Object -First 1)",
                ps_quote(&path.to_string_lossy())
            )),
            BootDevice::NetworkAdapter { name } => Some(format!(
                "(Get-VMNetworkAdapter -VMName $vm | Where-Object {{ $_.Name -eq {} }} | Select-Object -First 1)",
                ps_quote(name)
            )),
            BootDevice::Other { .. } => None,
        })
        .collect();
    format!(
        "$vm = {}; Set-VMFirmware -VMName $vm -EnableSecureBoot {} -BootOrder @({})",
        ps_quote(name),
        settings.secure_boot,
        devices.join(", ")
    )
}

/// Hyper-V on the local host
pub struct HyperV {
    program: PathBuf,
}

impl HyperV {
    pub fn new() -> Result<Self> {
        Ok(Self {
            program: pick_powershell()?,
        })
    }

    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }

    fn ps(&self) -> PowerShellBuilder {
        PowerShellBuilder::new(&self.program)
    }

    fn vms(&self, builder: PowerShellBuilder) -> Result<Vec<VmInfo>> {
        let out = builder.output()?;
        parse_json_list::<RawVm>(&out)?
            .into_iter()
            .map(RawVm::into_info)
            .collect()
    }
}

impl Hypervisor for HyperV {
    fn vm(&self, name: &str) -> Result<Option<VmInfo>> {
        let q = self
            .ps()
            .cmdlet("Get-VM")
            .arg("Name", name)
            .silently()
            .select_json("Name,Generation,State");
        Ok(self.vms(q).context("get_vm")?.into_iter().next())
    }

    fn list_vms(&self, pattern: &str) -> Result<Vec<VmInfo>> {
        let q = self
            .ps()
            .cmdlet("Get-VM")
            .select_json("Name,Generation,State");
        Ok(self
            .vms(q)
            .context("list_vms")?
            .into_iter()
            .filter(|vm| name_matches(&vm.name, pattern))
            .collect())
    }

    fn create_vm(&self, args: &NewVm<'_>) -> Result<()> {
        self.ps()
            .cmdlet("New-VM")
            .arg("Name", args.name)
            .arg_string("Generation", args.generation)
            .arg_string("MemoryStartupBytes", args.memory_bytes)
            .arg_opt("SwitchName", args.switch_name)
            .flag("NoVHD")
            .finish()
            .run()
            .context("new_vm")
    }

    fn delete_vm(&self, name: &str) -> Result<()> {
        self.ps()
            .cmdlet("Remove-VM")
            .arg("Name", name)
            .flag("Force")
            .finish()
            .run()
            .context("remove_vm")
    }

    fn start_vm(&self, name: &str) -> Result<()> {
        self.ps()
            .cmdlet("Start-VM")
            .arg("Name", name)
            .finish()
            .run()
            .context("start_vm")
    }

    fn stop_vm(&self, name: &str, force: bool) -> Result<()> {
        self.ps()
            .cmdlet("Stop-VM")
            .arg("Name", name)
            .flag("Force")
            .flag_opt(force.then_some("TurnOff"))
            .finish()
            .run()
            .context("stop_vm")
    }

    fn automatic_checkpoints_enabled(&self, name: &str) -> Result<bool> {
        let out = self
            .ps()
            .cmdlet("Get-VM")
            .arg("Name", name)
            .expand_property("AutomaticCheckpointsEnabled")
            .output()
            .context("get_automatic_checkpoints")?;
        Ok(out.trim().eq_ignore_ascii_case("true"))
    }

    fn set_automatic_checkpoints(&self, name: &str, enabled: bool) -> Result<()> {
        self.ps()
            .cmdlet("Set-VM")
            .arg("Name", name)
            .arg_raw("AutomaticCheckpointsEnabled", ps_bool(enabled))
            .finish()
            .run()
            .context("set_automatic_checkpoints")
    }

    fn processor(&self, name: &str) -> Result<ProcessorSettings> {
        let out = self
            .ps()
            .cmdlet("Get-VMProcessor")
            .arg("VMName", name)
            .select_json("Count,ExposeVirtualizationExtensions")
            .output()
            .context("get_vm_processor")?;
        let raw = parse_json_list::<RawProcessor>(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no processor settings for '{name}'"))?;
        Ok(ProcessorSettings {
            count: raw.count,
            expose_virtualization_extensions: raw.expose_virtualization_extensions,
        })
    }

    fn set_processor(
        &self,
        name: &str,
        count: Option<u32>,
        expose_virtualization_extensions: Option<bool>,
    ) -> Result<()> {
        self.ps()
            .cmdlet("Set-VMProcessor")
            .arg("VMName", name)
            .arg_opt_string("Count", count)
            .arg_opt_string(
                "ExposeVirtualizationExtensions",
                expose_virtualization_extensions.map(ps_bool),
            )
            .finish()
            .run()
            .context("set_vm_processor")
    }

    fn create_disk_image(&self, path: &Path, size_bytes: u64) -> Result<()> {
        self.ps()
            .cmdlet("New-VHD")
            .arg_path("Path", path)
            .arg_string("SizeBytes", size_bytes)
            .flag("Dynamic")
            .finish()
            .run()
            .context("new_vhd")
    }

    fn attached_disks(&self, name: &str) -> Result<Vec<PathBuf>> {
        let out = self
            .ps()
            .cmdlet("Get-VMHardDiskDrive")
            .arg("VMName", name)
            .expand_property("Path")
            .output()
            .context("get_vm_hard_disk_drive")?;
        Ok(output_lines(&out).into_iter().map(PathBuf::from).collect())
    }

    fn attach_disk(&self, name: &str, path: &Path) -> Result<()> {
        self.ps()
            .cmdlet("Add-VMHardDiskDrive")
            .arg("VMName", name)
            .arg_path("Path", path)
            .finish()
            .run()
            .context("add_vm_hard_disk_drive")
    }

    fn switch_exists(&self, switch_name: &str) -> Result<bool> {
        let out = self
            .ps()
            .script(external_switch_script(switch_name))
            .output()
            .context("get_vm_switch")?;
        Ok(!output_lines(&out).is_empty())
    }

    fn network_adapter(&self, name: &str) -> Result<Option<NetworkAdapter>> {
        let out = self
            .ps()
            .cmdlet("Get-VMNetworkAdapter")
            .arg("VMName", name)
            .select_json("Name,SwitchName")
            .output()
            .context("get_vm_network_adapter")?;
        Ok(parse_json_list::<RawAdapter>(&out)?
            .into_iter()
            .next()
            .map(|a| NetworkAdapter {
                name: a.name,
                switch_name: a.switch_name.filter(|s| !s.is_empty()),
            }))
    }

    fn connect_adapter(&self, name: &str, switch_name: &str) -> Result<()> {
        self.ps()
            .cmdlet("Get-VMNetworkAdapter")
            .arg("VMName", name)
            .pipeline()
            .cmdlet("Select-Object")
            .arg_raw("First", "1")
            .pipeline()
            .cmdlet("Connect-VMNetworkAdapter")
            .arg("SwitchName", switch_name)
            .finish()
            .run()
            .context("connect_vm_network_adapter")
    }

    fn firmware(&self, name: &str) -> Result<FirmwareSettings> {
        let out = self
            .ps()
            .script(firmware_query_script(name))
            .output()
            .context("get_vm_firmware")?;
        parse_firmware(&out)
    }

    fn set_firmware(&self, name: &str, settings: &FirmwareSettings) -> Result<()> {
        self.ps()
            .script(set_firmware_script(name, settings))
            .run()
            .context("set_vm_firmware")
    }

    fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>> {
        let out = self
            .ps()
            .script(format!(
                "Get-VMSnapshot -VMName {} | ForEach-Object {{ [pscustomobject]@{{ Id = [string]$_.Id; Name = $_.Name }} }} | ConvertTo-Json -Compress",
                ps_quote(name)
            ))
            .output()
            .context("get_vm_snapshot")?;
        Ok(parse_json_list::<RawSnapshot>(&out)?
            .into_iter()
            .map(|s| Snapshot {
                id: s.id,
                name: s.name,
            })
            .collect())
    }

    fn delete_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        self.ps()
            .script(format!(
                "Get-VMSnapshot -VMName {} | Where-Object {{ [string]$_.Id -eq {} }} | Remove-VMSnapshot",
                ps_quote(name),
                ps_quote(&snapshot.id)
            ))
            .run()
            .context("remove_vm_snapshot")
    }
}
