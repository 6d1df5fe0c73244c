pub mod firmware;
pub mod hyperv;
pub mod hypervisor;
pub mod memory;
pub mod naming;
pub mod powershell;
pub mod provisioner;
pub mod reclaimer;
pub mod reconciler;
