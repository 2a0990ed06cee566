//! Trait-object contracts for every external collaborator the orchestrator
//! talks to: the cluster database, the storage agent (SMAPI), the
//! hypervisor-control agent (XenopsAPI), and the destination's management
//! plane. None of these are implemented here in production form — per the
//! scope note, they're external systems; this module only pins down the
//! interface each deployment wires a concrete transport against.
//!
//! Each deployment constructs `Arc<dyn Database>`, `Arc<dyn StorageAgent>`,
//! `Arc<dyn HypervisorAgent>`, and `Arc<dyn ManagementPlaneClient>` and hands
//! them to [`crate::orchestrator::Orchestrator::new`]. The `test-utils`
//! feature additionally exposes deterministic in-memory fakes under
//! [`fakes`] so the orchestrator's phases can be driven end to end in tests.

use crate::Result;
use crate::model::*;
use async_trait::async_trait;
use std::collections::HashMap;

#[cfg(any(test, feature = "test-utils"))]
pub mod fakes;

/// Contract for the cluster database: read access to the object graph plus
/// the handful of writes the orchestrator performs directly (stamping
/// auxiliary keys, remapping references, destroying objects it owns).
#[async_trait]
pub trait Database: Send + Sync {
    async fn get_vm(&self, vm: &VmRef) -> Result<Vm>;
    async fn get_vbds(&self, vm: &VmRef) -> Result<Vec<Vbd>>;
    async fn get_vdi(&self, vdi: &VdiRef) -> Result<Vdi>;
    async fn get_sr(&self, sr: &SrRef) -> Result<Sr>;
    async fn get_vifs(&self, vm: &VmRef) -> Result<Vec<Vif>>;
    async fn get_vgpus(&self, vm: &VmRef) -> Result<Vec<Vgpu>>;
    async fn get_snapshots(&self, vm: &VmRef) -> Result<Vec<Vm>>;

    async fn resolve_host_by_uuid(&self, uuid: &str) -> Result<Option<HostRef>>;
    async fn host_platform_version(&self, host: &HostRef) -> Result<Vec<u32>>;
    async fn host_enabled(&self, host: &HostRef) -> Result<bool>;
    async fn host_free_cpus(&self, host: &HostRef) -> Result<u32>;
    async fn host_hardware_platform_version(&self, host: &HostRef) -> Result<u32>;

    async fn licensed_for_storage_motion(&self) -> Result<bool>;
    async fn pool_suspend_image_sr(&self) -> Result<Option<SrRef>>;
    async fn host_suspend_image_sr(&self, host: &HostRef) -> Result<Option<SrRef>>;
    async fn pool_default_sr(&self) -> Result<Option<SrRef>>;
    /// The destination bridge name a VIF's network is realized as, for the
    /// hypervisor-agent's VIF device -> bridge map.
    async fn network_bridge_name(&self, network: &NetworkRef) -> Result<String>;

    /// The PCI address of the PGPU the VGPU is *scheduled* to be resident on
    /// (not `resident_on` — scheduling happens before the memory migrate).
    /// Fails if the VGPU has lost its PGPU (e.g. the guest shut down).
    async fn scheduled_pgpu_pci_address(&self, vgpu: &VgpuRef) -> Result<String>;
    /// An additional SR-IOV virtual-function PCI address, if the VGPU has one.
    async fn vgpu_sriov_vf_pci_address(&self, vgpu: &VgpuRef) -> Result<Option<String>>;

    async fn pbd_plugged(&self, sr: &SrRef, host: &HostRef) -> Result<bool>;

    async fn set_vbd_vdi(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<()>;
    async fn set_vm_suspend_vdi(&self, vm: &VmRef, vdi: Option<VdiRef>) -> Result<()>;
    async fn clear_vm_suspend_sr(&self, vm: &VmRef) -> Result<()>;
    async fn copy_vdi_other_config_keys(
        &self,
        from: &VdiRef,
        to: &VdiRef,
        keys: &[&str],
    ) -> Result<()>;

    async fn stamp_vdi_storage_migrate_map(&self, vdi: &VdiRef, remote: &VdiRef) -> Result<()>;
    async fn unstamp_vdi_storage_migrate_map(&self, vdi: &VdiRef) -> Result<()>;
    async fn stamp_vif_remote_network(&self, vif: &VifRef, network: &NetworkRef) -> Result<()>;
    async fn unstamp_vif_remote_network(&self, vif: &VifRef) -> Result<()>;
    async fn stamp_vgpu_remote_gpu_group(&self, vgpu: &VgpuRef, group: &GpuGroupRef)
    -> Result<()>;
    async fn unstamp_vgpu_remote_gpu_group(&self, vgpu: &VgpuRef) -> Result<()>;

    async fn eject_cd(&self, vbd: &VbdRef) -> Result<()>;
    async fn destroy_vbd(&self, vbd: &VbdRef) -> Result<()>;
    async fn destroy_vm(&self, vm: &VmRef) -> Result<()>;
    async fn destroy_vtpms(&self, vm: &VmRef) -> Result<()>;
    async fn set_vm_power_state(&self, vm: &VmRef, state: PowerState) -> Result<()>;
}

/// Outcome of a completed storage-agent task.
#[derive(Debug, Clone)]
pub enum StorageTaskOutcome {
    Mirror { mirror_id: String },
    Copy { remote_vdi_location: String },
}

#[derive(Debug, Clone)]
pub struct MirrorStat {
    pub dest_vdi_location: String,
}

/// Contract for the storage agent (SMAPI).
#[async_trait]
pub trait StorageAgent: Send + Sync {
    async fn vdi_attach3(&self, sr: &SrRef, vdi: &VdiRef, read_write: bool)
    -> Result<DatapathHandle>;
    async fn vdi_activate3(&self, dp: &DatapathHandle, read_write: bool) -> Result<()>;
    async fn dp_destroy(&self, dp: &DatapathHandle, allow_leak: bool) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn data_copy(
        &self,
        src_sr: &SrRef,
        src_vdi: &VdiRef,
        copy_vm: &str,
        sm_url: &str,
        dest_sr: &SrRef,
        intra_pool: bool,
    ) -> Result<TaskHandle>;

    #[allow(clippy::too_many_arguments)]
    async fn mirror_start(
        &self,
        src_sr: &SrRef,
        src_vdi: &VdiRef,
        dp: &DatapathHandle,
        mirror_vm: &str,
        copy_vm: &str,
        sm_url: &str,
        dest_sr: &SrRef,
        intra_pool: bool,
    ) -> Result<TaskHandle>;
    async fn mirror_stop(&self, mirror_id: &str) -> Result<()>;
    async fn mirror_stat(&self, mirror_id: &str) -> Result<MirrorStat>;

    #[allow(clippy::too_many_arguments)]
    async fn update_snapshot_info_src(
        &self,
        src_sr: &SrRef,
        src_leaf_vdi: &VdiRef,
        sm_url: &str,
        dst_sr: &SrRef,
        dst_leaf_vdi: &VdiRef,
        snapshot_pairs: &[(VdiRef, VdiRef)],
        verify_dest: bool,
    ) -> Result<()>;

    async fn wait_for_task(&self, dbg: &str, task: &TaskHandle) -> Result<StorageTaskOutcome>;
    async fn task_fraction_complete(&self, task: &TaskHandle) -> Result<f32>;
}

/// A memory-migration request handed to the hypervisor-control agent.
#[derive(Debug, Clone)]
pub struct MemoryMigrateRequest {
    pub vm_uuid: String,
    /// local xenops disk locator -> remote xenops disk locator
    pub vdi_locator_map: HashMap<String, String>,
    /// VIF device -> destination bridge name
    pub vif_map: HashMap<String, String>,
    /// vGPU device label -> destination PCI address
    pub vgpu_map: HashMap<String, String>,
    pub xenops_url: String,
    pub compress: bool,
    pub verify_dest: bool,
}

/// The narrow set of hypervisor-agent faults the memory migration driver's
/// retry policy distinguishes; everything else is `Other` and aborts.
#[derive(Debug, Clone)]
pub enum AgentFault {
    /// `Cancelled`; `user_requested` distinguishes cooperative cancellation
    /// (no retry) from a guest-triggered cancel (retried).
    Cancelled { user_requested: bool },
    /// `Internal_error("End_of_file")` — the guest rebooted mid-migration.
    EndOfFile,
    Other(MigrateErrorRepr),
}

/// Boxed representation so `AgentFault::Other` doesn't need a cyclic
/// dependency on `crate::error::MigrateError` at the trait-definition site.
pub type MigrateErrorRepr = crate::error::MigrateError;

/// Contract for the hypervisor-control agent (XenopsAPI).
#[async_trait]
pub trait HypervisorAgent: Send + Sync {
    async fn vm_migrate(
        &self,
        dbg: &str,
        req: &MemoryMigrateRequest,
    ) -> std::result::Result<TaskHandle, AgentFault>;
    async fn sync_with_task(
        &self,
        dbg: &str,
        task: &TaskHandle,
    ) -> std::result::Result<(), AgentFault>;
    async fn vm_stat(&self, dbg: &str, uuid: &str) -> Result<PowerState>;

    /// Suppress VM state-change events on the source queue for `vm_uuid`.
    async fn suppress_events(&self, vm_uuid: &str) -> Result<()>;
    async fn resume_events(&self, vm_uuid: &str) -> Result<()>;
    async fn forget_cached_metadata(&self, vm_uuid: &str) -> Result<()>;
}

/// Parameters for the cross-cluster metadata export/import call.
#[derive(Debug, Clone)]
pub struct VmExport {
    pub vm: VmRef,
    pub dry_run: bool,
    pub live: bool,
    pub send_snapshots: bool,
    pub check_cpu: bool,
}

/// Contract for the destination's management plane. For an intra-cluster
/// destination this is backed by the same local database; for a
/// cross-cluster destination it is a genuine remote RPC client. See
/// [`fakes::FakeManagementPlaneClient`] for the in-memory test double.
#[async_trait]
pub trait ManagementPlaneClient: Send + Sync {
    async fn host_ref_for_uuid(&self, uuid: &str) -> Result<Option<HostRef>>;
    async fn host_enabled(&self, host: &HostRef) -> Result<bool>;
    async fn host_free_cpus(&self, host: &HostRef) -> Result<u32>;

    async fn plug_pbd(&self, sr: &SrRef, host: &HostRef) -> Result<()>;
    async fn pbd_plugged(&self, sr: &SrRef, host: &HostRef) -> Result<bool>;
    async fn scan_sr(&self, sr: &SrRef) -> Result<()>;
    async fn find_vdi_by_location(&self, sr: &SrRef, location: &str) -> Result<VdiRef>;
    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()>;

    async fn vm_ref_with_uuid(&self, uuid: &str) -> Result<Option<VmRef>>;
    async fn destroy_vm(&self, vm: &VmRef) -> Result<()>;

    async fn dry_run_import(&self, export: &VmExport) -> Result<Vec<String>>;
    async fn import_vm(&self, export: &VmExport) -> Result<VmRef>;
    async fn pool_migrate_complete(&self, vm: &VmRef, host: &HostRef) -> Result<()>;

    async fn set_ha_always_run(&self, vm: &VmRef, value: bool) -> Result<()>;
    async fn send_pool_messages(&self, vm: &VmRef) -> Result<()>;
    async fn push_blobs(&self, vm: &VmRef) -> Result<()>;
    async fn transfer_rrds(&self, vm: &VmRef) -> Result<()>;
    async fn detach_networks(&self, vm: &VmRef) -> Result<()>;
    async fn remap_vbd(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<()>;
}
