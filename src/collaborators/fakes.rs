//! Deterministic in-memory collaborator implementations, used by integration
//! tests to drive the orchestrator end to end without a real cluster,
//! storage agent, or hypervisor-control agent behind it.
//!
//! Each fake wraps its state in a `Mutex` rather than trying to be lock-free;
//! tests care about observable behavior, not throughput.

use super::*;
use crate::error::MigrateError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct DbState {
    vms: HashMap<VmRef, Vm>,
    vbds: HashMap<VmRef, Vec<Vbd>>,
    vdis: HashMap<VdiRef, Vdi>,
    srs: HashMap<SrRef, Sr>,
    vifs: HashMap<VmRef, Vec<Vif>>,
    vgpus: HashMap<VmRef, Vec<Vgpu>>,
    snapshots: HashMap<VmRef, Vec<Vm>>,
    hosts_by_uuid: HashMap<String, HostRef>,
    host_platform_versions: HashMap<HostRef, Vec<u32>>,
    host_hardware_platform_versions: HashMap<HostRef, u32>,
    host_enabled: HashMap<HostRef, bool>,
    host_free_cpus: HashMap<HostRef, u32>,
    licensed_for_storage_motion: bool,
    pool_suspend_image_sr: Option<SrRef>,
    pbd_plugged: HashMap<(SrRef, HostRef), bool>,
    vgpu_pci: HashMap<VgpuRef, String>,
    network_bridges: HashMap<NetworkRef, String>,
    stamped_vdi_map: HashMap<VdiRef, VdiRef>,
    stamped_vif_network: HashMap<VifRef, NetworkRef>,
    stamped_vgpu_group: HashMap<VgpuRef, GpuGroupRef>,
}

/// In-memory [`Database`] fake. Construct with [`FakeDatabase::new`] and
/// populate via the `with_*` builder methods before handing it to the
/// orchestrator.
pub struct FakeDatabase {
    state: Mutex<DbState>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DbState {
                licensed_for_storage_motion: true,
                ..Default::default()
            }),
        }
    }

    pub fn put_vm(&self, vm: Vm) {
        self.state.lock().unwrap().vms.insert(vm.vm_ref.clone(), vm);
    }

    pub fn put_vbds(&self, vm: VmRef, vbds: Vec<Vbd>) {
        self.state.lock().unwrap().vbds.insert(vm, vbds);
    }

    pub fn put_vdi(&self, vdi: Vdi) {
        self.state
            .lock()
            .unwrap()
            .vdis
            .insert(vdi.vdi_ref.clone(), vdi);
    }

    pub fn put_sr(&self, sr: Sr) {
        self.state.lock().unwrap().srs.insert(sr.sr_ref.clone(), sr);
    }

    pub fn put_vifs(&self, vm: VmRef, vifs: Vec<Vif>) {
        self.state.lock().unwrap().vifs.insert(vm, vifs);
    }

    pub fn put_vgpus(&self, vm: VmRef, vgpus: Vec<Vgpu>) {
        self.state.lock().unwrap().vgpus.insert(vm, vgpus);
    }

    pub fn put_host(&self, uuid: &str, host: HostRef, platform_version: Vec<u32>, enabled: bool) {
        let mut s = self.state.lock().unwrap();
        s.hosts_by_uuid.insert(uuid.to_string(), host.clone());
        s.host_platform_versions
            .insert(host.clone(), platform_version);
        s.host_enabled.insert(host.clone(), enabled);
        s.host_free_cpus.insert(host, 16);
    }

    pub fn set_host_hardware_platform_version(&self, host: HostRef, version: u32) {
        self.state
            .lock()
            .unwrap()
            .host_hardware_platform_versions
            .insert(host, version);
    }

    pub fn set_licensed_for_storage_motion(&self, licensed: bool) {
        self.state.lock().unwrap().licensed_for_storage_motion = licensed;
    }

    pub fn set_pool_suspend_image_sr(&self, sr: SrRef) {
        self.state.lock().unwrap().pool_suspend_image_sr = Some(sr);
    }

    pub fn set_pbd_plugged(&self, sr: SrRef, host: HostRef, plugged: bool) {
        self.state
            .lock()
            .unwrap()
            .pbd_plugged
            .insert((sr, host), plugged);
    }

    pub fn set_vgpu_pci_address(&self, vgpu: VgpuRef, pci: &str) {
        self.state
            .lock()
            .unwrap()
            .vgpu_pci
            .insert(vgpu, pci.to_string());
    }

    pub fn set_network_bridge(&self, network: NetworkRef, bridge: &str) {
        self.state
            .lock()
            .unwrap()
            .network_bridges
            .insert(network, bridge.to_string());
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn get_vm(&self, vm: &VmRef) -> Result<Vm> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| MigrateError::VmNotFound(vm.to_string()))
    }

    async fn get_vbds(&self, vm: &VmRef) -> Result<Vec<Vbd>> {
        Ok(self.state.lock().unwrap().vbds.get(vm).cloned().unwrap_or_default())
    }

    async fn get_vdi(&self, vdi: &VdiRef) -> Result<Vdi> {
        self.state
            .lock()
            .unwrap()
            .vdis
            .get(vdi)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("VDI {}", vdi)))
    }

    async fn get_sr(&self, sr: &SrRef) -> Result<Sr> {
        self.state
            .lock()
            .unwrap()
            .srs
            .get(sr)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("SR {}", sr)))
    }

    async fn get_vifs(&self, vm: &VmRef) -> Result<Vec<Vif>> {
        Ok(self.state.lock().unwrap().vifs.get(vm).cloned().unwrap_or_default())
    }

    async fn get_vgpus(&self, vm: &VmRef) -> Result<Vec<Vgpu>> {
        Ok(self.state.lock().unwrap().vgpus.get(vm).cloned().unwrap_or_default())
    }

    async fn get_snapshots(&self, vm: &VmRef) -> Result<Vec<Vm>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshots
            .get(vm)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_host_by_uuid(&self, uuid: &str) -> Result<Option<HostRef>> {
        Ok(self.state.lock().unwrap().hosts_by_uuid.get(uuid).cloned())
    }

    async fn host_platform_version(&self, host: &HostRef) -> Result<Vec<u32>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .host_platform_versions
            .get(host)
            .cloned()
            .unwrap_or_else(|| vec![1, 0, 0]))
    }

    async fn host_enabled(&self, host: &HostRef) -> Result<bool> {
        Ok(*self.state.lock().unwrap().host_enabled.get(host).unwrap_or(&true))
    }

    async fn host_free_cpus(&self, host: &HostRef) -> Result<u32> {
        Ok(*self.state.lock().unwrap().host_free_cpus.get(host).unwrap_or(&0))
    }

    async fn host_hardware_platform_version(&self, host: &HostRef) -> Result<u32> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .host_hardware_platform_versions
            .get(host)
            .unwrap_or(&1))
    }

    async fn licensed_for_storage_motion(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().licensed_for_storage_motion)
    }

    async fn pool_suspend_image_sr(&self) -> Result<Option<SrRef>> {
        Ok(self.state.lock().unwrap().pool_suspend_image_sr.clone())
    }

    async fn host_suspend_image_sr(&self, _host: &HostRef) -> Result<Option<SrRef>> {
        Ok(self.state.lock().unwrap().pool_suspend_image_sr.clone())
    }

    async fn pool_default_sr(&self) -> Result<Option<SrRef>> {
        Ok(self.state.lock().unwrap().srs.keys().next().cloned())
    }

    async fn network_bridge_name(&self, network: &NetworkRef) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .network_bridges
            .get(network)
            .cloned()
            .unwrap_or_else(|| format!("xenbr-{}", network.0)))
    }

    async fn scheduled_pgpu_pci_address(&self, vgpu: &VgpuRef) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .vgpu_pci
            .get(vgpu)
            .cloned()
            .ok_or_else(|| MigrateError::VgpuMapping(format!("no scheduled PGPU for {}", vgpu)))
    }

    async fn vgpu_sriov_vf_pci_address(&self, _vgpu: &VgpuRef) -> Result<Option<String>> {
        Ok(None)
    }

    async fn pbd_plugged(&self, sr: &SrRef, host: &HostRef) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .pbd_plugged
            .get(&(sr.clone(), host.clone()))
            .unwrap_or(&true))
    }

    async fn set_vbd_vdi(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        for vbds in s.vbds.values_mut() {
            if let Some(b) = vbds.iter_mut().find(|b| &b.vbd_ref == vbd) {
                b.vdi = Some(vdi.clone());
            }
        }
        Ok(())
    }

    async fn set_vm_suspend_vdi(&self, vm: &VmRef, vdi: Option<VdiRef>) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(v) = s.vms.get_mut(vm) {
            v.suspend_vdi = vdi;
        }
        Ok(())
    }

    async fn clear_vm_suspend_sr(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn copy_vdi_other_config_keys(
        &self,
        _from: &VdiRef,
        _to: &VdiRef,
        _keys: &[&str],
    ) -> Result<()> {
        Ok(())
    }

    async fn stamp_vdi_storage_migrate_map(&self, vdi: &VdiRef, remote: &VdiRef) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .stamped_vdi_map
            .insert(vdi.clone(), remote.clone());
        Ok(())
    }

    async fn unstamp_vdi_storage_migrate_map(&self, vdi: &VdiRef) -> Result<()> {
        self.state.lock().unwrap().stamped_vdi_map.remove(vdi);
        Ok(())
    }

    async fn stamp_vif_remote_network(&self, vif: &VifRef, network: &NetworkRef) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .stamped_vif_network
            .insert(vif.clone(), network.clone());
        Ok(())
    }

    async fn unstamp_vif_remote_network(&self, vif: &VifRef) -> Result<()> {
        self.state.lock().unwrap().stamped_vif_network.remove(vif);
        Ok(())
    }

    async fn stamp_vgpu_remote_gpu_group(
        &self,
        vgpu: &VgpuRef,
        group: &GpuGroupRef,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .stamped_vgpu_group
            .insert(vgpu.clone(), group.clone());
        Ok(())
    }

    async fn unstamp_vgpu_remote_gpu_group(&self, vgpu: &VgpuRef) -> Result<()> {
        self.state.lock().unwrap().stamped_vgpu_group.remove(vgpu);
        Ok(())
    }

    async fn eject_cd(&self, vbd: &VbdRef) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        for vbds in s.vbds.values_mut() {
            if let Some(b) = vbds.iter_mut().find(|b| &b.vbd_ref == vbd) {
                b.vdi = None;
            }
        }
        Ok(())
    }

    async fn destroy_vbd(&self, vbd: &VbdRef) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        for vbds in s.vbds.values_mut() {
            vbds.retain(|b| &b.vbd_ref != vbd);
        }
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        self.state.lock().unwrap().vms.remove(vm);
        Ok(())
    }

    async fn destroy_vtpms(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn set_vm_power_state(&self, vm: &VmRef, state: PowerState) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(v) = s.vms.get_mut(vm) {
            v.power_state = state;
        }
        Ok(())
    }
}

#[derive(Default)]
struct StorageState {
    attached: HashMap<DatapathHandle, (SrRef, VdiRef)>,
    tasks: HashMap<String, StorageTaskOutcome>,
    mirrors: HashMap<String, MirrorStat>,
    next_id: AtomicU64,
}

/// In-memory [`StorageAgent`] fake. Every `data_copy`/`mirror_start` call
/// completes synchronously; `wait_for_task` just looks the outcome up.
pub struct FakeStorageAgent {
    state: Mutex<StorageState>,
    /// VDI locations to report as the destination result, keyed by source
    /// VDI location. Tests populate this so the mirror planner sees a
    /// believable destination location back.
    pub dest_locations: Mutex<HashMap<String, String>>,
}

impl Default for FakeStorageAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStorageAgent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StorageState::default()),
            dest_locations: Mutex::new(HashMap::new()),
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.state.lock().unwrap().next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", prefix, n)
    }
}

#[async_trait]
impl StorageAgent for FakeStorageAgent {
    async fn vdi_attach3(
        &self,
        sr: &SrRef,
        vdi: &VdiRef,
        _read_write: bool,
    ) -> Result<DatapathHandle> {
        let dp = DatapathHandle(self.fresh_id("dp"));
        self.state
            .lock()
            .unwrap()
            .attached
            .insert(dp.clone(), (sr.clone(), vdi.clone()));
        Ok(dp)
    }

    async fn vdi_activate3(&self, _dp: &DatapathHandle, _read_write: bool) -> Result<()> {
        Ok(())
    }

    async fn dp_destroy(&self, dp: &DatapathHandle, _allow_leak: bool) -> Result<()> {
        self.state.lock().unwrap().attached.remove(dp);
        Ok(())
    }

    async fn data_copy(
        &self,
        _src_sr: &SrRef,
        src_vdi: &VdiRef,
        _copy_vm: &str,
        _sm_url: &str,
        _dest_sr: &SrRef,
        _intra_pool: bool,
    ) -> Result<TaskHandle> {
        let task = TaskHandle(self.fresh_id("task"));
        let dest_location = self
            .dest_locations
            .lock()
            .unwrap()
            .get(&src_vdi.0)
            .cloned()
            .unwrap_or_else(|| format!("dest-{}", src_vdi.0));
        self.state.lock().unwrap().tasks.insert(
            task.0.clone(),
            StorageTaskOutcome::Copy {
                remote_vdi_location: dest_location,
            },
        );
        Ok(task)
    }

    async fn mirror_start(
        &self,
        _src_sr: &SrRef,
        src_vdi: &VdiRef,
        _dp: &DatapathHandle,
        _mirror_vm: &str,
        _copy_vm: &str,
        _sm_url: &str,
        _dest_sr: &SrRef,
        _intra_pool: bool,
    ) -> Result<TaskHandle> {
        let task = TaskHandle(self.fresh_id("task"));
        let mirror_id = self.fresh_id("mirror");
        let dest_location = self
            .dest_locations
            .lock()
            .unwrap()
            .get(&src_vdi.0)
            .cloned()
            .unwrap_or_else(|| format!("dest-{}", src_vdi.0));
        let mut s = self.state.lock().unwrap();
        s.mirrors.insert(
            mirror_id.clone(),
            MirrorStat {
                dest_vdi_location: dest_location,
            },
        );
        s.tasks
            .insert(task.0.clone(), StorageTaskOutcome::Mirror { mirror_id });
        Ok(task)
    }

    async fn mirror_stop(&self, mirror_id: &str) -> Result<()> {
        self.state.lock().unwrap().mirrors.remove(mirror_id);
        Ok(())
    }

    async fn mirror_stat(&self, mirror_id: &str) -> Result<MirrorStat> {
        self.state
            .lock()
            .unwrap()
            .mirrors
            .get(mirror_id)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("mirror {}", mirror_id)))
    }

    async fn update_snapshot_info_src(
        &self,
        _src_sr: &SrRef,
        _src_leaf_vdi: &VdiRef,
        _sm_url: &str,
        _dst_sr: &SrRef,
        _dst_leaf_vdi: &VdiRef,
        _snapshot_pairs: &[(VdiRef, VdiRef)],
        _verify_dest: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn wait_for_task(&self, _dbg: &str, task: &TaskHandle) -> Result<StorageTaskOutcome> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&task.0)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("task {}", task)))
    }

    async fn task_fraction_complete(&self, _task: &TaskHandle) -> Result<f32> {
        Ok(1.0)
    }
}

/// In-memory [`HypervisorAgent`] fake. `vm_migrate` always succeeds unless
/// primed with [`FakeHypervisorAgent::fail_next`].
#[derive(Default)]
pub struct FakeHypervisorAgent {
    next_id: AtomicU64,
    fail_next: Mutex<Option<AgentFault>>,
}

impl FakeHypervisorAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `vm_migrate` call returns this fault instead of succeeding.
    pub fn fail_next(&self, fault: AgentFault) {
        *self.fail_next.lock().unwrap() = Some(fault);
    }
}

#[async_trait]
impl HypervisorAgent for FakeHypervisorAgent {
    async fn vm_migrate(
        &self,
        _dbg: &str,
        _req: &MemoryMigrateRequest,
    ) -> std::result::Result<TaskHandle, AgentFault> {
        if let Some(fault) = self.fail_next.lock().unwrap().take() {
            return Err(fault);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TaskHandle(format!("memtask-{}", n)))
    }

    async fn sync_with_task(
        &self,
        _dbg: &str,
        _task: &TaskHandle,
    ) -> std::result::Result<(), AgentFault> {
        Ok(())
    }

    async fn vm_stat(&self, _dbg: &str, _uuid: &str) -> Result<PowerState> {
        Ok(PowerState::Running)
    }

    async fn suppress_events(&self, _vm_uuid: &str) -> Result<()> {
        Ok(())
    }

    async fn resume_events(&self, _vm_uuid: &str) -> Result<()> {
        Ok(())
    }

    async fn forget_cached_metadata(&self, _vm_uuid: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MgmtState {
    vdis_by_location: HashMap<(SrRef, String), VdiRef>,
    vms_by_uuid: HashMap<String, VmRef>,
    hosts_by_uuid: HashMap<String, HostRef>,
}

/// In-memory [`ManagementPlaneClient`] fake standing in for the destination's
/// management plane, whether same-pool or cross-cluster.
pub struct FakeManagementPlaneClient {
    state: Mutex<MgmtState>,
    next_id: AtomicU64,
}

impl Default for FakeManagementPlaneClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeManagementPlaneClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MgmtState::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn put_host(&self, uuid: &str, host: HostRef) {
        self.state.lock().unwrap().hosts_by_uuid.insert(uuid.to_string(), host);
    }

    pub fn put_vdi_at_location(&self, sr: SrRef, location: &str, vdi: VdiRef) {
        self.state
            .lock()
            .unwrap()
            .vdis_by_location
            .insert((sr, location.to_string()), vdi);
    }
}

#[async_trait]
impl ManagementPlaneClient for FakeManagementPlaneClient {
    async fn host_ref_for_uuid(&self, uuid: &str) -> Result<Option<HostRef>> {
        Ok(self.state.lock().unwrap().hosts_by_uuid.get(uuid).cloned())
    }

    async fn host_enabled(&self, _host: &HostRef) -> Result<bool> {
        Ok(true)
    }

    async fn host_free_cpus(&self, _host: &HostRef) -> Result<u32> {
        Ok(16)
    }

    async fn plug_pbd(&self, _sr: &SrRef, _host: &HostRef) -> Result<()> {
        Ok(())
    }

    async fn pbd_plugged(&self, _sr: &SrRef, _host: &HostRef) -> Result<bool> {
        Ok(true)
    }

    async fn scan_sr(&self, _sr: &SrRef) -> Result<()> {
        Ok(())
    }

    async fn find_vdi_by_location(&self, sr: &SrRef, location: &str) -> Result<VdiRef> {
        self.state
            .lock()
            .unwrap()
            .vdis_by_location
            .get(&(sr.clone(), location.to_string()))
            .cloned()
            .ok_or_else(|| MigrateError::VdiLocationMissing(location.to_string()))
    }

    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .vdis_by_location
            .retain(|_, v| v != vdi);
        Ok(())
    }

    async fn vm_ref_with_uuid(&self, uuid: &str) -> Result<Option<VmRef>> {
        Ok(self.state.lock().unwrap().vms_by_uuid.get(uuid).cloned())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        self.state.lock().unwrap().vms_by_uuid.retain(|_, v| v != vm);
        Ok(())
    }

    async fn dry_run_import(&self, _export: &VmExport) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn import_vm(&self, export: &VmExport) -> Result<VmRef> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let vm_ref = VmRef(format!("imported-vm-{}", n));
        let uuid = format!("{}-imported", export.vm);
        self.state
            .lock()
            .unwrap()
            .vms_by_uuid
            .insert(uuid, vm_ref.clone());
        Ok(vm_ref)
    }

    async fn pool_migrate_complete(&self, _vm: &VmRef, _host: &HostRef) -> Result<()> {
        Ok(())
    }

    async fn set_ha_always_run(&self, _vm: &VmRef, _value: bool) -> Result<()> {
        Ok(())
    }

    async fn send_pool_messages(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn push_blobs(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn transfer_rrds(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn detach_networks(&self, _vm: &VmRef) -> Result<()> {
        Ok(())
    }

    async fn remap_vbd(&self, _vbd: &VbdRef, _vdi: &VdiRef) -> Result<()> {
        Ok(())
    }
}
