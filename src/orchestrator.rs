//! Top-level wiring: the cluster-facing RPCs (`migrate_send`,
//! `assert_can_migrate`, `pool_migrate`, `pool_migrate_complete`,
//! `vdi_pool_migrate`) that compose components A-I behind the
//! concurrency gate.
//!
//! Grounded on the teacher's `MigrationManager` (`migration.rs`): a struct
//! holding `Arc`s to its collaborators, with one public async method per
//! externally visible operation, each dispatched onto `spawn_blocking` for
//! the blocking collaborator calls per the concurrency model.

use crate::collaborators::{Database, HypervisorAgent, ManagementPlaneClient, MemoryMigrateRequest, StorageAgent};
use crate::config::EngineConfig;
use crate::dest_resolver;
use crate::error::MigrateError;
use crate::feasibility;
use crate::finalize::{self, FinalizeContext, RollbackContext};
use crate::map_inference;
use crate::memory_migration;
use crate::mirror::{self, ProgressAggregator};
use crate::model::{
    DestDescriptor, HostRef, MirrorRecord, NetworkRef, PowerState, SrRef, VdiRef, VgpuPciMapping,
    VifRef, Vm, VmRef,
};
use crate::throttle::MigrationThrottle;
use crate::Result;
use crate::{log_error, log_info};
use std::collections::HashMap;
use std::sync::Arc;

/// Owns the collaborator handles and the process-wide throttle. Clone is
/// cheap: everything inside is `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    db: Arc<dyn Database>,
    storage: Arc<dyn StorageAgent>,
    agent: Arc<dyn HypervisorAgent>,
    mgmt: Arc<dyn ManagementPlaneClient>,
    config: Arc<EngineConfig>,
    throttle: MigrationThrottle,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        storage: Arc<dyn StorageAgent>,
        agent: Arc<dyn HypervisorAgent>,
        mgmt: Arc<dyn ManagementPlaneClient>,
        config: EngineConfig,
    ) -> Self {
        let throttle = MigrationThrottle::new(config.max_concurrent_storage_migrations);
        Self {
            db,
            storage,
            agent,
            mgmt,
            config: Arc::new(config),
            throttle,
        }
    }

    /// `VM.assert_can_migrate` — dry-run validation only, no mutation.
    pub async fn assert_can_migrate(
        &self,
        vm_ref: &VmRef,
        dest: &HashMap<String, String>,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        let plan = self.resolve_plan(vm_ref, dest, vdi_map, vif_map, options).await?;
        let vm = self.db.get_vm(vm_ref).await?;
        let vbds = self.db.get_vbds(vm_ref).await?;
        let vdis_in_scope = self.vdis_in_scope(&vbds, &plan.vdi_requests_sr_map()).await?;

        feasibility::assert_can_migrate(
            self.db.as_ref(),
            self.mgmt.as_ref(),
            &self.config,
            &vm,
            &plan.dest,
            &vdis_in_scope,
            !vif_map.is_empty(),
            true,
            plan.options,
        )
        .await
    }

    /// `VM.migrate_send` — the primary cross-/intra-cluster migration RPC.
    pub async fn migrate_send(
        &self,
        vm_ref: &VmRef,
        dest: &HashMap<String, String>,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        options: &HashMap<String, String>,
    ) -> Result<VmRef> {
        let _permit = self.throttle.enter()?;
        log_info!("migrate_send starting for {}", vm_ref);

        let result = self.run_migration(vm_ref, dest, vdi_map, vif_map, options).await;

        match &result {
            Ok(dest_vm) => log_info!("migrate_send completed for {} -> {}", vm_ref, dest_vm),
            Err(e) => log_error!("migrate_send failed for {}: {}", vm_ref, e),
        }
        result
    }

    async fn run_migration(
        &self,
        vm_ref: &VmRef,
        dest: &HashMap<String, String>,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        options: &HashMap<String, String>,
    ) -> Result<VmRef> {
        let plan = self.resolve_plan(vm_ref, dest, vdi_map, vif_map, options).await?;
        self.assert_can_migrate(vm_ref, dest, vdi_map, vif_map, options).await?;

        let vm = self.db.get_vm(vm_ref).await?;
        let vbds = self.db.get_vbds(vm_ref).await?;
        let vifs = self.db.get_vifs(vm_ref).await?;
        let snapshots = self.db.get_snapshots(vm_ref).await?;

        mirror::eject_cds_before_mirror(self.db.as_ref(), &vm, &vbds, &plan.vdi_requests_sr_map())
            .await?;

        let allow_mirror: HashMap<VdiRef, bool> =
            plan.vdi_map.keys().map(|vdi| (vdi.clone(), true)).collect();
        let vdi_requests = mirror::build_plan(
            self.db.as_ref(),
            &vm,
            &snapshots,
            &vbds,
            &plan.vdi_map,
            &allow_mirror,
            !plan.dest.cross_cluster,
            false,
        )
        .await?;

        let mut records = Vec::new();
        let mut progress = ProgressAggregator::new(&vdi_requests);
        for req in &vdi_requests {
            match mirror::run_one(
                self.db.as_ref(),
                self.storage.as_ref(),
                self.mgmt.as_ref(),
                Some(&plan.dest.dest_host_ref),
                &vm_ref.0,
                req,
                !plan.dest.cross_cluster,
                &mut progress,
            )
            .await
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    let mirror_failed = self.mirror_failed_marker(vm_ref).await;
                    let rollback_ctx = self.rollback_ctx(vm_ref, &plan.dest, &records, mirror_failed);
                    let translated = finalize::rollback(rollback_ctx, e).await;
                    return Err(translated);
                }
            }
        }

        let dest_vm_ref = if plan.dest.cross_cluster {
            match crate::metadata_transfer::transfer(
                self.db.as_ref(),
                self.mgmt.as_ref(),
                vm_ref,
                &records,
                &vifs,
                &plan.vif_map,
                &plan.vgpu_map,
                vm.power_state == PowerState::Running,
                !plan.options.copy,
                !plan.options.force && vm.power_state != PowerState::Halted,
            )
            .await
            {
                Ok(imported) => imported,
                Err(e) => {
                    let mirror_failed = self.mirror_failed_marker(vm_ref).await;
                    let rollback_ctx = self.rollback_ctx(vm_ref, &plan.dest, &records, mirror_failed);
                    let translated = finalize::rollback(rollback_ctx, e).await;
                    return Err(translated);
                }
            }
        } else {
            vm_ref.clone()
        };

        let vdi_locator_map = records
            .iter()
            .map(|r| (r.local_xenops_locator.clone(), r.remote_xenops_locator.clone()))
            .collect();
        let mut vif_bridge_map = HashMap::new();
        for vif in &vifs {
            if let Some(network) = plan.vif_map.get(&vif.vif_ref) {
                let bridge = self.db.network_bridge_name(network).await?;
                vif_bridge_map.insert(vif.device.clone(), bridge);
            }
        }
        let vgpu_pci_map = plan
            .vgpu_map
            .iter()
            .flat_map(|m| m.local.iter().cloned())
            .collect();

        let mem_req = MemoryMigrateRequest {
            vm_uuid: vm.uuid.clone(),
            vdi_locator_map,
            vif_map: vif_bridge_map,
            vgpu_map: vgpu_pci_map,
            xenops_url: plan.dest.xenops_url.clone(),
            compress: plan.options.compress,
            verify_dest: true,
        };

        if let Err(e) = memory_migration::migrate_with_retry(self.agent.as_ref(), "migrate_send", &mem_req).await {
            let mirror_failed = self.mirror_failed_marker(vm_ref).await;
            let rollback_ctx = self.rollback_ctx(vm_ref, &plan.dest, &records, mirror_failed);
            let translated = finalize::rollback(rollback_ctx, e).await;
            return Err(translated);
        }

        mirror::replicate_snapshot_chains(
            self.storage.as_ref(),
            &records,
            &records.iter().map(|r| (r.source_vdi.clone(), r)).collect(),
            &HashMap::new(),
            !plan.dest.cross_cluster,
        )
        .await;

        let finalize_ctx = FinalizeContext {
            db: self.db.as_ref(),
            mgmt: self.mgmt.as_ref(),
            source_vm: vm_ref,
            dest_vm: &dest_vm_ref,
            dest_host: &plan.dest.dest_host_ref,
            cross_cluster: plan.dest.cross_cluster,
            copy: plan.options.copy,
            ha_was_enabled: vm.ha_always_run,
            records: &records,
        };
        finalize::commit(finalize_ctx).await?;

        Ok(dest_vm_ref)
    }

    /// `VM.pool_migrate` — intra-cluster live memory migration only, no
    /// storage transfer.
    pub async fn pool_migrate(
        &self,
        vm_ref: &VmRef,
        host: &HostRef,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        let _permit = self.throttle.enter()?;
        let vm = self.db.get_vm(vm_ref).await?;
        let parsed = feasibility::parse_options(options, &self.config)?;

        if !self.db.host_enabled(host).await? {
            return Err(MigrateError::HostDisabled(host.to_string()));
        }

        let mem_req = MemoryMigrateRequest {
            vm_uuid: vm.uuid.clone(),
            vdi_locator_map: HashMap::new(),
            vif_map: HashMap::new(),
            vgpu_map: HashMap::new(),
            xenops_url: String::new(),
            compress: parsed.compress,
            verify_dest: true,
        };
        memory_migration::migrate_with_retry(self.agent.as_ref(), "pool_migrate", &mem_req).await?;
        self.mgmt.pool_migrate_complete(vm_ref, host).await
    }

    /// `VM.pool_migrate_complete` — destination-side post-handler.
    pub async fn pool_migrate_complete(&self, vm_ref: &VmRef, host: &HostRef) -> Result<()> {
        self.mgmt.pool_migrate_complete(vm_ref, host).await
    }

    /// `VDI.pool_migrate` — move a single running-VM disk.
    pub async fn vdi_pool_migrate(
        &self,
        vdi_ref: &VdiRef,
        dest_sr: &SrRef,
        options: &HashMap<String, String>,
    ) -> Result<VdiRef> {
        let _permit = self.throttle.enter()?;
        let vdi = self.db.get_vdi(vdi_ref).await?;
        let parsed = feasibility::parse_options(options, &self.config)?;
        let _ = parsed;

        let req = crate::model::VdiMirrorRequest {
            vdi: vdi_ref.clone(),
            role: crate::model::VdiRole::Leaf { mirror: true },
            source_sr: vdi.sr.clone(),
            dest_sr: dest_sr.clone(),
            virtual_size: vdi.virtual_size,
            snapshot_time: vdi.snapshot_time,
            leaf_vdi: vdi_ref.clone(),
        };
        let mut progress = ProgressAggregator::new(std::slice::from_ref(&req));
        let vm_uuid = options
            .get("__internal__vm")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let record = mirror::run_one(
            self.db.as_ref(),
            self.storage.as_ref(),
            self.mgmt.as_ref(),
            None,
            &vm_uuid,
            &req,
            true,
            &mut progress,
        )
        .await?;
        Ok(record.remote_vdi_ref)
    }

    /// Reads the `mirror_failed` key the storage backend stamps on the VM's
    /// `other_config` when a mirror task fails out from under it, so rollback
    /// can classify the error as `mirror_failed` even when the triggering
    /// exception came from a later step (metadata transfer, memory migrate).
    async fn mirror_failed_marker(&self, vm_ref: &VmRef) -> Option<String> {
        self.db
            .get_vm(vm_ref)
            .await
            .ok()
            .and_then(|vm| vm.other_config.get("mirror_failed").cloned())
    }

    fn rollback_ctx<'a>(
        &'a self,
        vm_ref: &'a VmRef,
        dest: &DestDescriptor,
        records: &'a [MirrorRecord],
        mirror_failed: Option<String>,
    ) -> RollbackContext<'a> {
        RollbackContext {
            db: self.db.as_ref(),
            mgmt: self.mgmt.as_ref(),
            agent: self.agent.as_ref(),
            source_vm: vm_ref,
            cross_cluster: dest.cross_cluster,
            mirror_failed_other_config: mirror_failed,
            records,
        }
    }

    async fn resolve_plan(
        &self,
        vm_ref: &VmRef,
        dest: &HashMap<String, String>,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        options: &HashMap<String, String>,
    ) -> Result<ResolvedPlan> {
        let vm = self.db.get_vm(vm_ref).await?;
        let dest_descriptor = dest_resolver::resolve(
            self.db.as_ref(),
            &self.config,
            dest,
            vm.resident_on.as_ref(),
        )
        .await?;
        let parsed_options = feasibility::parse_options(options, &self.config)?;

        if parsed_options.copy && !dest_descriptor.cross_cluster {
            return Err(MigrateError::OperationNotAllowed(
                "copy=true is not supported for intra-cluster migration".to_string(),
            ));
        }

        let vifs = self.db.get_vifs(vm_ref).await?;
        let vgpus = self.db.get_vgpus(vm_ref).await?;

        let vif_map_completed = map_inference::complete_vif_map(&vifs, vif_map)?;
        let vgpu_map = map_inference::complete_vgpu_map(self.db.as_ref(), &vgpus).await?;

        let dest_default_sr = self.db.pool_default_sr().await?;
        let dest_pool_suspend_sr = self.db.pool_suspend_image_sr().await?;
        let dest_host_suspend_sr = self.db.host_suspend_image_sr(&dest_descriptor.dest_host_ref).await?;

        let mut resolved_vdi_map = vdi_map.clone();
        if let Some(suspend_vdi) = &vm.suspend_vdi {
            if !resolved_vdi_map.contains_key(suspend_vdi) {
                let vdi = self.db.get_vdi(suspend_vdi).await?;
                let sr = map_inference::complete_sr_for_vdi(
                    self.db.as_ref(),
                    &vdi,
                    true,
                    vdi_map,
                    dest_default_sr.clone(),
                    dest_pool_suspend_sr.clone(),
                    dest_host_suspend_sr.clone(),
                )
                .await?;
                resolved_vdi_map.insert(suspend_vdi.clone(), sr);
            }
        }

        Ok(ResolvedPlan {
            dest: dest_descriptor,
            options: parsed_options,
            vif_map: vif_map_completed,
            vgpu_map,
            vdi_map: resolved_vdi_map,
        })
    }

    async fn vdis_in_scope(
        &self,
        vbds: &[crate::model::Vbd],
        vdi_sr_map: &HashMap<VdiRef, SrRef>,
    ) -> Result<Vec<(crate::model::Vdi, VdiRef)>> {
        let mut scope = Vec::new();
        for vbd in vbds {
            if !vbd.is_leaf_disk() {
                continue;
            }
            if let Some(vdi_ref) = &vbd.vdi {
                let vdi = self.db.get_vdi(vdi_ref).await?;
                let dest_sr = vdi_sr_map.get(vdi_ref).cloned().unwrap_or_else(|| vdi.sr.clone());
                scope.push((vdi, dest_sr));
            }
        }
        Ok(scope)
    }
}

/// Intermediate plan resolution result. `vdi_requests` is populated later,
/// once the mirror planner has classified leaf/snapshot/suspend VDIs; this
/// struct only carries what map inference and the destination resolver
/// produce up front.
struct ResolvedPlan {
    dest: DestDescriptor,
    options: crate::model::MigrateOptions,
    vif_map: HashMap<VifRef, NetworkRef>,
    vgpu_map: Vec<VgpuPciMapping>,
    vdi_map: HashMap<VdiRef, SrRef>,
}

impl ResolvedPlan {
    fn vdi_requests_sr_map(&self) -> HashMap<VdiRef, SrRef> {
        self.vdi_map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{
        FakeDatabase, FakeHypervisorAgent, FakeManagementPlaneClient, FakeStorageAgent,
    };
    use crate::model::{OnBoot, SrCapability, Sr, Vbd, VbdMode, VbdType, Vdi, VbdRef};
    use std::collections::HashSet;

    fn make_orchestrator() -> (Orchestrator, Arc<FakeDatabase>) {
        let db = Arc::new(FakeDatabase::new());
        let storage = Arc::new(FakeStorageAgent::new());
        let agent = Arc::new(FakeHypervisorAgent::new());
        let mgmt = Arc::new(FakeManagementPlaneClient::new());
        let orchestrator = Orchestrator::new(
            db.clone() as Arc<dyn Database>,
            storage as Arc<dyn StorageAgent>,
            agent as Arc<dyn HypervisorAgent>,
            mgmt as Arc<dyn ManagementPlaneClient>,
            EngineConfig::default(),
        );
        (orchestrator, db)
    }

    fn seed_simple_vm(db: &FakeDatabase, vm_ref: &str) {
        let sr = Sr {
            sr_ref: SrRef("sr-src".into()),
            sr_type: "nfs".into(),
            capabilities: HashSet::from([SrCapability::VdiSnapshot, SrCapability::VdiMirror]),
        };
        db.put_sr(sr);

        let vdi = Vdi {
            vdi_ref: VdiRef("vdi-1".into()),
            uuid: "vdi-uuid-1".into(),
            location: "loc-1".into(),
            sr: SrRef("sr-src".into()),
            virtual_size: 1024,
            on_boot: OnBoot::Persist,
            cbt_enabled: false,
            sm_config: HashMap::new(),
            snapshot_of: None,
            snapshot_time: chrono::Utc::now(),
        };
        db.put_vdi(vdi);

        let vbd = Vbd {
            vbd_ref: VbdRef("vbd-1".into()),
            vm: VmRef(vm_ref.to_string()),
            vdi: Some(VdiRef("vdi-1".into())),
            mode: VbdMode::Rw,
            ty: VbdType::Disk,
            empty: false,
        };
        db.put_vbds(VmRef(vm_ref.to_string()), vec![vbd]);

        db.put_vm(Vm {
            vm_ref: VmRef(vm_ref.to_string()),
            uuid: format!("{}-uuid", vm_ref),
            power_state: PowerState::Running,
            is_snapshot: false,
            is_a_template: false,
            suspend_vdi: None,
            ha_always_run: false,
            other_config: HashMap::new(),
            resident_on: None,
            has_legacy_hardware: false,
        });
    }

    fn cross_cluster_dest() -> HashMap<String, String> {
        HashMap::from([
            ("master".to_string(), "https://10.0.0.9/".to_string()),
            ("xenops".to_string(), "https://10.0.0.9/xenops".to_string()),
            ("SM".to_string(), "https://10.0.0.9/sm".to_string()),
            ("host".to_string(), "unresolvable-host-uuid".to_string()),
            ("session_id".to_string(), "tok".to_string()),
        ])
    }

    #[tokio::test]
    async fn rejects_copy_with_intra_cluster_destination() {
        let (orchestrator, db) = make_orchestrator();
        seed_simple_vm(&db, "vm-1");
        db.put_host("local-host", HostRef("host-ref".into()), vec![1], true);

        let dest = HashMap::from([
            ("master".to_string(), "https://10.0.0.1/".to_string()),
            ("xenops".to_string(), "https://10.0.0.1/xenops".to_string()),
            ("SM".to_string(), "https://10.0.0.1/sm".to_string()),
            ("host".to_string(), "local-host".to_string()),
            ("session_id".to_string(), "tok".to_string()),
        ]);
        let options = HashMap::from([("copy".to_string(), "true".to_string())]);

        let result = orchestrator
            .migrate_send(
                &VmRef("vm-1".into()),
                &dest,
                &HashMap::from([(VdiRef("vdi-1".into()), SrRef("sr-src".into()))]),
                &HashMap::new(),
                &options,
            )
            .await;
        assert!(matches!(result, Err(MigrateError::OperationNotAllowed(_))));
    }

    #[tokio::test]
    async fn concurrency_gate_rejects_fourth_concurrent_call() {
        let (orchestrator, _db) = make_orchestrator();
        let p1 = orchestrator.throttle.enter().unwrap();
        let p2 = orchestrator.throttle.enter().unwrap();
        let p3 = orchestrator.throttle.enter().unwrap();

        let result = orchestrator
            .migrate_send(
                &VmRef("vm-1".into()),
                &cross_cluster_dest(),
                &HashMap::new(),
                &HashMap::new(),
                &HashMap::new(),
            )
            .await;
        assert!(matches!(result, Err(MigrateError::TooManyStorageMigrates(3))));
        drop(p1);
        drop(p2);
        drop(p3);
    }
}
