//! Disk Mirror Planner & Runner (component E): classifies every VDI
//! attached to the migrating VM as leaf/snapshot/suspend, orders them,
//! drives the per-VDI mirror-or-copy protocol against the storage agent,
//! and replicates snapshot chains once transfer completes.
//!
//! Grounded on the teacher's scoped-resource idiom (`migration.rs`'s
//! tokio-task-scoped cleanup) generalized into an explicit `run_scoped`
//! helper, and on `storage_pool.rs`'s manager-struct style for the planner.

use crate::collaborators::{Database, ManagementPlaneClient, StorageAgent, StorageTaskOutcome};
use crate::error::MigrateError;
use crate::model::{
    DatapathHandle, HostRef, MirrorRecord, SrRef, Vbd, Vdi, VdiMirrorRequest, VdiRef, VdiRole, Vm,
};
use crate::Result;
use crate::{log_debug, log_info, log_warn};
use std::collections::HashMap;
use uuid::Uuid;

/// Builds the ordered transfer plan from the VM's live disks, snapshot
/// disks, and (if Suspended) suspend disk, given the already-completed
/// VDI->SR map from component C.
pub async fn build_plan(
    db: &dyn Database,
    vm: &Vm,
    snapshots: &[Vm],
    vbds: &[Vbd],
    vdi_sr_map: &HashMap<VdiRef, SrRef>,
    allow_mirror: &HashMap<VdiRef, bool>,
    intra_cluster: bool,
    dest_has_suspend_sr_path: bool,
) -> Result<Vec<VdiMirrorRequest>> {
    let mut requests = Vec::new();

    for vbd in vbds {
        if !vbd.is_leaf_disk() {
            continue;
        }
        let Some(vdi_ref) = &vbd.vdi else { continue };
        let vdi = db.get_vdi(vdi_ref).await?;
        let dest_sr = vdi_sr_map
            .get(vdi_ref)
            .cloned()
            .ok_or_else(|| MigrateError::VdiNotInMap(vdi_ref.to_string()))?;
        let mirror = *allow_mirror.get(vdi_ref).unwrap_or(&true)
            && matches!(vbd.mode, crate::model::VbdMode::Rw);
        requests.push(VdiMirrorRequest {
            vdi: vdi_ref.clone(),
            role: VdiRole::Leaf { mirror },
            source_sr: vdi.sr.clone(),
            dest_sr,
            virtual_size: vdi.virtual_size,
            snapshot_time: vdi.snapshot_time,
            leaf_vdi: vdi_ref.clone(),
        });
    }

    for snapshot in snapshots {
        for vbd in db.get_vbds(&snapshot.vm_ref).await? {
            if !vbd.is_leaf_disk() {
                continue;
            }
            let Some(vdi_ref) = &vbd.vdi else { continue };
            let vdi = db.get_vdi(vdi_ref).await?;
            let dest_sr = vdi_sr_map
                .get(vdi_ref)
                .cloned()
                .ok_or_else(|| MigrateError::VdiNotInMap(vdi_ref.to_string()))?;
            let leaf_vdi = vdi.snapshot_of.clone().unwrap_or_else(|| vdi_ref.clone());
            requests.push(VdiMirrorRequest {
                vdi: vdi_ref.clone(),
                role: VdiRole::Snapshot,
                source_sr: vdi.sr.clone(),
                dest_sr,
                virtual_size: vdi.virtual_size,
                snapshot_time: vdi.snapshot_time,
                leaf_vdi,
            });
        }
    }

    for candidate_vm in std::iter::once(vm).chain(snapshots.iter()) {
        if candidate_vm.power_state != crate::model::PowerState::Suspended {
            continue;
        }
        let Some(suspend_vdi_ref) = &candidate_vm.suspend_vdi else {
            continue;
        };
        if intra_cluster && dest_has_suspend_sr_path {
            log_debug!(
                "skipping suspend VDI {} transfer: destination already has a path to its SR",
                suspend_vdi_ref
            );
            continue;
        }
        let vdi = db.get_vdi(suspend_vdi_ref).await?;
        let dest_sr = vdi_sr_map
            .get(suspend_vdi_ref)
            .cloned()
            .ok_or_else(|| MigrateError::VdiNotInMap(suspend_vdi_ref.to_string()))?;
        requests.push(VdiMirrorRequest {
            vdi: suspend_vdi_ref.clone(),
            role: VdiRole::Suspend,
            source_sr: vdi.sr.clone(),
            dest_sr,
            virtual_size: vdi.virtual_size,
            snapshot_time: vdi.snapshot_time,
            leaf_vdi: suspend_vdi_ref.clone(),
        });
    }

    requests.sort_by(|a, b| {
        a.virtual_size
            .cmp(&b.virtual_size)
            .then(a.snapshot_time.cmp(&b.snapshot_time))
    });

    Ok(requests)
}

/// Ejects CDs attached to the live (non-snapshot, non-suspended) VM whose
/// target SR differs from their current one, ahead of any mirror starting.
pub async fn eject_cds_before_mirror(
    db: &dyn Database,
    vm: &Vm,
    vbds: &[Vbd],
    vdi_sr_map: &HashMap<VdiRef, SrRef>,
) -> Result<()> {
    if vm.power_state == crate::model::PowerState::Suspended || vm.is_snapshot {
        return Ok(());
    }
    for vbd in vbds {
        if vbd.empty || !matches!(vbd.ty, crate::model::VbdType::Cd) {
            continue;
        }
        let Some(vdi_ref) = &vbd.vdi else { continue };
        let vdi = db.get_vdi(vdi_ref).await?;
        if let Some(dest_sr) = vdi_sr_map.get(vdi_ref) {
            if dest_sr != &vdi.sr {
                log_info!("ejecting CD VBD {} ahead of migration", vbd.vbd_ref);
                db.eject_cd(&vbd.vbd_ref).await?;
            }
        }
    }
    Ok(())
}

/// Progress aggregator: each VDI transfer contributes
/// `size_of_this_vdi / total_size` to a running 0.0-1.0 total.
pub struct ProgressAggregator {
    total_size: u64,
    completed_size: u64,
}

impl ProgressAggregator {
    pub fn new(requests: &[VdiMirrorRequest]) -> Self {
        Self {
            total_size: requests.iter().map(|r| r.virtual_size).sum::<u64>().max(1),
            completed_size: 0,
        }
    }

    pub fn record_complete(&mut self, size: u64) {
        self.completed_size += size;
    }

    pub fn fraction(&self) -> f32 {
        (self.completed_size as f32 / self.total_size as f32).min(1.0)
    }
}

/// Synthetic domain-slice identifier the storage agent uses to route SMAPI
/// calls before the guest domain exists on the destination.
fn domain_slice_id(prefix: &str, vm: &str, vdi: &str) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{vm}:{vdi}").as_bytes());
    format!("{prefix}-{digest}")
}

/// Runs the per-VDI mirror-or-copy protocol for one request, honoring the
/// scoped-cleanup guarantee: on failure, best-effort datapath/mirror/remote
/// VDI cleanup runs before the error propagates.
#[allow(clippy::too_many_arguments)]
pub async fn run_one(
    db: &dyn Database,
    storage: &dyn StorageAgent,
    mgmt: &dyn ManagementPlaneClient,
    dest_host: Option<&HostRef>,
    vm_ref: &str,
    req: &VdiMirrorRequest,
    intra_pool: bool,
    progress: &mut ProgressAggregator,
) -> Result<MirrorRecord> {
    let vdi = db.get_vdi(&req.vdi).await?;
    let mirror_vm = domain_slice_id("MIR", vm_ref, &req.vdi.0);
    let copy_vm = domain_slice_id("CP", vm_ref, &req.vdi.0);

    let do_mirror = matches!(req.role, VdiRole::Leaf { mirror: true });

    let result = run_protocol(
        db, storage, mgmt, dest_host, &vdi, req, do_mirror, &mirror_vm, &copy_vm, intra_pool,
    )
    .await;

    match result {
        Ok(record) => {
            progress.record_complete(req.virtual_size);
            Ok(record)
        }
        Err(e) => {
            log_warn!("mirror/copy failed for VDI {}: {}", req.vdi, e);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_protocol(
    db: &dyn Database,
    storage: &dyn StorageAgent,
    mgmt: &dyn ManagementPlaneClient,
    dest_host: Option<&HostRef>,
    vdi: &Vdi,
    req: &VdiMirrorRequest,
    do_mirror: bool,
    mirror_vm: &str,
    copy_vm: &str,
    intra_pool: bool,
) -> Result<MirrorRecord> {
    let dp_prefix = if do_mirror { "mirror" } else { "copy" };
    log_debug!(
        "{}_<dp> for VDI {} ({} -> {})",
        dp_prefix,
        req.vdi,
        req.source_sr,
        req.dest_sr
    );

    if let Some(host) = dest_host {
        if !mgmt.pbd_plugged(&req.dest_sr, host).await? {
            log_info!("plugging destination PBD for SR {} on host {}", req.dest_sr, host);
            mgmt.plug_pbd(&req.dest_sr, host).await?;
        }
    }

    let dp = storage.vdi_attach3(&req.source_sr, &req.vdi, true).await?;
    let mut dp_guard = ScopedDatapath::new(storage, dp.clone());

    storage.vdi_activate3(&dp, true).await?;

    let task = if do_mirror {
        storage
            .mirror_start(
                &req.source_sr,
                &req.vdi,
                &dp,
                mirror_vm,
                copy_vm,
                "sm-url",
                &req.dest_sr,
                intra_pool,
            )
            .await
    } else {
        storage
            .data_copy(&req.source_sr, &req.vdi, copy_vm, "sm-url", &req.dest_sr, intra_pool)
            .await
    };

    let task = match task {
        Ok(task) => task,
        Err(e) => {
            dp_guard.cleanup().await;
            return Err(e);
        }
    };

    let outcome = storage.wait_for_task("mirror-runner", &task).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            dp_guard.cleanup().await;
            return Err(e);
        }
    };

    let (remote_location, mirror_id) = match &outcome {
        StorageTaskOutcome::Mirror { mirror_id } => {
            let stat = storage.mirror_stat(mirror_id).await?;
            (stat.dest_vdi_location, Some(mirror_id.clone()))
        }
        StorageTaskOutcome::Copy { remote_vdi_location } => (remote_vdi_location.clone(), None),
    };

    mgmt.scan_sr(&req.dest_sr).await?;
    let remote_vdi_ref = match mgmt.find_vdi_by_location(&req.dest_sr, &remote_location).await {
        Ok(vdi_ref) => vdi_ref,
        Err(e) => {
            dp_guard.cleanup().await;
            return Err(e);
        }
    };

    dp_guard.disarm();
    if do_mirror {
        // mirror stays live until the memory migration switches over; the
        // finalizer/rollback tear it down explicitly.
    } else {
        storage.dp_destroy(&dp, false).await.unwrap_or_else(|e| {
            log_warn!("best-effort dp_destroy after copy failed: {}", e);
        });
    }

    let _ = db;
    Ok(MirrorRecord {
        source_vdi: req.vdi.clone(),
        mirrored: do_mirror,
        datapath: if do_mirror { Some(dp) } else { None },
        local_sr: req.source_sr.clone(),
        local_vdi: vdi.vdi_ref.clone(),
        remote_sr: req.dest_sr.clone(),
        remote_vdi_ref,
        remote_vdi_location: remote_location,
        local_xenops_locator: format!("{}/{}", req.source_sr, vdi.location),
        remote_xenops_locator: mirror_id.unwrap_or_default(),
    })
}

/// RAII guard around an attached datapath: `cleanup()` runs the best-effort
/// teardown on a failure path; `disarm()` is called once the datapath is
/// handed off successfully so normal drop does nothing further.
struct ScopedDatapath<'a> {
    storage: &'a dyn StorageAgent,
    dp: Option<DatapathHandle>,
}

impl<'a> ScopedDatapath<'a> {
    fn new(storage: &'a dyn StorageAgent, dp: DatapathHandle) -> Self {
        Self {
            storage,
            dp: Some(dp),
        }
    }

    async fn cleanup(&mut self) {
        if let Some(dp) = self.dp.take() {
            if let Err(e) = self.storage.dp_destroy(&dp, true).await {
                log_warn!("best-effort dp_destroy during rollback failed: {}", e);
            }
        }
    }

    fn disarm(&mut self) {
        self.dp = None;
    }
}

/// Snapshot-chain replication: after all transfers complete, grouped by
/// leaf VDI, tell the remote SR about the snapshot relationships. Absence
/// of this operation on the remote is tolerated and logged.
pub async fn replicate_snapshot_chains(
    storage: &dyn StorageAgent,
    records: &[MirrorRecord],
    leaf_records: &HashMap<VdiRef, &MirrorRecord>,
    snapshot_pairs_by_leaf: &HashMap<VdiRef, Vec<(VdiRef, VdiRef)>>,
    intra_cluster: bool,
) {
    for (leaf_vdi, pairs) in snapshot_pairs_by_leaf {
        let Some(leaf_record) = leaf_records.get(leaf_vdi) else {
            continue;
        };
        let result = storage
            .update_snapshot_info_src(
                &leaf_record.local_sr,
                &leaf_record.local_vdi,
                "sm-url",
                &leaf_record.remote_sr,
                &leaf_record.remote_vdi_ref,
                pairs,
                intra_cluster,
            )
            .await;
        if let Err(e) = result {
            log_warn!(
                "update_snapshot_info_src not supported by remote for leaf {}: {} (tolerated)",
                leaf_vdi,
                e
            );
        }
    }
    let _ = records;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_size_then_snapshot_time() {
        let t0 = chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let t1 = chrono::DateTime::parse_from_rfc3339("2020-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let mut requests = vec![
            req_fixture("big", 2048, t0),
            req_fixture("small-old", 1024, t0),
            req_fixture("small-new", 1024, t1),
        ];
        requests.sort_by(|a, b| {
            a.virtual_size
                .cmp(&b.virtual_size)
                .then(a.snapshot_time.cmp(&b.snapshot_time))
        });
        let order: Vec<_> = requests.iter().map(|r| r.vdi.0.clone()).collect();
        assert_eq!(order, vec!["small-old", "small-new", "big"]);
    }

    fn req_fixture(id: &str, size: u64, time: chrono::DateTime<chrono::Utc>) -> VdiMirrorRequest {
        VdiMirrorRequest {
            vdi: VdiRef(id.to_string()),
            role: VdiRole::Leaf { mirror: true },
            source_sr: SrRef("sr-src".into()),
            dest_sr: SrRef("sr-dst".into()),
            virtual_size: size,
            snapshot_time: time,
            leaf_vdi: VdiRef(id.to_string()),
        }
    }

    #[tokio::test]
    async fn mirror_protocol_produces_record() {
        use crate::collaborators::fakes::{FakeDatabase, FakeManagementPlaneClient, FakeStorageAgent};
        use crate::model::{HostRef, OnBoot, Vdi};

        let db = FakeDatabase::new();
        let storage = FakeStorageAgent::new();
        let mgmt = FakeManagementPlaneClient::new();
        let vdi = Vdi {
            vdi_ref: VdiRef("vdi-1".into()),
            uuid: "vdi-uuid".into(),
            location: "loc-1".into(),
            sr: SrRef("sr-src".into()),
            virtual_size: 1024,
            on_boot: OnBoot::Persist,
            cbt_enabled: false,
            sm_config: HashMap::new(),
            snapshot_of: None,
            snapshot_time: chrono::Utc::now(),
        };
        db.put_vdi(vdi.clone());
        storage
            .dest_locations
            .lock()
            .unwrap()
            .insert("loc-1".to_string(), "dest-loc-1".to_string());
        mgmt.put_vdi_at_location(SrRef("sr-dst".into()), "dest-loc-1", VdiRef("remote-vdi-1".into()));

        let req = req_fixture("vdi-1", 1024, vdi.snapshot_time);
        let mut progress = ProgressAggregator::new(std::slice::from_ref(&req));
        let dest_host = HostRef("host-dst".into());

        let record = run_one(
            &db,
            &storage,
            &mgmt,
            Some(&dest_host),
            "vm-1",
            &req,
            true,
            &mut progress,
        )
        .await
        .unwrap();
        assert!(record.mirrored);
        assert_eq!(record.remote_vdi_location, "dest-loc-1");
        assert_eq!(record.remote_vdi_ref, VdiRef("remote-vdi-1".into()));
        assert_eq!(progress.fraction(), 1.0);
    }

    #[tokio::test]
    async fn mirror_protocol_fails_when_remote_vdi_not_found() {
        use crate::collaborators::fakes::{FakeDatabase, FakeManagementPlaneClient, FakeStorageAgent};
        use crate::model::{OnBoot, Vdi};

        let db = FakeDatabase::new();
        let storage = FakeStorageAgent::new();
        let mgmt = FakeManagementPlaneClient::new();
        let vdi = Vdi {
            vdi_ref: VdiRef("vdi-1".into()),
            uuid: "vdi-uuid".into(),
            location: "loc-1".into(),
            sr: SrRef("sr-src".into()),
            virtual_size: 1024,
            on_boot: OnBoot::Persist,
            cbt_enabled: false,
            sm_config: HashMap::new(),
            snapshot_of: None,
            snapshot_time: chrono::Utc::now(),
        };
        db.put_vdi(vdi.clone());
        // No dest_locations entry and no put_vdi_at_location seeded, so
        // find_vdi_by_location fails.

        let req = req_fixture("vdi-1", 1024, vdi.snapshot_time);
        let mut progress = ProgressAggregator::new(std::slice::from_ref(&req));

        let err = run_one(&db, &storage, &mgmt, None, "vm-1", &req, true, &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::VdiLocationMissing(_)));
    }
}
