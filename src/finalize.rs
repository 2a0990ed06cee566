//! Finalizer & Rollback (component H): the success-path commit sequence and
//! the best-effort rollback run on any failure after the concurrency gate.

use crate::collaborators::{Database, ManagementPlaneClient};
use crate::error::MigrateError;
use crate::model::{HostRef, MirrorRecord, PowerState, VmRef};
use crate::Result;
use crate::{log_info, log_warn};

/// Success-path commit, steps 1-6 of the finalizer.
pub struct FinalizeContext<'a> {
    pub db: &'a dyn Database,
    pub mgmt: &'a dyn ManagementPlaneClient,
    pub source_vm: &'a VmRef,
    pub dest_vm: &'a VmRef,
    pub dest_host: &'a HostRef,
    pub cross_cluster: bool,
    pub copy: bool,
    pub ha_was_enabled: bool,
    pub records: &'a [MirrorRecord],
}

pub async fn commit(ctx: FinalizeContext<'_>) -> Result<()> {
    // 1. RRD transfer.
    ctx.mgmt.transfer_rrds(ctx.source_vm).await.unwrap_or_else(|e| {
        log_warn!("RRD transfer failed (non-fatal): {}", e);
    });

    // 2. Detach source networks.
    ctx.mgmt.detach_networks(ctx.source_vm).await.unwrap_or_else(|e| {
        log_warn!("network detach failed (non-fatal): {}", e);
    });

    // 3. Cross-cluster message/blob/HA handling, plus the VBD remap onto the
    // destination's VDI references (the intra-cluster counterpart is step 5,
    // against the local database directly).
    if ctx.cross_cluster {
        ctx.mgmt.send_pool_messages(ctx.source_vm).await.unwrap_or_else(|e| {
            log_warn!("pool message replication failed (non-fatal): {}", e);
        });
        ctx.mgmt.push_blobs(ctx.source_vm).await.unwrap_or_else(|e| {
            log_warn!("blob replication failed (non-fatal): {}", e);
        });
        if ctx.ha_was_enabled {
            ctx.mgmt
                .set_ha_always_run(ctx.dest_vm, true)
                .await
                .unwrap_or_else(|e| log_warn!("HA flag restoration failed (non-fatal): {}", e));
        }
        for record in ctx.records {
            for vbd in ctx.db.get_vbds(ctx.source_vm).await.unwrap_or_default() {
                if vbd.vdi.as_ref() == Some(&record.local_vdi) {
                    ctx.mgmt
                        .remap_vbd(&vbd.vbd_ref, &record.remote_vdi_ref)
                        .await
                        .unwrap_or_else(|e| {
                            log_warn!("cross-cluster VBD remap failed (non-fatal): {}", e)
                        });
                }
            }
        }
    }

    // 4. Notify destination.
    ctx.mgmt
        .pool_migrate_complete(ctx.dest_vm, ctx.dest_host)
        .await?;

    // 5. Intra-cluster VBD/suspend_VDI remap.
    if !ctx.cross_cluster {
        for record in ctx.records {
            for vbd in ctx.db.get_vbds(ctx.source_vm).await? {
                if vbd.vdi.as_ref() == Some(&record.local_vdi) {
                    ctx.db.set_vbd_vdi(&vbd.vbd_ref, &record.remote_vdi_ref).await?;
                }
            }
            ctx.db
                .copy_vdi_other_config_keys(
                    &record.local_vdi,
                    &record.remote_vdi_ref,
                    &["folder", "license"],
                )
                .await?;
        }
        let vm = ctx.db.get_vm(ctx.source_vm).await?;
        if let Some(suspend_vdi) = &vm.suspend_vdi {
            if let Some(record) = ctx.records.iter().find(|r| &r.local_vdi == suspend_vdi) {
                ctx.db
                    .set_vm_suspend_vdi(ctx.source_vm, Some(record.remote_vdi_ref.clone()))
                    .await?;
                let plugged = ctx
                    .mgmt
                    .pbd_plugged(&record.remote_sr, ctx.dest_host)
                    .await
                    .unwrap_or(true);
                if !plugged {
                    ctx.db.clear_vm_suspend_sr(ctx.source_vm).await?;
                }
            }
        }
    }

    // 6. Cross-cluster, not-copy: tear down source.
    if ctx.cross_cluster && !ctx.copy {
        for vbd in ctx.db.get_vbds(ctx.source_vm).await? {
            ctx.db.destroy_vbd(&vbd.vbd_ref).await?;
        }
        ctx.db.destroy_vm(ctx.source_vm).await?;
        for snapshot in ctx.db.get_snapshots(ctx.source_vm).await.unwrap_or_default() {
            ctx.db.destroy_vm(&snapshot.vm_ref).await.unwrap_or_else(|e| {
                log_warn!("failed to destroy source snapshot {}: {}", snapshot.vm_ref, e);
            });
        }
        ctx.db.destroy_vtpms(ctx.source_vm).await.unwrap_or_else(|e| {
            log_warn!("failed to destroy source VTPMs: {}", e);
        });
    }

    log_info!("migration of {} to {} committed", ctx.source_vm, ctx.dest_vm);
    Ok(())
}

/// Rollback path: best-effort cleanup in the documented order, each step's
/// own failure logged and ignored except that the original error (possibly
/// reclassified) is always returned.
pub struct RollbackContext<'a> {
    pub db: &'a dyn Database,
    pub mgmt: &'a dyn ManagementPlaneClient,
    pub agent: &'a dyn crate::collaborators::HypervisorAgent,
    pub source_vm: &'a VmRef,
    pub cross_cluster: bool,
    pub mirror_failed_other_config: Option<String>,
    pub records: &'a [MirrorRecord],
}

pub async fn rollback(ctx: RollbackContext<'_>, original: MigrateError) -> MigrateError {
    if let Ok(vm) = ctx.db.get_vm(ctx.source_vm).await {
        if vm.power_state == PowerState::Suspended {
            if let Err(e) = ctx.db.set_vm_power_state(ctx.source_vm, PowerState::Halted).await {
                log_warn!("rollback: failed to shut down suspended source VM: {}", e);
            }
        }
    }

    if ctx.cross_cluster {
        if let Ok(Some(stale)) = ctx.mgmt.vm_ref_with_uuid(&ctx.source_vm.0).await {
            if let Err(e) = ctx.mgmt.destroy_vm(&stale).await {
                log_warn!("rollback: failed to destroy stale destination VM: {}", e);
            }
        }
    }

    ctx.agent
        .resume_events(&ctx.source_vm.0)
        .await
        .unwrap_or_else(|e| log_warn!("rollback: failed to resume source events: {}", e));

    if let Some(failed_vdi_uuid) = &ctx.mirror_failed_other_config {
        if let Some(record) = ctx
            .records
            .iter()
            .find(|r| &r.local_vdi.0 == failed_vdi_uuid || &r.source_vdi.0 == failed_vdi_uuid)
        {
            return MigrateError::MirrorFailed(record.source_vdi.to_string());
        }
        return MigrateError::MirrorFailed(failed_vdi_uuid.clone());
    }

    translate(original)
}

/// Reclassifies the triggering exception per the rollback-classification
/// table: storage backend errors keep their code, `Unimplemented` becomes
/// `unimplemented_in_sm_backend`, agent cancellation becomes the task's
/// canonical cancelled-task error.
fn translate(original: MigrateError) -> MigrateError {
    match original {
        MigrateError::StorageBackend(code, params) => MigrateError::StorageBackend(code, params),
        MigrateError::UnimplementedInSmBackend(code) => {
            MigrateError::UnimplementedInSmBackend(code)
        }
        MigrateError::Cancelled => MigrateError::Cancelled,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDatabase, FakeHypervisorAgent, FakeManagementPlaneClient};
    use std::collections::HashMap;

    #[tokio::test]
    async fn rollback_prefers_mirror_failed_over_original_error() {
        let db = FakeDatabase::new();
        let mgmt = FakeManagementPlaneClient::new();
        let agent = FakeHypervisorAgent::new();
        db.put_vm(crate::model::Vm {
            vm_ref: VmRef("vm-1".into()),
            uuid: "vm-1".into(),
            power_state: PowerState::Running,
            is_snapshot: false,
            is_a_template: false,
            suspend_vdi: None,
            ha_always_run: false,
            other_config: HashMap::new(),
            resident_on: None,
            has_legacy_hardware: false,
        });

        let record = MirrorRecord {
            source_vdi: crate::model::VdiRef("vdi-1".into()),
            mirrored: true,
            datapath: None,
            local_sr: crate::model::SrRef("sr-src".into()),
            local_vdi: crate::model::VdiRef("vdi-1".into()),
            remote_sr: crate::model::SrRef("sr-dst".into()),
            remote_vdi_ref: crate::model::VdiRef("remote-vdi-1".into()),
            remote_vdi_location: "remote-loc-1".into(),
            local_xenops_locator: "x".into(),
            remote_xenops_locator: "y".into(),
        };
        let records = vec![record];

        let ctx = RollbackContext {
            db: &db,
            mgmt: &mgmt,
            agent: &agent,
            source_vm: &VmRef("vm-1".into()),
            cross_cluster: false,
            mirror_failed_other_config: Some("vdi-1".to_string()),
            records: &records,
        };

        let result = rollback(ctx, MigrateError::Internal("unrelated".to_string())).await;
        assert!(matches!(result, MigrateError::MirrorFailed(ref v) if v == "vdi-1"));
    }
}
