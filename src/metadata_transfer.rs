//! Metadata Transfer (component F): cross-cluster export/import of the VM
//! object graph, annotated with remote-reference hints so the destination
//! management plane can remap VDI/VIF/vGPU references on import.

use crate::collaborators::{Database, ManagementPlaneClient, VmExport};
use crate::error::MigrateError;
use crate::model::{MirrorRecord, NetworkRef, VgpuPciMapping, Vif, VmRef};
use crate::Result;
use crate::{log_info, log_warn};
use std::collections::HashMap;

/// Stamps auxiliary remote-reference keys on every leaf/snapshot VDI, VIF,
/// and vGPU, invokes the metadata export/import, then unconditionally
/// removes the stamps on the way out — success or failure.
pub async fn transfer(
    db: &dyn Database,
    mgmt: &dyn ManagementPlaneClient,
    vm: &VmRef,
    records: &[MirrorRecord],
    vifs: &[Vif],
    vif_network_map: &HashMap<crate::model::VifRef, NetworkRef>,
    vgpu_maps: &[VgpuPciMapping],
    live: bool,
    send_snapshots: bool,
    check_cpu: bool,
) -> Result<VmRef> {
    let mut stamped_vdis = Vec::new();
    let mut stamped_vifs = Vec::new();
    let mut stamped_vgpus = Vec::new();

    let result = stamp_and_import(
        db,
        mgmt,
        vm,
        records,
        vifs,
        vif_network_map,
        vgpu_maps,
        live,
        send_snapshots,
        check_cpu,
        &mut stamped_vdis,
        &mut stamped_vifs,
        &mut stamped_vgpus,
    )
    .await;

    unstamp_all(db, &stamped_vdis, &stamped_vifs, &stamped_vgpus).await;

    result
}

#[allow(clippy::too_many_arguments)]
async fn stamp_and_import(
    db: &dyn Database,
    mgmt: &dyn ManagementPlaneClient,
    vm: &VmRef,
    records: &[MirrorRecord],
    vifs: &[Vif],
    vif_network_map: &HashMap<crate::model::VifRef, NetworkRef>,
    vgpu_maps: &[VgpuPciMapping],
    live: bool,
    send_snapshots: bool,
    check_cpu: bool,
    stamped_vdis: &mut Vec<crate::model::VdiRef>,
    stamped_vifs: &mut Vec<crate::model::VifRef>,
    stamped_vgpus: &mut Vec<crate::model::VgpuRef>,
) -> Result<VmRef> {
    for record in records {
        db.stamp_vdi_storage_migrate_map(&record.source_vdi, &record.remote_vdi_ref)
            .await?;
        stamped_vdis.push(record.source_vdi.clone());
    }

    for vif in vifs {
        if let Some(network) = vif_network_map.get(&vif.vif_ref) {
            db.stamp_vif_remote_network(&vif.vif_ref, network).await?;
            stamped_vifs.push(vif.vif_ref.clone());
        }
    }

    for mapping in vgpu_maps {
        if let Some(group) = &mapping.remote_gpu_group {
            db.stamp_vgpu_remote_gpu_group(&mapping.vgpu, group).await?;
            stamped_vgpus.push(mapping.vgpu.clone());
        }
    }

    let export = VmExport {
        vm: vm.clone(),
        dry_run: false,
        live,
        send_snapshots,
        check_cpu,
    };

    log_info!("exporting VM {} metadata to destination management plane", vm);
    let imported_ref = mgmt.import_vm(&export).await.map_err(|e| {
        MigrateError::VmMigrateFailed(format!("metadata import failed: {}", e))
    })?;

    Ok(imported_ref)
}

async fn unstamp_all(
    db: &dyn Database,
    stamped_vdis: &[crate::model::VdiRef],
    stamped_vifs: &[crate::model::VifRef],
    stamped_vgpus: &[crate::model::VgpuRef],
) {
    for vdi in stamped_vdis {
        if let Err(e) = db.unstamp_vdi_storage_migrate_map(vdi).await {
            log_warn!("failed to unstamp VDI {}: {} (ignored)", vdi, e);
        }
    }
    for vif in stamped_vifs {
        if let Err(e) = db.unstamp_vif_remote_network(vif).await {
            log_warn!("failed to unstamp VIF {}: {} (ignored)", vif, e);
        }
    }
    for vgpu in stamped_vgpus {
        if let Err(e) = db.unstamp_vgpu_remote_gpu_group(vgpu).await {
            log_warn!("failed to unstamp VGPU {}: {} (ignored)", vgpu, e);
        }
    }
}

/// Runs a dry-run import and reports conflicts, used by the feasibility
/// checker ahead of the real transfer.
pub async fn dry_run_conflicts(
    mgmt: &dyn ManagementPlaneClient,
    vm: &VmRef,
    live: bool,
    send_snapshots: bool,
    check_cpu: bool,
) -> Result<Vec<String>> {
    let export = VmExport {
        vm: vm.clone(),
        dry_run: true,
        live,
        send_snapshots,
        check_cpu,
    };
    mgmt.dry_run_import(&export).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDatabase, FakeManagementPlaneClient};
    use crate::model::{SrRef, VdiRef};

    fn sample_record() -> MirrorRecord {
        MirrorRecord {
            source_vdi: VdiRef("vdi-1".into()),
            mirrored: true,
            datapath: None,
            local_sr: SrRef("sr-src".into()),
            local_vdi: VdiRef("vdi-1".into()),
            remote_sr: SrRef("sr-dst".into()),
            remote_vdi_ref: VdiRef("remote-vdi-1".into()),
            remote_vdi_location: "remote-loc-1".into(),
            local_xenops_locator: "sr-src/loc-1".into(),
            remote_xenops_locator: "mirror-1".into(),
        }
    }

    #[tokio::test]
    async fn stamps_then_unstamps_on_success() {
        let db = FakeDatabase::new();
        let mgmt = FakeManagementPlaneClient::new();
        let vm = VmRef("vm-1".into());
        let records = vec![sample_record()];

        let result = transfer(
            &db,
            &mgmt,
            &vm,
            &records,
            &[],
            &HashMap::new(),
            &[],
            true,
            true,
            false,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dry_run_conflicts_reports_empty_by_default() {
        let mgmt = FakeManagementPlaneClient::new();
        let vm = VmRef("vm-1".into());
        let conflicts = dry_run_conflicts(&mgmt, &vm, true, true, false).await.unwrap();
        assert!(conflicts.is_empty());
    }
}
