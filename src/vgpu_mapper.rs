//! vGPU Mapper (component I): derives the device-label -> PCI-address map
//! for each VGPU attached to a migrating VM, both for the local
//! hypervisor-agent call and, when cross-cluster, for the remote GPU-group
//! hint stamped into the metadata export.
//!
//! Grounded on the PCI-address parsing idiom in the teacher's `sriov.rs`
//! (`SriovDevice`/`VirtualFunction` address handling) and the
//! `gpu_passthrough.rs` `PciDevice` shape, generalized here to read
//! addresses from the database rather than from `lspci`.

use crate::collaborators::Database;
use crate::error::MigrateError;
use crate::model::{Vgpu, VgpuPciMapping};
use crate::Result;

/// `scheduled_to_be_resident_on` is read, not `resident_on`, because GPU
/// scheduling happens before the memory migrate starts. If the VGPU has lost
/// its PGPU (e.g. the guest shut down mid-migration) the query fails and the
/// caller translates this into `vm_migrate_failed`.
pub async fn map_vgpus(db: &dyn Database, vgpus: &[Vgpu]) -> Result<Vec<VgpuPciMapping>> {
    let mut mappings = Vec::with_capacity(vgpus.len());
    for vgpu in vgpus {
        let pci = db
            .scheduled_pgpu_pci_address(&vgpu.vgpu_ref)
            .await
            .map_err(|_| {
                MigrateError::VgpuMapping("changed power state during migration".to_string())
            })?;

        let mut local = vec![(vgpu.device_label.clone(), pci)];

        if let Some(vf_pci) = db.vgpu_sriov_vf_pci_address(&vgpu.vgpu_ref).await? {
            local.push((format!("vf:{}", vgpu.device_label), vf_pci));
        }

        mappings.push(VgpuPciMapping {
            vgpu: vgpu.vgpu_ref.clone(),
            local,
            remote_gpu_group: Some(vgpu.gpu_group.clone()),
        });
    }
    Ok(mappings)
}

/// Translates a vGPU mapping failure into the wire-level `vm_migrate_failed`
/// code, per the explicit failure mode in the mapping contract.
pub fn to_migrate_failed(err: MigrateError) -> MigrateError {
    match err {
        MigrateError::VgpuMapping(msg) => MigrateError::VmMigrateFailed(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeDatabase;
    use crate::model::{GpuGroupRef, VgpuRef, VmRef};

    #[tokio::test]
    async fn maps_single_function_vgpu() {
        let db = FakeDatabase::new();
        let vgpu = Vgpu {
            vgpu_ref: VgpuRef("vgpu-0".into()),
            vm: VmRef("vm-1".into()),
            gpu_group: GpuGroupRef("group-0".into()),
            device_label: "0".into(),
        };
        db.set_vgpu_pci_address(vgpu.vgpu_ref.clone(), "0000:3b:00.0");

        let mapped = map_vgpus(&db, &[vgpu]).await.unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].local, vec![("0".to_string(), "0000:3b:00.0".to_string())]);
    }

    #[tokio::test]
    async fn fails_with_vgpu_mapping_when_no_scheduled_pgpu() {
        let db = FakeDatabase::new();
        let vgpu = Vgpu {
            vgpu_ref: VgpuRef("vgpu-1".into()),
            vm: VmRef("vm-1".into()),
            gpu_group: GpuGroupRef("group-0".into()),
            device_label: "0".into(),
        };
        let err = map_vgpus(&db, &[vgpu]).await.unwrap_err();
        assert!(matches!(err, MigrateError::VgpuMapping(_)));
    }
}
