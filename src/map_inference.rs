//! Map Inference (component C): completes the caller-supplied partial
//! VDI->SR, VIF->Network, and vGPU->PCI maps using defaults and the
//! heuristics the cluster-facing RPCs document.

use crate::collaborators::Database;
use crate::error::MigrateError;
use crate::model::{SrRef, Vdi, VdiRef, Vif, VifRef, NetworkRef, Vgpu, VgpuPciMapping};
use crate::vgpu_mapper;
use crate::Result;
use std::collections::HashMap;

/// Completes the VIF->Network map: explicit entries win; an unmapped VIF
/// inherits the network of any other VIF on the same VM with an identical
/// MAC address; otherwise `vif_not_in_map`.
pub fn complete_vif_map(
    vifs: &[Vif],
    explicit: &HashMap<VifRef, NetworkRef>,
) -> Result<HashMap<VifRef, NetworkRef>> {
    let mut result = explicit.clone();

    for vif in vifs {
        if result.contains_key(&vif.vif_ref) {
            continue;
        }
        let inherited = vifs.iter().find(|other| {
            other.vif_ref != vif.vif_ref
                && other.mac == vif.mac
                && result.contains_key(&other.vif_ref)
        });
        match inherited {
            Some(other) => {
                let network = result[&other.vif_ref].clone();
                result.insert(vif.vif_ref.clone(), network);
            }
            None => return Err(MigrateError::VifNotInMap(vif.vif_ref.to_string())),
        }
    }

    Ok(result)
}

/// Completes the VDI->SR map for snapshot and suspend VDIs not already
/// present in the caller-supplied map.
pub async fn complete_sr_for_vdi(
    db: &dyn Database,
    vdi: &Vdi,
    is_suspend_vdi: bool,
    explicit: &HashMap<VdiRef, SrRef>,
    dest_default_sr: Option<SrRef>,
    dest_pool_suspend_image_sr: Option<SrRef>,
    dest_host_suspend_image_sr: Option<SrRef>,
) -> Result<SrRef> {
    if let Some(sr) = explicit.get(&vdi.vdi_ref) {
        return Ok(sr.clone());
    }

    if let Some(parent) = &vdi.snapshot_of {
        if let Some(sr) = explicit.get(parent) {
            return Ok(sr.clone());
        }
    }

    if is_suspend_vdi {
        if let Some(sr) = dest_pool_suspend_image_sr {
            return Ok(sr);
        }
        if let Some(sr) = dest_host_suspend_image_sr {
            return Ok(sr);
        }
    }

    if let Some(sr) = dest_default_sr {
        return Ok(sr);
    }

    let _ = db; // reserved for future SR-lookup refinements
    Err(MigrateError::VdiNotInMap(vdi.vdi_ref.to_string()))
}

/// Derives the vGPU->PCI map; thin pass-through to the vGPU mapper so every
/// other component reaches map inference through one module.
pub async fn complete_vgpu_map(db: &dyn Database, vgpus: &[Vgpu]) -> Result<Vec<VgpuPciMapping>> {
    vgpu_mapper::map_vgpus(db, vgpus)
        .await
        .map_err(vgpu_mapper::to_migrate_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkRef, VifRef, VmRef};

    fn vif(id: &str, mac: &str, network: Option<&str>) -> (Vif, Option<NetworkRef>) {
        (
            Vif {
                vif_ref: VifRef(id.into()),
                vm: VmRef("vm-1".into()),
                network: NetworkRef("placeholder".into()),
                mac: mac.into(),
                device: "0".into(),
            },
            network.map(|n| NetworkRef(n.into())),
        )
    }

    #[test]
    fn infers_network_from_matching_mac() {
        let (vif_a, net_a) = vif("vif-a", "aa:bb:cc:00:00:01", Some("net-1"));
        let (vif_b, _) = vif("vif-b", "aa:bb:cc:00:00:01", None);

        let mut explicit = HashMap::new();
        explicit.insert(vif_a.vif_ref.clone(), net_a.unwrap());

        let completed = complete_vif_map(&[vif_a, vif_b.clone()], &explicit).unwrap();
        assert_eq!(completed[&vif_b.vif_ref], NetworkRef("net-1".into()));
    }

    #[test]
    fn fails_when_no_matching_mac() {
        let (vif_a, _) = vif("vif-a", "aa:bb:cc:00:00:01", None);
        let explicit = HashMap::new();
        let err = complete_vif_map(&[vif_a], &explicit).unwrap_err();
        assert!(matches!(err, MigrateError::VifNotInMap(_)));
    }
}
