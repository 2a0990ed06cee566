//! Feasibility Checker (component B): every precondition assertion, run
//! before any state mutation. Mirrors the public cluster-facing
//! `assert_can_migrate` contract.

use crate::collaborators::Database;
use crate::collaborators::ManagementPlaneClient;
use crate::config::EngineConfig;
use crate::error::MigrateError;
use crate::model::{
    DestDescriptor, MigrateOptions, PowerState, SrCapability, Vdi, VdiRef, Vm, VmRef,
};
use crate::Result;
use std::collections::{HashMap, HashSet};

/// Parses the `force`/`copy`/`compress` options bag (precondition 10).
/// `compress` falls back to the pool policy default when unspecified.
pub fn parse_options(raw: &HashMap<String, String>, config: &EngineConfig) -> Result<MigrateOptions> {
    let parse_flag = |key: &str| -> Result<Option<bool>> {
        match raw.get(key) {
            Some(v) => crate::model::parse_bool_option(v)
                .map(Some)
                .ok_or_else(|| {
                    MigrateError::OperationNotAllowed(format!(
                        "option '{}' has unrecognized value '{}'",
                        key, v
                    ))
                }),
            None => Ok(None),
        }
    };

    let force = parse_flag("force")?.unwrap_or(false);
    let copy = parse_flag("copy")?.unwrap_or(false);
    let compress = parse_flag("compress")?.unwrap_or(config.compress_default);

    Ok(MigrateOptions {
        force,
        copy,
        compress,
    })
}

/// Full precondition run. `vdi_map`/`vif_map` here are the already-completed
/// maps (after component C), since several preconditions need the
/// destination SR each VDI resolved to.
#[allow(clippy::too_many_arguments)]
pub async fn assert_can_migrate(
    db: &dyn Database,
    mgmt: &dyn ManagementPlaneClient,
    config: &EngineConfig,
    vm: &Vm,
    dest: &DestDescriptor,
    vdis_in_scope: &[(Vdi, VdiRef)],
    vifs_mapped: bool,
    vgpus_ok: bool,
    options: MigrateOptions,
) -> Result<()> {
    // 1. Licensing.
    if !db.licensed_for_storage_motion().await? {
        return Err(MigrateError::OperationNotAllowed(
            "Storage_motion feature not licensed".to_string(),
        ));
    }

    // 2 & 9 (edge case): copy + intra-cluster is rejected outright.
    if options.copy && !dest.cross_cluster {
        return Err(MigrateError::OperationNotAllowed(
            "copy=true is not supported for intra-cluster migration; use VM.copy/clone instead"
                .to_string(),
        ));
    }

    // 2: no legacy hardware (PCI/USB passthrough, non-vGPU passthrough GPU).
    if vm.has_legacy_hardware {
        return Err(MigrateError::VmHasLegacyHardware(vm.vm_ref.to_string()));
    }

    // 4, 5, 6: per-VDI checks.
    for (vdi, dest_sr) in vdis_in_scope {
        if vdi.cbt_enabled {
            return Err(MigrateError::VdiCbtEnabled(vdi.vdi_ref.to_string()));
        }
        if matches!(vdi.on_boot, crate::model::OnBoot::Reset) {
            return Err(MigrateError::VdiOnBootModeIncompatible(vdi.vdi_ref.to_string()));
        }
        if &vdi.sr != dest_sr && vdi.is_encrypted() {
            return Err(MigrateError::VdiIsEncrypted(vdi.vdi_ref.to_string()));
        }
    }

    // 7: SR capability checks, exempting same-SR VDIs.
    for (vdi, dest_sr) in vdis_in_scope {
        if &vdi.sr == dest_sr {
            continue;
        }
        let source_sr = db.get_sr(&vdi.sr).await?;
        if !source_sr.supports(&[SrCapability::VdiSnapshot, SrCapability::VdiMirror]) {
            return Err(MigrateError::SrDoesNotSupportMigration(vdi.sr.to_string()));
        }
        let dest_sr_record = db.get_sr(dest_sr).await?;
        if !dest_sr_record.supports(&[SrCapability::VdiSnapshot, SrCapability::VdiMirrorIn]) {
            return Err(MigrateError::SrDoesNotSupportMigration(dest_sr.to_string()));
        }
    }

    if dest.cross_cluster {
        assert_cross_cluster_preconditions(mgmt, config, vm, dest, vifs_mapped, options).await?;
    } else {
        assert_intra_cluster_preconditions(db, vm, dest, vifs_mapped, options).await?;
    }

    if !vgpus_ok {
        return Err(MigrateError::VgpuMapping(
            "changed power state during migration".to_string(),
        ));
    }

    Ok(())
}

async fn assert_intra_cluster_preconditions(
    db: &dyn Database,
    vm: &Vm,
    dest: &DestDescriptor,
    vifs_mapped: bool,
    options: MigrateOptions,
) -> Result<()> {
    let source_host = vm.resident_on.clone();
    if let Some(source_host) = &source_host {
        let source_version = db.host_platform_version(source_host).await?;
        let dest_version = db.host_platform_version(&dest.dest_host_ref).await?;
        if dest_version < source_version {
            return Err(MigrateError::VmHostIncompatibleVersionMigrate(
                "destination platform version is lower than source".to_string(),
            ));
        }

        // 8: CPU-featureset equivalence, skipped under force. Cross-cluster
        // reaches the equivalent check via the metadata-import dry run;
        // intra-cluster has no such call, so it's asserted here directly.
        if !options.force {
            let source_cpu = db.host_hardware_platform_version(source_host).await?;
            let dest_cpu = db.host_hardware_platform_version(&dest.dest_host_ref).await?;
            if dest_cpu != source_cpu {
                return Err(MigrateError::CpuFeatureSetIncompatible(
                    dest.dest_host_ref.to_string(),
                ));
            }
        }
    }

    if vifs_mapped {
        return Err(MigrateError::OperationNotAllowed(
            "VIF map must be empty for intra-cluster migration: VIFs stay on the same networks"
                .to_string(),
        ));
    }

    Ok(())
}

async fn assert_cross_cluster_preconditions(
    mgmt: &dyn ManagementPlaneClient,
    config: &EngineConfig,
    vm: &Vm,
    dest: &DestDescriptor,
    vifs_mapped: bool,
    options: MigrateOptions,
) -> Result<()> {
    let _ = config;

    if !mgmt.host_enabled(&dest.dest_host_ref).await? {
        return Err(MigrateError::HostDisabled(dest.dest_host_ref.to_string()));
    }

    if mgmt.host_free_cpus(&dest.dest_host_ref).await? == 0 {
        return Err(MigrateError::CannotContactHost(dest.dest_host_ref.to_string()));
    }

    if options.copy && vm.power_state != PowerState::Halted && !options.force {
        return Err(MigrateError::VmBadPowerState {
            vm: vm.vm_ref.to_string(),
            expected: "Halted".to_string(),
            actual: vm.power_state.to_string(),
        });
    }

    if !vifs_mapped {
        return Err(MigrateError::VifNotInMap(vm.vm_ref.to_string()));
    }

    let export = crate::collaborators::VmExport {
        vm: vm.vm_ref.clone(),
        dry_run: true,
        live: vm.power_state == PowerState::Running,
        send_snapshots: !options.copy,
        check_cpu: !options.force && vm.power_state != PowerState::Halted,
    };
    let conflicts = mgmt.dry_run_import(&export).await?;
    if !conflicts.is_empty() {
        return Err(MigrateError::OperationNotAllowed(format!(
            "metadata import dry run reported conflicts: {}",
            conflicts.join(", ")
        )));
    }

    Ok(())
}

/// Precondition 3: every attached non-CD non-empty VBD's VDI must appear in
/// the effective `vdi_map`. Returns the offending VDI, if any.
pub fn assert_all_leaf_vdis_mapped(
    vbds: &[crate::model::Vbd],
    vdi_map: &HashSet<VdiRef>,
) -> Result<()> {
    for vbd in vbds {
        if !vbd.is_leaf_disk() {
            continue;
        }
        if let Some(vdi) = &vbd.vdi {
            if !vdi_map.contains(vdi) {
                return Err(MigrateError::VdiNotInMap(vdi.to_string()));
            }
        }
    }
    Ok(())
}
