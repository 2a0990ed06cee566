//! Integration tests driving the orchestrator end to end against the
//! in-memory fake collaborators. Mirrors the scenario seeds.

use hvmotion::collaborators::fakes::{
    FakeDatabase, FakeHypervisorAgent, FakeManagementPlaneClient, FakeStorageAgent,
};
use hvmotion::collaborators::{AgentFault, Database, HypervisorAgent, ManagementPlaneClient, StorageAgent};
use hvmotion::config::EngineConfig;
use hvmotion::error::MigrateError;
use hvmotion::model::{
    HostRef, NetworkRef, OnBoot, PowerState, Sr, SrCapability, SrRef, Vbd, VbdMode, VbdRef,
    VbdType, Vdi, VdiRef, Vif, VifRef, Vm, VmRef,
};
use hvmotion::orchestrator::Orchestrator;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn cross_cluster_dest() -> HashMap<String, String> {
    HashMap::from([
        ("master".to_string(), "https://10.0.0.9/".to_string()),
        ("xenops".to_string(), "https://10.0.0.9/xenops".to_string()),
        ("SM".to_string(), "https://10.0.0.9/sm".to_string()),
        ("host".to_string(), "unresolvable-host-uuid".to_string()),
        ("session_id".to_string(), "tok".to_string()),
    ])
}

fn seed_sr(db: &FakeDatabase, sr_ref: &str) {
    db.put_sr(Sr {
        sr_ref: SrRef(sr_ref.to_string()),
        sr_type: "nfs".to_string(),
        capabilities: HashSet::from([SrCapability::VdiSnapshot, SrCapability::VdiMirror]),
    });
}

fn seed_vm_with_one_disk(db: &FakeDatabase, vm_ref: &str, cbt_enabled: bool) {
    seed_sr(db, "sr-src");

    let vdi = Vdi {
        vdi_ref: VdiRef("vdi-1".into()),
        uuid: "vdi-uuid-1".into(),
        location: "loc-1".into(),
        sr: SrRef("sr-src".into()),
        virtual_size: 1024,
        on_boot: OnBoot::Persist,
        cbt_enabled,
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

fn make_orchestrator() -> (
    Orchestrator,
    Arc<FakeDatabase>,
    Arc<FakeStorageAgent>,
    Arc<FakeHypervisorAgent>,
    Arc<FakeManagementPlaneClient>,
) {
    let db = Arc::new(FakeDatabase::new());
    let storage = Arc::new(FakeStorageAgent::new());
    let agent = Arc::new(FakeHypervisorAgent::new());
    let mgmt = Arc::new(FakeManagementPlaneClient::new());
    let orchestrator = Orchestrator::new(
        db.clone() as Arc<dyn Database>,
        storage.clone() as Arc<dyn StorageAgent>,
        agent.clone() as Arc<dyn HypervisorAgent>,
        mgmt.clone() as Arc<dyn ManagementPlaneClient>,
        EngineConfig::default(),
    );
    (orchestrator, db, storage, agent, mgmt)
}

// Scenario seed 1 (concurrency cap) is covered by throttle.rs's own unit
// tests and orchestrator.rs's concurrency_gate_rejects_fourth_concurrent_call,
// which can reach the private throttle field directly.

// Scenario seed 2: copy within cluster rejected.
#[tokio::test]
async fn copy_within_cluster_rejected() {
    let (orchestrator, db, ..) = make_orchestrator();
    seed_vm_with_one_disk(&db, "vm-1", false);
    db.put_host("local-host", HostRef("host-ref".into()), vec![1, 0], true);

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

// Scenario seed 3: CBT blocks SXM.
#[tokio::test]
async fn cbt_enabled_blocks_migration() {
    let (orchestrator, db, ..) = make_orchestrator();
    seed_vm_with_one_disk(&db, "vm-1", true);

    let result = orchestrator
        .assert_can_migrate(
            &VmRef("vm-1".into()),
            &cross_cluster_dest(),
            &HashMap::from([(VdiRef("vdi-1".into()), SrRef("sr-dst".into()))]),
            &HashMap::new(),
            &HashMap::new(),
        )
        .await;

    assert!(matches!(result, Err(MigrateError::VdiCbtEnabled(_))));
}

// Scenario seed 4: mirror reboot retry.
#[tokio::test]
async fn memory_migration_retries_transient_reboot_fault() {
    use hvmotion::collaborators::MemoryMigrateRequest;
    use hvmotion::memory_migration::migrate_with_retry;

    let agent = FakeHypervisorAgent::new();
    agent.fail_next(AgentFault::Cancelled {
        user_requested: false,
    });

    let req = MemoryMigrateRequest {
        vm_uuid: "vm-1-uuid".into(),
        vdi_locator_map: HashMap::new(),
        vif_map: HashMap::new(),
        vgpu_map: HashMap::new(),
        xenops_url: "https://10.0.0.9/xenops".into(),
        compress: false,
        verify_dest: true,
    };

    let result = migrate_with_retry(&agent, "dbg", &req).await;
    assert!(result.is_ok());
}

// Scenario seed 6: VIF MAC inference.
#[tokio::test]
async fn vif_mac_inference_fills_unmapped_vif() {
    use hvmotion::map_inference::complete_vif_map;

    let vif_a = Vif {
        vif_ref: VifRef("vif-a".into()),
        vm: VmRef("vm-1".into()),
        network: NetworkRef("placeholder".into()),
        mac: "aa:bb:cc:00:00:01".into(),
        device: "0".into(),
    };
    let vif_b = Vif {
        vif_ref: VifRef("vif-b".into()),
        vm: VmRef("vm-1".into()),
        network: NetworkRef("placeholder".into()),
        mac: "aa:bb:cc:00:00:01".into(),
        device: "1".into(),
    };

    let mut explicit = HashMap::new();
    explicit.insert(vif_a.vif_ref.clone(), NetworkRef("net-1".into()));

    let completed = complete_vif_map(&[vif_a, vif_b.clone()], &explicit).unwrap();
    assert_eq!(completed[&vif_b.vif_ref], NetworkRef("net-1".into()));
}

// Scenario seed 7: mirror failure wins during rollback.
#[tokio::test]
async fn mirror_failure_wins_over_triggering_exception() {
    use hvmotion::finalize::{rollback, RollbackContext};
    use hvmotion::model::MirrorRecord;

    let (_, db, _, agent, mgmt) = make_orchestrator();
    db.put_vm(Vm {
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
    };
    let records = vec![record];

    let ctx = RollbackContext {
        db: db.as_ref(),
        mgmt: mgmt.as_ref(),
        agent: agent.as_ref(),
        source_vm: &VmRef("vm-1".into()),
        cross_cluster: false,
        mirror_failed_other_config: Some("vdi-1".to_string()),
        records: &records,
    };

    let result = rollback(ctx, MigrateError::Internal("unrelated fault".to_string())).await;
    assert!(matches!(result, MigrateError::MirrorFailed(ref v) if v == "vdi-1"));
}

// Scenario seed 5: suspend VDI's SR falls back through the documented chain
// (explicit map -> pool suspend SR -> host suspend SR -> pool default SR).
#[tokio::test]
async fn suspend_vdi_falls_back_to_pool_suspend_image_sr() {
    use hvmotion::map_inference::complete_sr_for_vdi;
    use hvmotion::model::OnBoot;

    let db = FakeDatabase::new();
    seed_sr(&db, "sr-src");
    db.put_sr(Sr {
        sr_ref: SrRef("sr-suspend".into()),
        sr_type: "nfs".into(),
        capabilities: HashSet::from([SrCapability::VdiSnapshot, SrCapability::VdiMirror]),
    });

    let suspend_vdi = Vdi {
        vdi_ref: VdiRef("suspend-vdi-1".into()),
        uuid: "suspend-vdi-uuid-1".into(),
        location: "suspend-loc-1".into(),
        sr: SrRef("sr-src".into()),
        virtual_size: 512,
        on_boot: OnBoot::Persist,
        cbt_enabled: false,
        sm_config: HashMap::new(),
        snapshot_of: None,
        snapshot_time: chrono::Utc::now(),
    };

    // No explicit entry, no pool default SR seeded: only the pool/host
    // suspend-image SR fallbacks are in play.
    let sr = complete_sr_for_vdi(
        &db,
        &suspend_vdi,
        true,
        &HashMap::new(),
        None,
        Some(SrRef("sr-suspend".into())),
        None,
    )
    .await
    .unwrap();
    assert_eq!(sr, SrRef("sr-suspend".into()));

    // With neither pool nor host suspend-image SR available, the pool
    // default SR is the last fallback before vdi_not_in_map.
    let sr = complete_sr_for_vdi(
        &db,
        &suspend_vdi,
        true,
        &HashMap::new(),
        Some(SrRef("sr-default".into())),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(sr, SrRef("sr-default".into()));

    // Exhausting every fallback fails with vdi_not_in_map.
    let err = complete_sr_for_vdi(&db, &suspend_vdi, true, &HashMap::new(), None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::VdiNotInMap(ref v) if v == "suspend-vdi-1"));
}

// Full happy-path end-to-end migrate_send(): mirror -> metadata transfer ->
// memory migration -> finalize, cross-cluster.
#[tokio::test]
async fn migrate_send_cross_cluster_happy_path() {
    let (orchestrator, db, storage, _agent, mgmt) = make_orchestrator();
    seed_vm_with_one_disk(&db, "vm-1", false);
    db.put_sr(Sr {
        sr_ref: SrRef("sr-dst".into()),
        sr_type: "nfs".into(),
        capabilities: HashSet::from([SrCapability::VdiSnapshot, SrCapability::VdiMirrorIn]),
    });

    storage
        .dest_locations
        .lock()
        .unwrap()
        .insert("loc-1".to_string(), "dest-loc-1".to_string());
    mgmt.put_vdi_at_location(SrRef("sr-dst".into()), "dest-loc-1", VdiRef("remote-vdi-1".into()));

    let vdi_map = HashMap::from([(VdiRef("vdi-1".into()), SrRef("sr-dst".into()))]);
    // The VM has no VIFs, but the cross-cluster precondition still requires
    // a non-empty map to consider VIFs "mapped".
    let vif_map = HashMap::from([(VifRef("unused-vif".into()), NetworkRef("net-1".into()))]);

    let dest_vm = orchestrator
        .migrate_send(
            &VmRef("vm-1".into()),
            &cross_cluster_dest(),
            &vdi_map,
            &vif_map,
            &HashMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(dest_vm, VmRef("imported-vm-0".into()));
    assert!(db.get_vm(&VmRef("vm-1".into())).await.is_err());
}
