//! End-to-end convergence scenarios against the simulated cloud and agents.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{
    AddressRange, DeploymentManifest, DiskSpec, FleetConfig, GroupNetwork, InstanceGroupSpec,
    NetworkKind, NetworkSpec, Quota, UpdatePolicy,
};
use fleetgrid_agent::{AgentFault, SimulatedAgents};
use fleetgrid_cloud::{CloudOp, SimulatedCloud};
use fleetgrid_converge::{ConvergeError, Engine, FailedStep};
use fleetgrid_lock::LockError;
use fleetgrid_rollout::{GroupStatus, TeardownStep};
use fleetgrid_state::{InstanceState, StateStore, TaskStatus};
use tokio::sync::watch;

struct Harness {
    engine: Engine,
    cloud: Arc<SimulatedCloud>,
    agents: Arc<SimulatedAgents>,
}

fn config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.agent.timeout_ms = 500;
    config.agent.retries = 0;
    config.locks.poll_interval_ms = 2;
    config.update.watch_poll_interval_ms = 2;
    config
}

fn harness_with(store: StateStore, config: &FleetConfig, agents: SimulatedAgents) -> Harness {
    let cloud = Arc::new(SimulatedCloud::new());
    let agents = Arc::new(agents);
    let engine = Engine::from_config(store, config, cloud.clone(), agents.clone());
    Harness {
        engine,
        cloud,
        agents,
    }
}

fn harness() -> Harness {
    harness_with(
        StateStore::open_in_memory().unwrap(),
        &config(),
        SimulatedAgents::new(),
    )
}

fn policy(canaries: u32, max_in_flight: u32) -> UpdatePolicy {
    UpdatePolicy {
        canaries: Quota::Count(canaries),
        max_in_flight: Quota::Count(max_in_flight),
        canary_watch_time_ms: 20,
        update_watch_time_ms: 20,
        serial: true,
    }
}

fn group(name: &str, instances: u32, release: &str) -> InstanceGroupSpec {
    InstanceGroupSpec {
        name: name.to_string(),
        instances,
        release_version: release.to_string(),
        stemcell: "jammy".to_string(),
        vm_type: "small".to_string(),
        networks: vec![GroupNetwork {
            name: "private".to_string(),
            static_ips: vec![],
        }],
        persistent_disk: None,
        disk_retention: Default::default(),
        drain: None,
        update: None,
        properties: Default::default(),
    }
}

fn manifest(name: &str, update: UpdatePolicy, groups: Vec<InstanceGroupSpec>) -> DeploymentManifest {
    DeploymentManifest {
        name: name.to_string(),
        update,
        networks: vec![NetworkSpec {
            name: "private".to_string(),
            kind: NetworkKind::Static,
            range: AddressRange::new("10.0.0.2".parse().unwrap(), "10.0.0.11".parse().unwrap()),
        }],
        instance_groups: groups,
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Index of the first and last agent call made for `instance`.
fn call_window(agents: &SimulatedAgents, instance: &str) -> (usize, usize) {
    let calls = agents.calls();
    let positions: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.agent_id.starts_with(&format!("{instance}#")))
        .map(|(i, _)| i)
        .collect();
    (positions[0], positions[positions.len() - 1])
}

#[tokio::test]
async fn rolls_canary_then_remainder() {
    let h = harness();
    let v1 = manifest("cf", policy(1, 2), vec![group("web", 3, "A")]);
    let report = h.engine.converge(&v1, no_cancel()).await.unwrap();
    assert!(report.succeeded(), "{report:?}");

    h.agents.clear_calls();
    let v2 = manifest("cf", policy(1, 2), vec![group("web", 3, "B")]);
    let report = h.engine.converge(&v2, no_cancel()).await.unwrap();
    assert!(report.succeeded(), "{report:?}");

    let (_, canary_end) = call_window(&h.agents, "cf/web/0");
    let (first_1, last_1) = call_window(&h.agents, "cf/web/1");
    let (first_2, last_2) = call_window(&h.agents, "cf/web/2");
    assert!(canary_end < first_1 && canary_end < first_2);
    // web/1 and web/2 were in flight together
    assert!(first_2 < last_1 && first_1 < last_2);

    let group = report.group("web").unwrap();
    assert!(group.instances[0].canary);
    assert!(!group.instances[1].canary);

    let instances = h.engine.store().list_instances("cf").unwrap();
    assert_eq!(instances.len(), 3);
    for rec in &instances {
        assert_eq!(rec.state, InstanceState::Running);
        let agent = &rec.vm.as_ref().unwrap().agent_id;
        assert_eq!(h.agents.applied(agent).unwrap()["release_version"], "B");
    }
    assert_eq!(h.engine.store().list_reservations().unwrap().len(), 3);
    assert!(h.engine.store().list_orphaned_disks().unwrap().is_empty());
    assert_eq!(h.cloud.calls(CloudOp::CreateVm), 3);
}

#[tokio::test]
async fn second_run_is_a_noop() {
    let h = harness();
    let m = manifest("cf", policy(1, 2), vec![group("web", 3, "A")]);
    h.engine.converge(&m, no_cancel()).await.unwrap();
    let before = h.engine.store().list_instances("cf").unwrap();

    h.agents.clear_calls();
    let report = h.engine.converge(&m, no_cancel()).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.instances().count(), 0);
    assert!(h.agents.calls().is_empty());
    assert_eq!(h.cloud.calls(CloudOp::CreateVm), 3);

    let after = h.engine.store().list_instances("cf").unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn failed_canary_leaves_remainder_untouched() {
    let h = harness();
    h.agents.inject(AgentFault::flap("cf/web/0"));
    let m = manifest("cf", policy(2, 2), vec![group("web", 10, "A")]);
    let report = h.engine.converge(&m, no_cancel()).await.unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.group("web").unwrap().status, GroupStatus::Failed);

    let instances = h.engine.store().list_instances("cf").unwrap();
    for rec in instances.iter().filter(|r| r.index >= 2) {
        assert_eq!(rec.state, InstanceState::Detached, "{}", rec.name());
        assert!(rec.vm.is_none());
        assert!(h.agents.calls_for(&rec.table_key()).is_empty());
    }
    assert_eq!(h.cloud.calls(CloudOp::CreateVm), 2);
    assert!(matches!(instances[0].state, InstanceState::Failed { .. }));
}

#[tokio::test]
async fn max_in_flight_bounds_agent_calls() {
    let h = harness_with(
        StateStore::open_in_memory().unwrap(),
        &config(),
        SimulatedAgents::new().with_latency(Duration::from_millis(3)),
    );
    let m = manifest("cf", policy(0, 3), vec![group("web", 10, "A")]);
    let report = h.engine.converge(&m, no_cancel()).await.unwrap();

    assert!(report.succeeded(), "{report:?}");
    let peak = h.agents.peak_in_flight();
    assert!(peak <= 3, "peak {peak}");
}

#[tokio::test]
async fn concurrent_deployments_never_share_an_address() {
    let h = harness();
    let a = manifest("a", policy(0, 5), vec![group("web", 5, "A")]);
    let b = manifest("b", policy(0, 5), vec![group("web", 5, "A")]);

    let (ra, rb) = tokio::join!(
        h.engine.converge(&a, no_cancel()),
        h.engine.converge(&b, no_cancel())
    );
    assert!(ra.unwrap().succeeded());
    assert!(rb.unwrap().succeeded());

    let reservations = h.engine.store().list_reservations().unwrap();
    assert_eq!(reservations.len(), 10);
    let unique: HashSet<_> = reservations.iter().map(|r| r.address).collect();
    assert_eq!(unique.len(), 10);
}

#[tokio::test]
async fn failed_migration_keeps_old_disk() {
    let h = harness();
    let mut web = group("db", 1, "A");
    web.persistent_disk = Some(DiskSpec {
        size_mb: 512,
        disk_type: "default".to_string(),
    });
    let m1 = manifest("cf", policy(1, 1), vec![web.clone()]);
    h.engine.converge(&m1, no_cancel()).await.unwrap();
    let old = h.engine.store().list_instances("cf").unwrap()[0]
        .disk
        .clone()
        .unwrap();

    h.agents
        .inject(AgentFault::fail("cf/db/0", "migrate_disk", "copy failed"));
    web.persistent_disk = Some(DiskSpec {
        size_mb: 1024,
        disk_type: "default".to_string(),
    });
    let m2 = manifest("cf", policy(1, 1), vec![web]);
    let report = h.engine.converge(&m2, no_cancel()).await.unwrap();
    assert!(!report.succeeded());

    let rec = h.engine.store().list_instances("cf").unwrap().remove(0);
    assert_eq!(rec.disk.as_ref().unwrap().cid, old.cid);
    let vm = rec.vm.as_ref().unwrap();
    assert_eq!(h.cloud.disk(&old.cid).unwrap().attached_to, Some(vm.cid.clone()));
    assert_eq!(h.cloud.disks().len(), 1);
    assert!(h.engine.store().list_orphaned_disks().unwrap().is_empty());

    h.agents.clear_faults();
    let report = h.engine.converge(&m2, no_cancel()).await.unwrap();
    assert!(report.succeeded(), "{report:?}");
    let rec = h.engine.store().list_instances("cf").unwrap().remove(0);
    assert_ne!(rec.disk.as_ref().unwrap().cid, old.cid);
    let orphans = h.engine.store().list_orphaned_disks().unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].cid, old.cid);
    assert_eq!(report.orphaned_disks, vec![old.cid]);
}

#[tokio::test]
async fn overlapping_runs_on_one_deployment_are_exclusive() {
    let mut cfg = config();
    cfg.locks.deployment_timeout_ms = 30;
    let h = harness_with(StateStore::open_in_memory().unwrap(), &cfg, SimulatedAgents::new());
    let mut slow = policy(1, 1);
    slow.canary_watch_time_ms = 200;
    let m = manifest("cf", slow, vec![group("web", 1, "A")]);

    let (first, second) = tokio::join!(
        h.engine.converge(&m, no_cancel()),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.engine.converge(&m, no_cancel()).await
        }
    );
    assert!(first.unwrap().succeeded());
    match second {
        Err(ConvergeError::Lock(LockError::Timeout { key, .. })) => assert_eq!(key, "deployment/cf"),
        other => panic!("expected lock timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn scale_down_deprovisions_removed_instances() {
    let h = harness();
    let mut web = group("web", 3, "A");
    web.persistent_disk = Some(DiskSpec {
        size_mb: 128,
        disk_type: "default".to_string(),
    });
    h.engine
        .converge(&manifest("cf", policy(1, 3), vec![web.clone()]), no_cancel())
        .await
        .unwrap();

    web.instances = 1;
    let report = h
        .engine
        .converge(&manifest("cf", policy(1, 3), vec![web]), no_cancel())
        .await
        .unwrap();
    assert!(report.succeeded(), "{report:?}");
    assert_eq!(report.removals.len(), 2);

    let instances = h.engine.store().list_instances("cf").unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(h.cloud.vms().len(), 1);
    assert_eq!(h.engine.store().list_reservations().unwrap().len(), 1);
    assert_eq!(h.engine.store().list_orphaned_disks().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_removal_reports_teardown_step() {
    let h = harness();
    let mut web = group("web", 2, "A");
    h.engine
        .converge(&manifest("cf", policy(1, 2), vec![web.clone()]), no_cancel())
        .await
        .unwrap();

    h.cloud.fail_next(CloudOp::DeleteVm, 1);
    web.instances = 1;
    let report = h
        .engine
        .converge(&manifest("cf", policy(1, 2), vec![web]), no_cancel())
        .await
        .unwrap();
    assert!(!report.succeeded());
    let removed = &report.removals[0];
    assert_eq!(removed.name, "web/1");
    assert_eq!(
        removed.failed_step,
        Some(FailedStep::Teardown(TeardownStep::DeletingVm))
    );
    // the record stays so the next run retries the teardown
    assert_eq!(h.engine.store().list_instances("cf").unwrap().len(), 2);
}

#[tokio::test]
async fn cancelled_run_touches_nothing() {
    let h = harness();
    let (tx, rx) = watch::channel(true);
    let m = manifest("cf", policy(1, 2), vec![group("web", 3, "A")]);
    let report = h.engine.converge(&m, rx).await.unwrap();
    drop(tx);

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.instances().all(|i| !i.started));
    assert_eq!(h.cloud.calls(CloudOp::CreateVm), 0);
    assert!(h.agents.calls().is_empty());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.redb");
    let path = dir.path().join("cf.toml");
    std::fs::write(
        &path,
        r#"
name = "cf"

[update]
canaries = 1
max_in_flight = "50%"
canary_watch_time_ms = 10
update_watch_time_ms = 10

[[networks]]
name = "private"
type = "static"
range = { first = "10.0.0.2", last = "10.0.0.20" }

[[instance_groups]]
name = "router"
instances = 2
release_version = "1.0"
stemcell = "jammy"
vm_type = "small"
networks = [{ name = "private", static_ips = ["10.0.0.5", "10.0.0.6"] }]
"#,
    )
    .unwrap();
    let m = DeploymentManifest::from_file(&path).unwrap();

    {
        let h = harness_with(StateStore::open(&db).unwrap(), &config(), SimulatedAgents::new());
        assert!(h.engine.converge(&m, no_cancel()).await.unwrap().succeeded());
    }
    // let the aborted lock renewal task drop its database handle
    tokio::time::sleep(Duration::from_millis(20)).await;

    let h = harness_with(StateStore::open(&db).unwrap(), &config(), SimulatedAgents::new());
    let report = h.engine.converge(&m, no_cancel()).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.instances().count(), 0);
    let addresses: Vec<String> = h
        .engine
        .store()
        .list_reservations()
        .unwrap()
        .iter()
        .map(|r| r.address.to_string())
        .collect();
    assert_eq!(addresses, ["10.0.0.5", "10.0.0.6"]);
}

#[tokio::test]
async fn parallel_groups_overlap_and_serial_group_waits() {
    let h = harness_with(
        StateStore::open_in_memory().unwrap(),
        &config(),
        SimulatedAgents::new().with_latency(Duration::from_millis(3)),
    );
    let mut parallel = policy(0, 1);
    parallel.serial = false;
    let mut web = group("web", 1, "A");
    web.update = Some(parallel.clone());
    let mut api = group("api", 1, "A");
    api.update = Some(parallel);
    let mut db = group("db", 1, "A");
    db.update = Some(policy(0, 1));

    let m = manifest("cf", policy(0, 1), vec![web, api, db]);
    let report = h.engine.converge(&m, no_cancel()).await.unwrap();
    assert!(report.succeeded(), "{report:?}");

    let (web_first, web_last) = call_window(&h.agents, "cf/web/0");
    let (api_first, api_last) = call_window(&h.agents, "cf/api/0");
    let (db_first, _) = call_window(&h.agents, "cf/db/0");
    // web and api share a batch
    assert!(web_first < api_last && api_first < web_last);
    assert!(db_first > web_last && db_first > api_last);
}

#[tokio::test]
async fn engines_sharing_a_store_never_share_an_address() {
    let store = StateStore::open_in_memory().unwrap();
    let one = harness_with(store.clone(), &config(), SimulatedAgents::new());
    let two = harness_with(store.clone(), &config(), SimulatedAgents::new());
    let dynamic = |name: &str, instances: u32| {
        let mut m = manifest(name, policy(0, 3), vec![group("web", instances, "A")]);
        m.networks[0].kind = NetworkKind::Dynamic;
        m
    };

    let a = one.engine.converge(&dynamic("a", 3), no_cancel()).await.unwrap();
    let b = two.engine.converge(&dynamic("b", 3), no_cancel()).await.unwrap();
    assert!(a.succeeded(), "{a:?}");
    assert!(b.succeeded(), "{b:?}");

    let manifest_c = dynamic("c", 2);
    let manifest_d = dynamic("d", 2);
    let (c, d) = tokio::join!(
        one.engine.converge(&manifest_c, no_cancel()),
        two.engine.converge(&manifest_d, no_cancel())
    );
    assert!(c.unwrap().succeeded());
    assert!(d.unwrap().succeeded());

    let mut held = Vec::new();
    for name in ["a", "b", "c", "d"] {
        for rec in store.list_instances(name).unwrap() {
            held.extend(rec.reservations.iter().map(|r| (r.address, r.instance.clone())));
        }
    }
    let unique: HashSet<_> = held.iter().map(|(address, _)| *address).collect();
    assert_eq!(held.len(), 10);
    assert_eq!(unique.len(), 10);

    let mut stored: Vec<_> = store
        .list_reservations()
        .unwrap()
        .into_iter()
        .map(|r| (r.address, r.instance))
        .collect();
    stored.sort();
    held.sort();
    assert_eq!(stored, held);

    // The range is now exhausted for both engines.
    let e = one.engine.converge(&dynamic("e", 1), no_cancel()).await.unwrap();
    assert!(!e.succeeded());
}
