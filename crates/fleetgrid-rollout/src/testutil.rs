use std::sync::Arc;
use std::time::Duration;

use fleet_core::{AddressRange, GroupNetwork, InstanceGroupSpec, NetworkKind, NetworkSpec};
use fleetgrid_agent::{AgentClient, SimulatedAgents};
use fleetgrid_cloud::SimulatedCloud;
use fleetgrid_lock::{LockManager, MemoryLockBackend};
use fleetgrid_network::{MemoryReservations, NetworkAllocator};

use crate::context::Collaborators;

pub fn group(release: &str) -> InstanceGroupSpec {
    InstanceGroupSpec {
        name: "web".to_string(),
        instances: 3,
        release_version: release.to_string(),
        stemcell: "jammy".to_string(),
        vm_type: "small".to_string(),
        networks: vec![GroupNetwork {
            name: "pool".to_string(),
            static_ips: vec![],
        }],
        persistent_disk: None,
        disk_retention: Default::default(),
        drain: None,
        update: None,
        properties: Default::default(),
    }
}

pub struct Fixture {
    pub cloud: Arc<SimulatedCloud>,
    pub agents: Arc<SimulatedAgents>,
    pub ctx: Collaborators,
}

pub fn fixture() -> Fixture {
    fixture_with(SimulatedAgents::new())
}

pub fn fixture_with(agents: SimulatedAgents) -> Fixture {
    let cloud = Arc::new(SimulatedCloud::new());
    let agents = Arc::new(agents);
    let locks = LockManager::new(Arc::new(MemoryLockBackend::new()))
        .with_poll_interval(Duration::from_millis(1));
    let network = NetworkAllocator::new(
        locks,
        Arc::new(MemoryReservations::new()),
        Duration::from_secs(5),
    );
    network.register(&NetworkSpec {
        name: "pool".to_string(),
        kind: NetworkKind::Dynamic,
        range: AddressRange::new("10.1.0.2".parse().unwrap(), "10.1.0.60".parse().unwrap()),
    });
    let client = AgentClient::new(agents.clone(), Duration::from_millis(200), 0);
    let ctx = Collaborators::new(cloud.clone(), client, network, Duration::from_millis(5));
    Fixture { cloud, agents, ctx }
}
