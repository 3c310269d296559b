use std::sync::Arc;
use std::time::Duration;

use fleetgrid_agent::AgentClient;
use fleetgrid_cloud::CloudProvider;
use fleetgrid_disk::DiskManager;
use fleetgrid_network::NetworkAllocator;

/// Everything an updater talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cloud: Arc<dyn CloudProvider>,
    pub agents: AgentClient,
    pub disks: DiskManager,
    pub network: NetworkAllocator,
    /// Interval between agent state polls while watching.
    pub watch_poll_interval: Duration,
}

impl Collaborators {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        agents: AgentClient,
        network: NetworkAllocator,
        watch_poll_interval: Duration,
    ) -> Self {
        let disks = DiskManager::new(cloud.clone(), agents.clone());
        Self {
            cloud,
            agents,
            disks,
            network,
            watch_poll_interval,
        }
    }
}
