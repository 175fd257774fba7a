//! Host selection for new instances.

use harbor_model::Host;

/// One host considered for placement, with its current load.
#[derive(Debug, Clone)]
pub struct HostCandidate {
    pub host: Host,
    /// RAM already committed to instances on this host, in bytes.
    pub committed_ram: u64,
    /// Instances of the service being placed already on this host.
    pub same_service_instances: u32,
}

impl HostCandidate {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            committed_ram: 0,
            same_service_instances: 0,
        }
    }

    pub fn free_ram(&self) -> u64 {
        self.host
            .resources
            .memory_bytes
            .saturating_sub(self.committed_ram)
    }
}

/// Order eligible hosts for a service needing `ram_commitment` bytes per
/// instance.
///
/// Eligibility: enough free RAM. Tie-break: fewest instances of the same
/// service, then most free memory, then host id ascending for
/// determinism.
pub fn select_hosts(candidates: &[HostCandidate], ram_commitment: u64) -> Vec<&HostCandidate> {
    let mut eligible: Vec<&HostCandidate> = candidates
        .iter()
        .filter(|c| c.free_ram() >= ram_commitment)
        .collect();
    eligible.sort_by(|a, b| {
        a.same_service_instances
            .cmp(&b.same_service_instances)
            .then(b.free_ram().cmp(&a.free_ram()))
            .then(a.host.id.cmp(&b.host.id))
    });
    eligible
}

/// The lowest instance index not yet in use (dense 0-based ids).
pub fn next_instance_id(used: &[u32]) -> u32 {
    let mut id = 0;
    while used.contains(&id) {
        id += 1;
    }
    id
}
