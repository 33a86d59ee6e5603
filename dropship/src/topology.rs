//! Deterministic fan-out assignment of caller machines to peer proxies.
//!
//! Machines are indexed in the order they are first observed within a
//! `(stamp, domain)` epoch. Seeds fetch directly from storage; every other
//! machine draws from a small cohort of older peers, producing a tree-like
//! fan-out rooted at the seeds. The epoch rotates with the outer cache entry
//! so topology can reform after fleet churn.

use crate::config::{HostParameters, ProxyConfiguration};
use crate::metrics_defs::TOPOLOGY_ROTATIONS;
use metrics::counter;
use parking_lot::RwLock;
use rand::Rng;
use shared::clock::Clock;
use shared::volatile_map::VolatileMap;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProxyManager {
    topologies: VolatileMap<String, ProxyTopology>,
}

impl ProxyManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        ProxyManager {
            topologies: VolatileMap::new(clock),
        }
    }

    /// `None` means the caller is a seed and fetches directly from the object
    /// store. The result is stable for the machine until the epoch rotates.
    pub fn get_base_address(
        &self,
        parameters: &HostParameters,
        proxy: &ProxyConfiguration,
    ) -> Option<String> {
        let key = format!("{}{}", parameters.stamp, proxy.domain);
        let ttl = proxy.service_configuration.proxy_address_time_to_live();
        let topology = self.topologies.get_or_install(key, ttl, || {
            counter!(TOPOLOGY_ROTATIONS.name).increment(1);
            tracing::debug!(stamp = %parameters.stamp, domain = %proxy.domain, "building proxy topology");
            ProxyTopology::new()
        });
        topology.base_address(&parameters.machine, proxy)
    }
}

#[derive(Default)]
struct MachineSet {
    ordered: Vec<String>,
    index_of: HashMap<String, usize>,
    /// Memoized assignment per machine; keeps the pick stable for the epoch.
    assigned: HashMap<String, Option<String>>,
}

/// Insertion-ordered registry of the machines observed this epoch.
#[derive(Clone)]
struct ProxyTopology {
    machines: Arc<RwLock<MachineSet>>,
}

impl ProxyTopology {
    fn new() -> Self {
        ProxyTopology {
            machines: Arc::new(RwLock::new(MachineSet::default())),
        }
    }

    fn base_address(&self, machine: &str, proxy: &ProxyConfiguration) -> Option<String> {
        if let Some(assigned) = self.machines.read().assigned.get(machine) {
            return assigned.clone();
        }

        let mut set = self.machines.write();
        if let Some(assigned) = set.assigned.get(machine) {
            return assigned.clone();
        }

        let index = match set.index_of.get(machine) {
            Some(&index) => index,
            None => {
                let index = set.ordered.len();
                set.ordered.push(machine.to_string());
                set.index_of.insert(machine.to_string(), index);
                index
            }
        };

        let assigned = pick_peer(&set, index, proxy);
        set.assigned.insert(machine.to_string(), assigned.clone());
        assigned
    }
}

fn pick_peer(set: &MachineSet, index: usize, proxy: &ProxyConfiguration) -> Option<String> {
    if index < proxy.seeds {
        return None;
    }

    // The cohort is drawn from strictly older peers: `lo` shrinks towards the
    // seeds as fan-out grows, so newly-arriving machines pull from established
    // ones rather than from each other.
    let fan_out = proxy.fan_out_factor.max(1);
    let lo = index / fan_out;
    let hi = (lo + fan_out).min(index);
    if hi <= lo {
        // Empty cohort (a fan-out of one would assign the machine to itself);
        // route through the service address instead.
        return default_base_address(proxy);
    }

    let pick = rand::rng().random_range(lo..hi);
    let peer = set.ordered.get(pick)?;
    Some(format!(
        "http://{}:{}/",
        peer, proxy.service_configuration.port
    ))
}

/// Fallback for machines with no peer cohort.
fn default_base_address(proxy: &ProxyConfiguration) -> Option<String> {
    proxy
        .service_configuration
        .deployment_service_url
        .as_ref()
        .map(|url| format!("{}/", url.trim_end_matches('/')))
}
