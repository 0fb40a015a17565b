//! Round-robin-on-failure endpoint ordering and peer tracking.

use parking_lot::Mutex;
use tracing::info;

use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::Result;

/// Mutable ordering of a client's candidate endpoints.
///
/// The head of the list is the endpoint the transport talks to. When the
/// head is found unreachable the list is rotated left by one, moving the old
/// head to the tail.
pub struct Resolver {
    client_id: String,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl Resolver {
    pub fn new(client_id: &str, targets: &EndpointSet) -> Result<Self> {
        targets.validate()?;
        Ok(Self {
            client_id: client_id.to_string(),
            endpoints: Mutex::new(targets.endpoints().to_vec()),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    /// Current ordering, head first.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().clone()
    }

    pub fn head(&self) -> Endpoint {
        self.endpoints.lock()[0].clone()
    }

    /// Rotate left by one and return the new head.
    pub fn resolve_now(&self) -> Endpoint {
        let mut endpoints = self.endpoints.lock();
        if endpoints.len() > 1 {
            endpoints.rotate_left(1);
            info!(
                client_id = %self.client_id,
                head = %endpoints[0],
                "rotated management endpoints"
            );
        }
        endpoints[0].clone()
    }
}

/// What a call's serving endpoint says about the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    /// First call on this client.
    First,
    Same,
    Switched { from: Endpoint },
}

/// Remembers which endpoint served the previous call.
#[derive(Debug, Default)]
pub struct PeerTracker {
    last: Option<Endpoint>,
    switches: u64,
}

impl PeerTracker {
    pub fn observe(&mut self, peer: &Endpoint) -> PeerChange {
        let change = match &self.last {
            None => PeerChange::First,
            Some(last) if last == peer => PeerChange::Same,
            Some(last) => {
                self.switches += 1;
                PeerChange::Switched { from: last.clone() }
            }
        };
        if change != PeerChange::Same {
            self.last = Some(peer.clone());
        }
        change
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(eps: &[&str]) -> Resolver {
        Resolver::new("c1", &EndpointSet::parse(eps).unwrap()).unwrap()
    }

    #[test]
    fn rotation_moves_head_to_tail() {
        let r = resolver(&["a:1", "b:1", "c:1"]);
        assert_eq!(r.head().to_string(), "a:1");
        assert_eq!(r.resolve_now().to_string(), "b:1");
        let order: Vec<String> = r.endpoints().iter().map(|e| e.to_string()).collect();
        assert_eq!(order, vec!["b:1", "c:1", "a:1"]);
    }

    #[test]
    fn full_cycle_restores_order() {
        let r = resolver(&["a:1", "b:1", "c:1"]);
        let before = r.endpoints();
        for _ in 0..3 {
            r.resolve_now();
        }
        assert_eq!(r.endpoints(), before);
    }

    #[test]
    fn single_endpoint_is_stable() {
        let r = resolver(&["a:1"]);
        assert_eq!(r.resolve_now().to_string(), "a:1");
    }

    #[test]
    fn empty_targets_rejected() {
        assert!(Resolver::new("c1", &EndpointSet::default()).is_err());
    }

    #[test]
    fn peer_tracker_reports_switches() {
        let a = Endpoint::parse("a:1").unwrap();
        let b = Endpoint::parse("b:1").unwrap();
        let mut peers = PeerTracker::default();
        assert_eq!(peers.observe(&a), PeerChange::First);
        assert_eq!(peers.observe(&a), PeerChange::Same);
        assert_eq!(peers.observe(&b), PeerChange::Switched { from: a.clone() });
        assert_eq!(peers.observe(&a), PeerChange::Switched { from: b });
        assert_eq!(peers.switches(), 2);
    }
}
