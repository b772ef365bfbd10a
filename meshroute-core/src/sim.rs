//! In-process mesh: several engines, a link set, a virtual clock.
//!
//! Plays the host for every node: delivers broadcasts to linked neighbors,
//! unicasts over existing links only (a severed link silently loses the
//! payload), and runs armed timers in deadline order. Everything is
//! deterministic, which makes multi-hop scenarios testable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use tracing::warn;

use crate::address::NodeAddress;
use crate::config::Config;
use crate::engine::{Action, Event, RouteEngine};
use crate::timer::TimerId;
use crate::wire::{self, Payload};

/// Upper bound on deliveries per `settle`, in case a bug makes the mesh chatter forever.
const MAX_DELIVERIES: usize = 10_000;

/// One payload put on the air, decoded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub at: Duration,
    pub from: NodeAddress,
    /// `None` for a broadcast.
    pub to: Option<NodeAddress>,
    pub payload: Payload,
}

enum Delivery {
    Broadcast { from: NodeAddress, bytes: Vec<u8> },
    Unicast { from: NodeAddress, to: NodeAddress, bytes: Vec<u8> },
}

#[derive(Default)]
pub struct Mesh {
    nodes: BTreeMap<NodeAddress, RouteEngine>,
    links: BTreeSet<(NodeAddress, NodeAddress)>,
    now: Duration,
    /// (deadline, node, timer). Ordered by deadline, then insertion via timer id.
    timers: BTreeSet<(Duration, NodeAddress, TimerId)>,
    queue: VecDeque<Delivery>,
    events: Vec<(NodeAddress, Event)>,
    transmissions: Vec<Transmission>,
}

fn link_key(a: NodeAddress, b: NodeAddress) -> (NodeAddress, NodeAddress) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes connected in a line, each linked to its neighbors in the slice.
    pub fn line(addresses: &[NodeAddress]) -> Self {
        let mut mesh = Self::new();
        for &a in addresses {
            mesh.add_node(a);
        }
        for pair in addresses.windows(2) {
            mesh.link(pair[0], pair[1]);
        }
        mesh
    }

    pub fn add_node(&mut self, address: NodeAddress) {
        self.add_node_with_config(address, Config::default());
    }

    pub fn add_node_with_config(&mut self, address: NodeAddress, config: Config) {
        self.nodes
            .insert(address, RouteEngine::with_config(address, config));
    }

    pub fn link(&mut self, a: NodeAddress, b: NodeAddress) {
        self.links.insert(link_key(a, b));
    }

    pub fn sever(&mut self, a: NodeAddress, b: NodeAddress) {
        self.links.remove(&link_key(a, b));
    }

    pub fn linked(&self, a: NodeAddress, b: NodeAddress) -> bool {
        self.links.contains(&link_key(a, b))
    }

    /// Panics if `address` was never added.
    pub fn node(&self, address: NodeAddress) -> &RouteEngine {
        &self.nodes[&address]
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn events(&self) -> &[(NodeAddress, Event)] {
        &self.events
    }

    pub fn transmissions(&self) -> &[Transmission] {
        &self.transmissions
    }

    /// Application trigger at `at`, then deliver everything that follows (timers not advanced).
    pub fn discover(&mut self, at: NodeAddress, target: NodeAddress) {
        let actions = match self.nodes.get_mut(&at) {
            Some(engine) => engine.discover(target),
            None => return,
        };
        self.apply(at, actions);
        self.settle();
    }

    /// Deliver queued payloads until the air is quiet.
    pub fn settle(&mut self) {
        let mut delivered = 0;
        while let Some(delivery) = self.queue.pop_front() {
            delivered += 1;
            if delivered > MAX_DELIVERIES {
                warn!("delivery limit reached, dropping remaining traffic");
                self.queue.clear();
                return;
            }
            match delivery {
                Delivery::Broadcast { from, bytes } => {
                    let neighbors: Vec<NodeAddress> = self
                        .nodes
                        .keys()
                        .copied()
                        .filter(|&n| n != from && self.linked(from, n))
                        .collect();
                    for n in neighbors {
                        let result = self
                            .nodes
                            .get_mut(&n)
                            .map(|e| e.on_broadcast_received(&bytes, from));
                        self.absorb(n, result);
                    }
                }
                Delivery::Unicast { from, to, bytes } => {
                    if !self.linked(from, to) {
                        continue;
                    }
                    let result = self
                        .nodes
                        .get_mut(&to)
                        .map(|e| e.on_unicast_received(&bytes, from));
                    self.absorb(to, result);
                }
            }
        }
    }

    /// Advance the clock by `by`, firing due timers in order and settling after each.
    pub fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        while let Some(&(deadline, node, timer)) = self.timers.first() {
            if deadline > until {
                break;
            }
            self.timers.remove(&(deadline, node, timer));
            self.now = deadline;
            let actions = match self.nodes.get_mut(&node) {
                Some(engine) => engine.on_timer_fired(timer),
                None => continue,
            };
            self.apply(node, actions);
            self.settle();
        }
        self.now = until;
    }

    /// Settle, then fire timers until none remain.
    pub fn run_until_quiet(&mut self) {
        self.settle();
        while let Some(&(deadline, _, _)) = self.timers.first() {
            self.advance(deadline.saturating_sub(self.now));
        }
    }

    fn absorb(
        &mut self,
        node: NodeAddress,
        result: Option<Result<Vec<Action>, crate::engine::MessageError>>,
    ) {
        match result {
            Some(Ok(actions)) => self.apply(node, actions),
            Some(Err(e)) => warn!(%node, error = %e, "payload rejected"),
            None => {}
        }
    }

    fn apply(&mut self, node: NodeAddress, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(bytes) => {
                    self.record(node, None, &bytes);
                    self.queue.push_back(Delivery::Broadcast { from: node, bytes });
                }
                Action::Unicast(to, bytes) => {
                    self.record(node, Some(to), &bytes);
                    self.queue.push_back(Delivery::Unicast {
                        from: node,
                        to,
                        bytes,
                    });
                }
                Action::ArmTimer { timer, after } => {
                    self.timers.insert((self.now + after, node, timer));
                }
                Action::CancelTimer(timer) => {
                    self.timers.retain(|&(_, n, t)| !(n == node && t == timer));
                }
                Action::Notify(event) => self.events.push((node, event)),
            }
        }
    }

    fn record(&mut self, from: NodeAddress, to: Option<NodeAddress>, bytes: &[u8]) {
        if let Ok(payload) = wire::decode_payload(bytes) {
            self.transmissions.push(Transmission {
                at: self.now,
                from,
                to,
                payload,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{BroadcastId, SequenceNumber};
    use crate::protocol::{Message, INFINITE_DISTANCE};

    fn addr(n: u8) -> NodeAddress {
        NodeAddress::new(n, 0)
    }

    fn chain() -> Mesh {
        Mesh::line(&[addr(1), addr(2), addr(3)])
    }

    fn messages(mesh: &Mesh) -> Vec<(NodeAddress, Option<NodeAddress>, Message)> {
        mesh.transmissions()
            .iter()
            .filter_map(|t| match &t.payload {
                Payload::Message(m) => Some((t.from, t.to, m.clone())),
                Payload::Ack => None,
            })
            .collect()
    }

    #[test]
    fn chain_discovery_builds_forward_and_reverse_paths() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));

        let n1 = mesh.node(addr(1)).table().find(addr(3)).copied().unwrap();
        assert_eq!(n1.next_hop, addr(2));
        assert_eq!(n1.distance, 2);

        let n2 = mesh.node(addr(2)).table();
        assert_eq!(n2.find(addr(1)).unwrap().next_hop, addr(1));
        let fwd = n2.find(addr(3)).unwrap();
        assert_eq!(fwd.next_hop, addr(3));
        assert_eq!(fwd.distance, 1);

        assert_eq!(
            mesh.events(),
            &[(
                addr(1),
                Event::RouteEstablished {
                    dest: addr(3),
                    next_hop: addr(2),
                    distance: 2
                }
            )]
        );
    }

    #[test]
    fn end_to_end_trace() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));

        let rreq = |distance| Message::RouteRequest {
            source: addr(1),
            source_seq: SequenceNumber(1),
            broadcast_id: BroadcastId(1),
            dest: addr(3),
            dest_seq: SequenceNumber::UNKNOWN,
            distance,
        };
        let rrep = |distance| Message::RouteReply {
            requester: addr(1),
            dest: addr(3),
            dest_seq: SequenceNumber(1),
            distance,
        };
        assert_eq!(
            messages(&mesh),
            vec![
                (addr(1), None, rreq(1)),
                (addr(2), None, rreq(2)),
                (addr(3), Some(addr(2)), rrep(1)),
                (addr(2), Some(addr(1)), rrep(2)),
            ]
        );

        // Node 3 learned the way back through node 2.
        let back = mesh.node(addr(3)).table().find(addr(1)).copied().unwrap();
        assert_eq!(back.next_hop, addr(2));
        assert_eq!(back.distance, 2);
        assert_eq!(back.broadcast_id, BroadcastId(1));
    }

    #[test]
    fn reverse_path_survives_confirmation_timers() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();
        assert!(mesh.node(addr(2)).table().find(addr(1)).is_some());
        assert_eq!(mesh.node(addr(2)).pending().count(), 0);
    }

    #[test]
    fn duplicate_floods_rebroadcast_once_per_node() {
        // Diamond: 1 reaches 4 through both 2 and 3; 4 must not re-flood twice.
        let mut mesh = Mesh::new();
        for n in 1..=5 {
            mesh.add_node(addr(n));
        }
        mesh.link(addr(1), addr(2));
        mesh.link(addr(1), addr(3));
        mesh.link(addr(2), addr(4));
        mesh.link(addr(3), addr(4));
        mesh.link(addr(4), addr(5));
        mesh.discover(addr(1), addr(9));

        let floods_from = |n: u8| {
            messages(&mesh)
                .iter()
                .filter(|(from, to, m)| {
                    *from == addr(n) && to.is_none() && matches!(m, Message::RouteRequest { .. })
                })
                .count()
        };
        assert_eq!(floods_from(1), 1);
        assert_eq!(floods_from(2), 1);
        assert_eq!(floods_from(3), 1);
        assert_eq!(floods_from(4), 1);
        assert_eq!(floods_from(5), 1);
    }

    #[test]
    fn unanswered_discovery_reports_no_route_and_cleans_up() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(9));
        mesh.run_until_quiet();
        assert!(mesh
            .events()
            .contains(&(addr(1), Event::NoRoute { dest: addr(9) })));
        // Unconfirmed reverse pointers were garbage collected.
        assert!(mesh.node(addr(2)).table().find(addr(1)).is_none());
        assert!(mesh.node(addr(3)).table().find(addr(1)).is_none());
    }

    #[test]
    fn probe_traces_established_path() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();
        assert!(mesh.events().contains(&(
            addr(3),
            Event::PathTraced {
                origin: addr(1),
                path: vec![addr(1), addr(2), addr(3)],
            }
        )));
        // Every hop acked, so no failure was assumed anywhere.
        assert!(mesh.node(addr(1)).table().find(addr(3)).unwrap().is_reachable());
        assert!(mesh.node(addr(2)).table().find(addr(3)).unwrap().is_reachable());
    }

    #[test]
    fn severed_link_propagates_route_error_to_origin() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        mesh.sever(addr(2), addr(3));
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        assert_eq!(
            mesh.node(addr(2)).table().find(addr(3)).unwrap().distance,
            INFINITE_DISTANCE
        );
        assert_eq!(
            mesh.node(addr(1)).table().find(addr(3)).unwrap().distance,
            INFINITE_DISTANCE
        );
        assert!(mesh
            .events()
            .contains(&(addr(1), Event::RouteLost { dest: addr(3) })));
        // Node 1's own wait was satisfied by node 2's ack.
        assert!(!mesh
            .events()
            .contains(&(addr(1), Event::NoRoute { dest: addr(3) })));
    }

    #[test]
    fn unacked_first_hop_reports_no_route_at_origin() {
        let mut mesh = chain();
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        mesh.sever(addr(1), addr(2));
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        assert_eq!(
            mesh.node(addr(1)).table().find(addr(3)).unwrap().distance,
            INFINITE_DISTANCE
        );
        assert!(mesh
            .events()
            .contains(&(addr(1), Event::NoRoute { dest: addr(3) })));
        assert!(!mesh
            .events()
            .contains(&(addr(1), Event::RouteLost { dest: addr(3) })));
        // Node 2 never saw the probe, so its route is untouched.
        assert!(mesh.node(addr(2)).table().find(addr(3)).unwrap().is_reachable());
    }

    #[test]
    fn rediscovery_after_failure_uses_new_path() {
        let mut mesh = chain();
        mesh.add_node(addr(4));
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        mesh.sever(addr(2), addr(3));
        mesh.discover(addr(1), addr(3));
        mesh.run_until_quiet();

        // A detour appears: 2 - 4 - 3.
        mesh.link(addr(2), addr(4));
        mesh.link(addr(4), addr(3));
        mesh.discover(addr(1), addr(3));
        mesh.settle();

        let route = mesh.node(addr(1)).table().find(addr(3)).copied().unwrap();
        assert!(route.is_reachable());
        assert_eq!(route.next_hop, addr(2));
        assert_eq!(route.distance, 3);
        assert_eq!(
            mesh.node(addr(2)).table().find(addr(3)).unwrap().next_hop,
            addr(4)
        );
    }
}
