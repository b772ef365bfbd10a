//! Pending activities and the single-shot timers that guard them.
//!
//! Every outstanding activity lives here beside its timer handle. A handle
//! that is not in the map is idle: it either fired already or was canceled,
//! so a late expiry from the host is ignored.

use std::collections::BTreeMap;

use crate::address::{BroadcastId, NodeAddress};

/// Opaque timer handle handed to the host with `ArmTimer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TimerId(pub u64);

/// What a running timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// A probe was unicast to `next_hop`; waiting for its ack.
    AwaitingReply {
        origin: NodeAddress,
        target: NodeAddress,
        next_hop: NodeAddress,
        /// Hop the probe arrived from; `None` at the origin.
        previous_hop: Option<NodeAddress>,
    },
    /// This node flooded a request for `target`; waiting for a reply.
    AwaitingRoute { target: NodeAddress },
    /// A request from `origin` was re-flooded; the reverse entry it created
    /// stays only until a reply confirms it.
    AwaitingReverseConfirmation {
        origin: NodeAddress,
        broadcast_id: BroadcastId,
    },
}

#[derive(Debug, Default)]
pub struct Timers {
    next_id: u64,
    pending: BTreeMap<TimerId, Pending>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, state: Pending) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.pending.insert(id, state);
        id
    }

    /// Remove and return the state of a fired timer. `None` if it was canceled.
    pub fn fire(&mut self, id: TimerId) -> Option<Pending> {
        self.pending.remove(&id)
    }

    /// Cancel every pending activity matching `pred`; returns the handles to cancel on the host.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&Pending) -> bool) -> Vec<TimerId> {
        let ids: Vec<TimerId> = self
            .pending
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TimerId, &Pending)> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
