//! Host-driven API: RouteEngine receives events from host, returns actions.
//!
//! The host owns the radio and the clock. It calls exactly one handler at a
//! time (`discover`, `on_broadcast_received`, `on_unicast_received`,
//! `on_timer_fired`) and performs the returned actions in order. No handler
//! blocks: waiting is an `ArmTimer` action followed by a later
//! `on_timer_fired` call.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{BroadcastId, NodeAddress, SequenceNumber};
use crate::config::Config;
use crate::protocol::{one_hop_further, Message, ACK};
use crate::table::{Offered, RoutingEntry, RoutingTable, Upserted};
use crate::timer::{Pending, TimerId, Timers};
use crate::wire::{self, FrameDecodeError, Payload};

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the payload to every neighbor in radio range.
    Broadcast(Vec<u8>),
    /// Send the payload to one neighbor.
    Unicast(NodeAddress, Vec<u8>),
    /// Start a single-shot timer; call `on_timer_fired(timer)` when it expires.
    ArmTimer { timer: TimerId, after: Duration },
    /// Stop a timer armed earlier. Firing it anyway is harmless.
    CancelTimer(TimerId),
    /// Report an outcome to the application.
    Notify(Event),
}

/// Application-visible outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RouteEstablished {
        dest: NodeAddress,
        next_hop: NodeAddress,
        distance: u8,
    },
    /// A probe arrived here; `path` lists every node it crossed, origin first.
    PathTraced {
        origin: NodeAddress,
        path: Vec<NodeAddress>,
    },
    NoRoute { dest: NodeAddress },
    /// A route error for `dest` reached this node, which originated the traffic.
    RouteLost { dest: NodeAddress },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    DecodeFailed(#[from] FrameDecodeError),
}

/// One node's routing state: address, counters, table and pending timers.
pub struct RouteEngine {
    address: NodeAddress,
    /// Next sequence number to hand out.
    seq: SequenceNumber,
    /// Next broadcast id to hand out.
    broadcast_id: BroadcastId,
    table: RoutingTable,
    timers: Timers,
    config: Config,
}

impl RouteEngine {
    pub fn new(address: NodeAddress) -> Self {
        Self::with_config(address, Config::default())
    }

    pub fn with_config(address: NodeAddress, config: Config) -> Self {
        Self {
            address,
            seq: SequenceNumber(1),
            broadcast_id: BroadcastId(1),
            table: RoutingTable::new(config.table_capacity, config.eviction),
            timers: Timers::new(),
            config,
        }
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Next sequence number this node will hand out.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.seq
    }

    /// Outstanding activities and their timer handles.
    pub fn pending(&self) -> impl Iterator<Item = (&TimerId, &Pending)> {
        self.timers.iter()
    }

    /// Application trigger: make sure a route to `target` exists.
    ///
    /// With a usable route this sends a path probe along it, which doubles as
    /// a liveness check. Otherwise a route request is flooded.
    pub fn discover(&mut self, target: NodeAddress) -> Vec<Action> {
        let mut actions = Vec::new();
        if target == self.address {
            debug!(node = %self.address, "discovery target is this node");
            return actions;
        }
        let known = self.table.find(target).copied();
        if let Some(route) = known.filter(|e| e.is_reachable()) {
            let probe = Message::PathProbe {
                origin: self.address,
                target,
                path: vec![self.address],
                distance: 0,
            };
            self.unicast(&mut actions, route.next_hop, &probe);
            self.arm(
                &mut actions,
                Pending::AwaitingReply {
                    origin: self.address,
                    target,
                    next_hop: route.next_hop,
                    previous_hop: None,
                },
            );
            return actions;
        }
        let in_flight = self
            .timers
            .iter()
            .any(|(_, p)| matches!(p, Pending::AwaitingRoute { target: t } if *t == target));
        if in_flight {
            debug!(node = %self.address, %target, "discovery already in flight");
            return actions;
        }
        let request = Message::RouteRequest {
            source: self.address,
            source_seq: self.seq.bump(),
            broadcast_id: self.broadcast_id.bump(),
            dest: target,
            dest_seq: known.map(|e| e.dest_seq).unwrap_or(SequenceNumber::UNKNOWN),
            distance: 1,
        };
        info!(node = %self.address, %target, "flooding route request");
        self.broadcast(&mut actions, &request);
        self.arm(&mut actions, Pending::AwaitingRoute { target });
        actions
    }

    /// Raw broadcast payload from the radio.
    pub fn on_broadcast_received(
        &mut self,
        bytes: &[u8],
        from: NodeAddress,
    ) -> Result<Vec<Action>, MessageError> {
        match wire::decode_payload(bytes)? {
            Payload::Message(msg) => Ok(self.handle_broadcast(msg, from)),
            Payload::Ack => {
                debug!(node = %self.address, %from, "ack on broadcast channel ignored");
                Ok(Vec::new())
            }
        }
    }

    /// Raw unicast payload from the radio.
    pub fn on_unicast_received(
        &mut self,
        bytes: &[u8],
        from: NodeAddress,
    ) -> Result<Vec<Action>, MessageError> {
        let payload = wire::decode_payload(bytes)?;
        Ok(self.handle_unicast(payload, from))
    }

    pub fn handle_broadcast(&mut self, msg: Message, from: NodeAddress) -> Vec<Action> {
        match msg {
            Message::RouteRequest {
                source,
                source_seq,
                broadcast_id,
                dest,
                dest_seq,
                distance,
            } => self.on_route_request(
                RequestFields {
                    source,
                    source_seq,
                    broadcast_id,
                    dest,
                    dest_seq,
                    distance,
                },
                from,
            ),
            other => {
                debug!(node = %self.address, %from, kind = other.kind(), "unexpected broadcast");
                Vec::new()
            }
        }
    }

    pub fn handle_unicast(&mut self, payload: Payload, from: NodeAddress) -> Vec<Action> {
        let msg = match payload {
            Payload::Ack => return self.on_ack(from),
            Payload::Message(msg) => msg,
        };
        match msg {
            Message::PathProbe {
                origin,
                target,
                path,
                distance,
            } => self.on_probe(origin, target, path, distance, from),
            Message::RouteError {
                unreachable,
                unreachable_seq,
                target,
            } => self.on_route_error(unreachable, unreachable_seq, target, from),
            Message::RouteReply {
                requester,
                dest,
                dest_seq,
                distance,
            } => self.on_route_reply(requester, dest, dest_seq, distance, from),
            Message::RouteRequest { .. } => {
                debug!(node = %self.address, %from, "route request on unicast channel ignored");
                Vec::new()
            }
        }
    }

    pub fn on_timer_fired(&mut self, timer: TimerId) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(state) = self.timers.fire(timer) else {
            debug!(node = %self.address, ?timer, "expired timer was already settled");
            return actions;
        };
        match state {
            Pending::AwaitingRoute { target } => {
                info!(node = %self.address, %target, "no reply to route request");
                actions.push(Action::Notify(Event::NoRoute { dest: target }));
            }
            Pending::AwaitingReverseConfirmation {
                origin,
                broadcast_id,
            } => {
                let unconfirmed = self
                    .table
                    .find(origin)
                    .is_some_and(|e| e.broadcast_id == broadcast_id);
                if unconfirmed {
                    self.table.remove(origin);
                    debug!(node = %self.address, %origin, "unconfirmed reverse path expired");
                }
            }
            Pending::AwaitingReply {
                origin,
                target,
                next_hop,
                previous_hop,
            } => {
                warn!(node = %self.address, %target, %next_hop, "next hop did not acknowledge");
                self.table.mark_unreachable(target);
                self.report_broken(&mut actions, origin, target, previous_hop);
            }
        }
        actions
    }

    // RouteRequest handling.

    fn on_route_request(&mut self, req: RequestFields, from: NodeAddress) -> Vec<Action> {
        let mut actions = Vec::new();
        if req.source == self.address {
            return actions;
        }
        if let Some(e) = self.table.find(req.source) {
            if e.broadcast_id == req.broadcast_id {
                debug!(
                    node = %self.address,
                    source = %req.source,
                    broadcast_id = %req.broadcast_id,
                    "duplicate request dropped"
                );
                return actions;
            }
        }

        let reverse = RoutingEntry {
            dest: req.source,
            next_hop: from,
            distance: req.distance,
            dest_seq: req.source_seq,
            broadcast_id: req.broadcast_id,
        };
        if !self.store(reverse) {
            return actions;
        }
        debug!(node = %self.address, "routing table after request:\n{}", self.table);

        if req.dest == self.address {
            if req.dest_seq > self.seq {
                self.seq = req.dest_seq;
            }
            let reply = Message::RouteReply {
                requester: req.source,
                dest: self.address,
                dest_seq: self.seq.bump(),
                distance: 1,
            };
            info!(node = %self.address, requester = %req.source, via = %from, "answering route request");
            self.unicast(&mut actions, from, &reply);
            return actions;
        }

        let cached = self.table.find(req.dest).copied().filter(|e| {
            e.is_reachable() && e.dest_seq >= req.dest_seq && e.next_hop != from
        });
        if let Some(route) = cached {
            if let Some(distance) = one_hop_further(route.distance) {
                let reply = Message::RouteReply {
                    requester: req.source,
                    dest: req.dest,
                    dest_seq: route.dest_seq,
                    distance,
                };
                debug!(node = %self.address, dest = %req.dest, "answering from cached route");
                self.unicast(&mut actions, from, &reply);
                return actions;
            }
        }

        let Some(distance) = one_hop_further(req.distance) else {
            debug!(node = %self.address, source = %req.source, "request hop limit reached");
            return actions;
        };
        let forwarded = Message::RouteRequest {
            source: req.source,
            source_seq: req.source_seq,
            broadcast_id: req.broadcast_id,
            dest: req.dest,
            dest_seq: req.dest_seq,
            distance,
        };
        self.broadcast(&mut actions, &forwarded);
        let origin = req.source;
        self.cancel(&mut actions, |p| {
            matches!(p, Pending::AwaitingReverseConfirmation { origin: o, .. } if *o == origin)
        });
        self.arm(
            &mut actions,
            Pending::AwaitingReverseConfirmation {
                origin,
                broadcast_id: req.broadcast_id,
            },
        );
        actions
    }

    // Unicast handling.

    fn on_ack(&mut self, from: NodeAddress) -> Vec<Action> {
        let mut first = true;
        let canceled = self.timers.cancel_where(|p| {
            let hit = first && matches!(p, Pending::AwaitingReply { next_hop, .. } if *next_hop == from);
            if hit {
                first = false;
            }
            hit
        });
        if canceled.is_empty() {
            debug!(node = %self.address, %from, "unsolicited ack");
        }
        canceled.into_iter().map(Action::CancelTimer).collect()
    }

    fn on_probe(
        &mut self,
        origin: NodeAddress,
        target: NodeAddress,
        mut path: Vec<NodeAddress>,
        distance: u8,
        from: NodeAddress,
    ) -> Vec<Action> {
        let mut actions = vec![Action::Unicast(from, ACK.to_vec())];
        path.push(self.address);

        if target == self.address {
            let trace: Vec<String> = path.iter().map(|a| a.to_string()).collect();
            let hops = path.len().saturating_sub(1);
            info!(node = %self.address, %origin, hops, "path: {}", trace.join(" -> "));
            actions.push(Action::Notify(Event::PathTraced { origin, path }));
            return actions;
        }

        let Some(distance) = one_hop_further(distance) else {
            debug!(node = %self.address, %origin, "probe hop limit reached");
            return actions;
        };

        match self.table.find(target).copied().filter(|e| e.is_reachable()) {
            Some(route) if route.next_hop == from => {
                debug!(node = %self.address, %target, "probe would bounce back, not forwarded");
            }
            Some(route) => {
                let probe = Message::PathProbe {
                    origin,
                    target,
                    path,
                    distance,
                };
                self.unicast(&mut actions, route.next_hop, &probe);
                self.arm(
                    &mut actions,
                    Pending::AwaitingReply {
                        origin,
                        target,
                        next_hop: route.next_hop,
                        previous_hop: Some(from),
                    },
                );
            }
            None => {
                debug!(node = %self.address, %target, "no usable route for probe");
                self.report_broken(&mut actions, origin, target, Some(from));
            }
        }
        actions
    }

    fn on_route_error(
        &mut self,
        unreachable: NodeAddress,
        unreachable_seq: SequenceNumber,
        target: NodeAddress,
        from: NodeAddress,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        // An unknown sequence number carries no freshness information.
        let superseded = unreachable_seq != SequenceNumber::UNKNOWN
            && self
                .table
                .find(unreachable)
                .is_some_and(|e| e.dest_seq > unreachable_seq);
        if superseded {
            debug!(node = %self.address, dest = %unreachable, seq = %unreachable_seq, "stale route error dropped");
            return actions;
        }
        self.table.mark_unreachable(unreachable);
        if target == self.address {
            info!(node = %self.address, dest = %unreachable, %from, "route lost");
            actions.push(Action::Notify(Event::RouteLost { dest: unreachable }));
            return actions;
        }
        match self.table.find(target).copied().filter(|e| e.is_reachable()) {
            Some(route) => {
                let err = Message::RouteError {
                    unreachable,
                    unreachable_seq,
                    target,
                };
                self.unicast(&mut actions, route.next_hop, &err);
            }
            None => {
                debug!(node = %self.address, %target, "route error has no way back, dropped");
            }
        }
        actions
    }

    fn on_route_reply(
        &mut self,
        requester: NodeAddress,
        dest: NodeAddress,
        dest_seq: SequenceNumber,
        distance: u8,
        from: NodeAddress,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        // Replies do not belong to a flood; keep whatever flood id the entry already had.
        let broadcast_id = self
            .table
            .find(dest)
            .map(|e| e.broadcast_id)
            .unwrap_or(BroadcastId::NONE);
        let forward = RoutingEntry {
            dest,
            next_hop: from,
            distance,
            dest_seq,
            broadcast_id,
        };
        match self.table.offer(forward) {
            Ok(Offered::Accepted(upserted)) => self.note_eviction(upserted),
            Ok(Offered::Stale) => {
                debug!(node = %self.address, %dest, seq = %dest_seq, "stale reply dropped");
                return actions;
            }
            Err(e) => {
                warn!(node = %self.address, error = %e, "reply dropped");
                return actions;
            }
        }
        // A reply for `dest` confirms any reverse path this node holds toward it.
        self.cancel(&mut actions, |p| {
            matches!(p, Pending::AwaitingReverseConfirmation { origin, .. } if *origin == dest)
        });

        if requester == self.address {
            self.cancel(&mut actions, |p| {
                matches!(p, Pending::AwaitingRoute { target } if *target == dest)
            });
            info!(node = %self.address, %dest, via = %from, distance, "route established");
            actions.push(Action::Notify(Event::RouteEstablished {
                dest,
                next_hop: from,
                distance,
            }));
            return actions;
        }

        let Some(reverse) = self.table.find(requester).copied().filter(|e| e.is_reachable())
        else {
            debug!(node = %self.address, %requester, "no reverse path for reply");
            return actions;
        };
        let Some(distance) = one_hop_further(distance) else {
            return actions;
        };
        let relayed = Message::RouteReply {
            requester,
            dest,
            dest_seq,
            distance,
        };
        self.unicast(&mut actions, reverse.next_hop, &relayed);
        self.cancel(&mut actions, |p| {
            matches!(p, Pending::AwaitingReverseConfirmation { origin, .. } if *origin == requester)
        });
        actions
    }

    // Helpers.

    /// Tell `origin` that `target` is unreachable, or report it locally if this is the origin.
    fn report_broken(
        &mut self,
        actions: &mut Vec<Action>,
        origin: NodeAddress,
        target: NodeAddress,
        previous_hop: Option<NodeAddress>,
    ) {
        if origin == self.address {
            actions.push(Action::Notify(Event::NoRoute { dest: target }));
            return;
        }
        let back = self
            .table
            .find(origin)
            .filter(|e| e.is_reachable())
            .map(|e| e.next_hop)
            .or(previous_hop);
        let Some(back) = back else {
            debug!(node = %self.address, %origin, "no way back to report broken route");
            return;
        };
        let err = Message::RouteError {
            unreachable: target,
            unreachable_seq: self
                .table
                .find(target)
                .map(|e| e.dest_seq)
                .unwrap_or(SequenceNumber::UNKNOWN),
            target: origin,
        };
        self.unicast(actions, back, &err);
    }

    /// Freshness-checked insert of a reverse entry. False when the caller must drop the message.
    fn store(&mut self, entry: RoutingEntry) -> bool {
        match self.table.offer(entry) {
            Ok(Offered::Accepted(upserted)) => {
                self.note_eviction(upserted);
                true
            }
            Ok(Offered::Stale) => {
                debug!(node = %self.address, dest = %entry.dest, "stale request dropped");
                false
            }
            Err(e) => {
                warn!(node = %self.address, error = %e, "request dropped");
                false
            }
        }
    }

    fn note_eviction(&self, upserted: Upserted) {
        if let Upserted::Evicted(old) = upserted {
            warn!(node = %self.address, evicted = %old.dest, "routing table full, oldest entry evicted");
        }
    }

    fn arm(&mut self, actions: &mut Vec<Action>, state: Pending) {
        let after = match state {
            Pending::AwaitingReply { .. } => self.config.reply_wait(),
            Pending::AwaitingRoute { .. } => self.config.discovery_timeout(),
            Pending::AwaitingReverseConfirmation { .. } => self.config.reverse_expiry(),
        };
        let timer = self.timers.arm(state);
        actions.push(Action::ArmTimer { timer, after });
    }

    fn cancel(&mut self, actions: &mut Vec<Action>, pred: impl FnMut(&Pending) -> bool) {
        for timer in self.timers.cancel_where(pred) {
            actions.push(Action::CancelTimer(timer));
        }
    }

    fn broadcast(&self, actions: &mut Vec<Action>, msg: &Message) {
        match wire::encode_frame(msg) {
            Ok(frame) => actions.push(Action::Broadcast(frame)),
            Err(e) => warn!(node = %self.address, error = %e, kind = msg.kind(), "encode failed"),
        }
    }

    fn unicast(&self, actions: &mut Vec<Action>, to: NodeAddress, msg: &Message) {
        match wire::encode_frame(msg) {
            Ok(frame) => actions.push(Action::Unicast(to, frame)),
            Err(e) => warn!(node = %self.address, error = %e, kind = msg.kind(), "encode failed"),
        }
    }
}

struct RequestFields {
    source: NodeAddress,
    source_seq: SequenceNumber,
    broadcast_id: BroadcastId,
    dest: NodeAddress,
    dest_seq: SequenceNumber,
    distance: u8,
}
