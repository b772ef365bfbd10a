//! Route control messages: one variant per logical kind.

use serde::{Deserialize, Serialize};

use crate::address::{BroadcastId, NodeAddress, SequenceNumber};

/// Hop count reserved to mean "broken". Only ever stored in table entries.
pub const INFINITE_DISTANCE: u8 = u8::MAX;

/// Link-level acknowledgment payload. Exactly 3 bytes, so it can never be
/// mistaken for a length-prefixed frame.
pub const ACK: [u8; 3] = *b"ack";

/// Hop count one link further out, or `None` once it would reach the sentinel.
pub fn one_hop_further(distance: u8) -> Option<u8> {
    match distance.checked_add(1) {
        Some(d) if d < INFINITE_DISTANCE => Some(d),
        _ => None,
    }
}

/// All route control messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Flooded search for `dest`. `distance` counts links travelled so far,
    /// including the one it arrived on.
    RouteRequest {
        source: NodeAddress,
        source_seq: SequenceNumber,
        broadcast_id: BroadcastId,
        dest: NodeAddress,
        /// Freshest sequence the requester has seen for `dest` (0 if none).
        dest_seq: SequenceNumber,
        distance: u8,
    },
    /// Unicast back along the reverse path to `requester`. `distance` is the
    /// receiver's hop count to `dest` via the sender.
    RouteReply {
        requester: NodeAddress,
        dest: NodeAddress,
        dest_seq: SequenceNumber,
        distance: u8,
    },
    /// `unreachable` can no longer be reached; carried hop by hop toward `target`.
    RouteError {
        unreachable: NodeAddress,
        unreachable_seq: SequenceNumber,
        target: NodeAddress,
    },
    /// Walks the cached route from `origin` to `target`, recording each hop.
    PathProbe {
        origin: NodeAddress,
        target: NodeAddress,
        path: Vec<NodeAddress>,
        distance: u8,
    },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RouteRequest { .. } => "RREQ",
            Message::RouteReply { .. } => "RREP",
            Message::RouteError { .. } => "RERR",
            Message::PathProbe { .. } => "PROBE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_increment_stops_before_sentinel() {
        assert_eq!(one_hop_further(0), Some(1));
        assert_eq!(one_hop_further(253), Some(254));
        assert_eq!(one_hop_further(254), None);
        assert_eq!(one_hop_further(INFINITE_DISTANCE), None);
    }

    #[test]
    fn kinds_are_distinct() {
        let a = NodeAddress::new(1, 0);
        let err = Message::RouteError {
            unreachable: a,
            unreachable_seq: SequenceNumber(4),
            target: a,
        };
        let probe = Message::PathProbe {
            origin: a,
            target: a,
            path: vec![a],
            distance: 0,
        };
        assert_eq!(err.kind(), "RERR");
        assert_eq!(probe.kind(), "PROBE");
    }
}
