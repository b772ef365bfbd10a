//! Node addressing and per-node counters: link address, sequence numbers, broadcast ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Size of a node's link address in bytes.
pub const ADDRESS_SIZE: usize = 2;

/// Link-layer node address (2 bytes). Rendered and parsed as `a.b`, e.g. `8.0`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeAddress([u8; ADDRESS_SIZE]);

impl NodeAddress {
    pub const fn new(hi: u8, lo: u8) -> Self {
        NodeAddress([hi, lo])
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        NodeAddress(bytes)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0[0], self.0[1])
    }
}

/// Error parsing a node address from text.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected address of the form a.b")]
    Format,
    #[error("address component out of range: {0}")]
    Component(String),
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.trim().split_once('.').ok_or(AddressParseError::Format)?;
        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|_| AddressParseError::Component(part.to_string()))
        };
        Ok(NodeAddress::new(parse(hi)?, parse(lo)?))
    }
}

/// Per-node monotone counter ordering route freshness. Higher is fresher.
///
/// Wraparound is not handled: comparisons assume the counter never overflows.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// Unknown freshness; what a requester declares when it has never seen the target.
    pub const UNKNOWN: SequenceNumber = SequenceNumber(0);

    /// Return the current value and advance the counter.
    pub fn bump(&mut self) -> SequenceNumber {
        let current = *self;
        self.0 = self.0.saturating_add(1);
        current
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-node flood counter. `(source, BroadcastId)` identifies one flood instance.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct BroadcastId(pub u32);

impl BroadcastId {
    /// Stored on entries not created by a flood (e.g. learned from a reply).
    /// Counters start at 1, so no request ever carries it.
    pub const NONE: BroadcastId = BroadcastId(0);

    pub fn bump(&mut self) -> BroadcastId {
        let current = *self;
        self.0 = self.0.saturating_add(1);
        current
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let a: NodeAddress = "8.0".parse().unwrap();
        assert_eq!(a, NodeAddress::new(8, 0));
        assert_eq!(a.to_string(), "8.0");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("8".parse::<NodeAddress>(), Err(AddressParseError::Format));
        assert!(matches!(
            "300.1".parse::<NodeAddress>(),
            Err(AddressParseError::Component(_))
        ));
    }

    #[test]
    fn counters_bump_monotonically() {
        let mut seq = SequenceNumber(1);
        assert_eq!(seq.bump(), SequenceNumber(1));
        assert_eq!(seq.bump(), SequenceNumber(2));
        assert_eq!(seq, SequenceNumber(3));

        let mut bid = BroadcastId(1);
        assert_eq!(bid.bump(), BroadcastId(1));
        assert!(bid > BroadcastId::NONE);
    }
}
