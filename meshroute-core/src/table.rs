//! Routing table: bounded, ordered, at most one entry per destination.

use std::fmt;

use serde::Deserialize;

use crate::address::{BroadcastId, NodeAddress, SequenceNumber};
use crate::protocol::INFINITE_DISTANCE;

/// One route: how to reach `dest`, how far it is and how fresh the knowledge is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub dest: NodeAddress,
    pub next_hop: NodeAddress,
    pub distance: u8,
    pub dest_seq: SequenceNumber,
    /// Flood instance that last created or updated this entry.
    pub broadcast_id: BroadcastId,
}

impl RoutingEntry {
    pub fn is_reachable(&self) -> bool {
        self.distance != INFINITE_DISTANCE
    }

    /// Freshness rule: a candidate replaces this entry only if its sequence is
    /// newer, or equal with a distance that is not larger.
    pub fn is_superseded_by(&self, dest_seq: SequenceNumber, distance: u8) -> bool {
        dest_seq > self.dest_seq || (dest_seq == self.dest_seq && distance <= self.distance)
    }
}

/// Policy when the table is full and an entry for a new destination must be stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Refuse the new entry; the caller drops whatever needed it.
    #[default]
    RejectNew,
    /// Drop the longest-standing entry (front of the table) to make room.
    EvictOldest,
}

/// Outcome of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Updated,
    Inserted,
    /// Inserted after evicting the returned entry.
    Evicted(RoutingEntry),
}

/// Outcome of a freshness-checked offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    Accepted(Upserted),
    /// The stored entry is fresher; table unchanged.
    Stale,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("routing table full ({capacity} entries), no room for {dest}")]
    Full { capacity: usize, dest: NodeAddress },
}

/// Bounded routing table. Insertion order is kept: the front is the oldest entry.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
    capacity: usize,
    eviction: EvictionPolicy,
}

impl RoutingTable {
    pub fn new(capacity: usize, eviction: EvictionPolicy) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            eviction,
        }
    }

    pub fn find(&self, dest: NodeAddress) -> Option<&RoutingEntry> {
        self.entries.iter().find(|e| e.dest == dest)
    }

    /// Update the entry for `entry.dest` in place, or append it.
    pub fn upsert(&mut self, entry: RoutingEntry) -> Result<Upserted, TableError> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.dest == entry.dest) {
            *existing = entry;
            return Ok(Upserted::Updated);
        }
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return Ok(Upserted::Inserted);
        }
        match self.eviction {
            EvictionPolicy::EvictOldest if !self.entries.is_empty() => {
                let evicted = self.entries.remove(0);
                self.entries.push(entry);
                Ok(Upserted::Evicted(evicted))
            }
            _ => Err(TableError::Full {
                capacity: self.capacity,
                dest: entry.dest,
            }),
        }
    }

    /// Upsert only if the candidate passes the freshness rule against the stored entry.
    pub fn offer(&mut self, entry: RoutingEntry) -> Result<Offered, TableError> {
        if let Some(existing) = self.find(entry.dest) {
            if !existing.is_superseded_by(entry.dest_seq, entry.distance) {
                return Ok(Offered::Stale);
            }
        }
        self.upsert(entry).map(Offered::Accepted)
    }

    /// Delete the entry for `dest`. Absent entries are not an error.
    pub fn remove(&mut self, dest: NodeAddress) -> Option<RoutingEntry> {
        let idx = self.entries.iter().position(|e| e.dest == dest)?;
        Some(self.entries.remove(idx))
    }

    /// Keep the entry but mark it broken. Returns false if there is no entry for `dest`.
    pub fn mark_unreachable(&mut self, dest: NodeAddress) -> bool {
        match self.entries.iter_mut().find(|e| e.dest == dest) {
            Some(e) => {
                e.distance = INFINITE_DISTANCE;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<8} {:<8} {:>8} {:>8} {:>6}", "dest", "via", "hops", "seq", "bid")?;
        for e in &self.entries {
            let hops = if e.is_reachable() {
                e.distance.to_string()
            } else {
                "inf".to_string()
            };
            writeln!(
                f,
                "{:<8} {:<8} {:>8} {:>8} {:>6}",
                e.dest.to_string(),
                e.next_hop.to_string(),
                hops,
                e.dest_seq,
                e.broadcast_id
            )?;
        }
        Ok(())
    }
}
