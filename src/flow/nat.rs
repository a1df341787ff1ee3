//! NAT / flow-tracking table: two indexed maps (by 5-tuple key and by
//! assigned local port) over the set of live entries, with a rolling port
//! cursor for allocation and linger-based reclamation of closed entries.

use super::state::FlowKey;
use crate::error::CoreError;
use crate::rules::RoutingDecision;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant as StdInstant};

pub type FlowId = u64;

pub const PORT_RANGE_START: u16 = 10_000;
pub const PORT_RANGE_END: u16 = 65_535;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    New,
    Connecting,
    Established,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct NatEntry {
    pub key: FlowKey,
    pub local_port: u16,
    pub state: FlowState,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub created_at: StdInstant,
    pub last_activity_at: StdInstant,
    route_decision: Option<RoutingDecision>,
    pub client_closed: bool,
    pub closed_at: Option<StdInstant>,
}

impl NatEntry {
    fn new(key: FlowKey, local_port: u16, now: StdInstant) -> Self {
        Self {
            key,
            local_port,
            state: FlowState::New,
            bytes_in: 0,
            bytes_out: 0,
            created_at: now,
            last_activity_at: now,
            route_decision: None,
            client_closed: false,
            closed_at: None,
        }
    }

    pub fn touch(&mut self, now: StdInstant) {
        self.last_activity_at = now;
    }

    /// The routing decision is write-once for the life of the entry.
    pub fn set_decision(&mut self, decision: RoutingDecision) {
        if self.route_decision.is_none() {
            self.route_decision = Some(decision);
        }
    }

    pub fn decision(&self) -> Option<&RoutingDecision> {
        self.route_decision.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.state != FlowState::Closed
    }
}

pub struct NatTable {
    entries: FxHashMap<FlowId, NatEntry>,
    by_key: FxHashMap<FlowKey, FlowId>,
    by_port: FxHashMap<u16, FlowId>,
    next_id: FlowId,
    port_cursor: u16,
    max_entries: usize,
}

impl NatTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            by_key: FxHashMap::default(),
            by_port: FxHashMap::default(),
            next_id: 1,
            port_cursor: PORT_RANGE_START,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<FlowId> {
        self.by_key.get(key).copied()
    }

    pub fn get(&self, id: FlowId) -> Option<&NatEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut NatEntry> {
        self.entries.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<FlowId> {
        self.entries.keys().copied().collect()
    }

    /// Create an entry for a fresh key. Fails with `NatTableFull` when the
    /// flow cap is reached or no local port is free; the triggering packet
    /// is dropped by the caller and existing flows are untouched.
    pub fn allocate(&mut self, key: FlowKey, now: StdInstant) -> Result<FlowId, CoreError> {
        if self.entries.len() >= self.max_entries {
            return Err(CoreError::NatTableFull);
        }
        let local_port = self.allocate_port().ok_or(CoreError::NatTableFull)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.entries.insert(id, NatEntry::new(key, local_port, now));
        self.by_key.insert(key, id);
        self.by_port.insert(local_port, id);
        Ok(id)
    }

    pub fn remove(&mut self, id: FlowId) -> Option<NatEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_key.remove(&entry.key);
        self.by_port.remove(&entry.local_port);
        Some(entry)
    }

    pub fn mark_closed(&mut self, id: FlowId, now: StdInstant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.state != FlowState::Closed {
                entry.state = FlowState::Closed;
                entry.closed_at = Some(now);
            }
        }
    }

    /// Reclaim entries that have sat in Closed for at least `linger`.
    pub fn evict_expired(&mut self, now: StdInstant, linger: Duration) -> Vec<FlowId> {
        let expired: Vec<FlowId> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.closed_at {
                Some(closed_at) if now.duration_since(closed_at) >= linger => Some(*id),
                _ => None,
            })
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        self.by_port.clear();
    }

    fn allocate_port(&mut self) -> Option<u16> {
        let span = (PORT_RANGE_END - PORT_RANGE_START) as usize + 1;
        for _ in 0..span {
            let candidate = self.port_cursor;
            self.port_cursor = if self.port_cursor == PORT_RANGE_END {
                PORT_RANGE_START
            } else {
                self.port_cursor + 1
            };
            if !self.by_port.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
