//! # Digitree Peer Store
//!
//! Ordered, bounded, relevance-scored cache of known peers.
//!
//! The Digitree keeps every known peer sorted by ring coordinate in a
//! `BTreeMap`, which makes the two directional walks (`neighbors_right`,
//! `neighbors_left`) O(k + log n) range scans with explicit wrap-around at
//! the ends of the ring. Ties between distinct peers hashing to the same
//! coordinate are broken by id, so iteration order is total and stable.
//!
//! ## Capacity and protection
//!
//! The store is bounded. When an insert pushes it over capacity, entries are
//! evicted from lowest relevance upward — except the peers forming the S/P
//! neighborhood around self, which are protected and only ever leave through
//! an explicit removal. Self is always present and never evicted.
//!
//! ## Snapshots
//!
//! Entries handed out of the store are owned copies; all mutation goes
//! through `upsert` / `update` / `set_state` / `remove` so the ordering
//! index can never drift out of sync with entry contents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Included, Unbounded};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ring::Coord;

/// Relevance assigned to a freshly inserted peer.
pub const INITIAL_RELEVANCE: f64 = 1.0;

/// Liveness of a peer as reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connected,
    Disconnected,
}

/// One known peer.
///
/// The counters are monotone; `relevance` and `avg_latency_ms` are smoothed
/// by the relevance model. `metadata` is carried opaquely from snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub coord: Coord,
    pub state: PeerState,
    pub relevance: f64,
    pub last_access: u64,
    pub access_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl PeerEntry {
    fn new(id: String, coord: Coord, now_ms: u64) -> Self {
        PeerEntry {
            id,
            coord,
            state: PeerState::Disconnected,
            relevance: INITIAL_RELEVANCE,
            last_access: now_ms,
            access_count: 0,
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: 0.0,
            metadata: None,
        }
    }
}

/// JSON-safe form of a [`PeerEntry`] for export/import: the coordinate
/// travels as base64url, and the recorded state is ignored on import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedPeerEntry {
    pub id: String,
    pub coord: String,
    pub relevance: f64,
    pub last_access: u64,
    pub state: PeerState,
    pub access_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Ordered map of known peers keyed by ring coordinate.
pub struct Digitree {
    self_id: String,
    self_coord: Coord,
    capacity: usize,
    m: usize,
    entries: BTreeMap<(Coord, String), PeerEntry>,
    by_id: HashMap<String, Coord>,
}

impl Digitree {
    pub fn new(self_id: impl Into<String>, self_coord: Coord, capacity: usize, m: usize) -> Self {
        let self_id = self_id.into();
        let mut tree = Digitree {
            self_id: self_id.clone(),
            self_coord,
            capacity: capacity.max(1),
            m: m.max(1),
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
        };
        let mut own = PeerEntry::new(self_id, self_coord, 0);
        own.state = PeerState::Connected;
        tree.insert_entry(own);
        tree
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_coord(&self) -> Coord {
        self.self_coord
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_entry(&mut self, entry: PeerEntry) {
        self.by_id.insert(entry.id.clone(), entry.coord);
        self.entries.insert((entry.coord, entry.id.clone()), entry);
    }

    /// Insert or refresh a peer. Returns a snapshot of the stored entry.
    ///
    /// An existing entry keeps its counters; a coordinate change (id re-keyed
    /// by a different digest, which only happens on corrupt input) re-slots
    /// the entry under the new coordinate.
    pub fn upsert(&mut self, id: &str, coord: Coord, now_ms: u64) -> PeerEntry {
        if let Some(prev_coord) = self.by_id.get(id).copied() {
            if prev_coord == coord {
                return self.entries[&(coord, id.to_string())].clone();
            }
            let mut moved = self
                .entries
                .remove(&(prev_coord, id.to_string()))
                .unwrap_or_else(|| PeerEntry::new(id.to_string(), coord, now_ms));
            moved.coord = coord;
            self.insert_entry(moved);
            return self.entries[&(coord, id.to_string())].clone();
        }

        let entry = PeerEntry::new(id.to_string(), coord, now_ms);
        self.insert_entry(entry.clone());
        trace!(peer = %abbrev(id), size = self.entries.len(), "digitree insert");
        self.enforce_capacity();
        self.entries
            .get(&(coord, id.to_string()))
            .cloned()
            .unwrap_or(entry)
    }

    /// Remove a peer. Self cannot be removed.
    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        if id == self.self_id {
            return None;
        }
        let coord = self.by_id.remove(id)?;
        self.entries.remove(&(coord, id.to_string()))
    }

    /// Mutate an entry in place through a patch closure.
    ///
    /// The coordinate is the ordering key and must not be patched; it is
    /// restored if a closure touches it.
    pub fn update<F: FnOnce(&mut PeerEntry)>(&mut self, id: &str, patch: F) -> bool {
        let Some(coord) = self.by_id.get(id).copied() else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&(coord, id.to_string())) {
            patch(entry);
            entry.coord = coord;
            entry.id = id.to_string();
            true
        } else {
            false
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<PeerEntry> {
        let coord = self.by_id.get(id)?;
        self.entries.get(&(*coord, id.to_string())).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn list(&self) -> Vec<PeerEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn set_state(&mut self, id: &str, state: PeerState) -> bool {
        self.update(id, |e| e.state = state)
    }

    /// Up to `k` entries in increasing coordinate order, starting at the
    /// first entry whose coordinate is >= `coord`, wrapping past 2^256.
    pub fn neighbors_right(&self, coord: Coord, k: usize) -> Vec<PeerEntry> {
        let mut out = Vec::with_capacity(k);
        let probe = (coord, String::new());
        for entry in self
            .entries
            .range((Included(probe.clone()), Unbounded))
            .map(|(_, e)| e)
        {
            if out.len() >= k {
                return out;
            }
            out.push(entry.clone());
        }
        for entry in self.entries.range(..probe).map(|(_, e)| e) {
            if out.len() >= k {
                break;
            }
            out.push(entry.clone());
        }
        out
    }

    /// Up to `k` entries in decreasing coordinate order, strictly left of
    /// `coord`, wrapping from 0 back to 2^256.
    pub fn neighbors_left(&self, coord: Coord, k: usize) -> Vec<PeerEntry> {
        let mut out = Vec::with_capacity(k);
        let probe = (coord, String::new());
        for entry in self.entries.range(..probe.clone()).rev().map(|(_, e)| e) {
            if out.len() >= k {
                return out;
            }
            out.push(entry.clone());
        }
        for entry in self
            .entries
            .range((Included(probe), Unbounded))
            .rev()
            .map(|(_, e)| e)
        {
            if out.len() >= k {
                break;
            }
            // entries at exactly `coord` belong to the right walk
            if entry.coord == coord {
                continue;
            }
            out.push(entry.clone());
        }
        out
    }

    pub fn successor_of_coord(&self, coord: Coord) -> Option<PeerEntry> {
        self.neighbors_right(coord, 1).into_iter().next()
    }

    pub fn predecessor_of_coord(&self, coord: Coord) -> Option<PeerEntry> {
        self.neighbors_left(coord, 1).into_iter().next()
    }

    /// The `k` nearest successors of self, excluding self.
    pub fn successors_of_self(&self, k: usize) -> Vec<PeerEntry> {
        self.neighbors_right(self.self_coord, k + 1)
            .into_iter()
            .filter(|e| e.id != self.self_id)
            .take(k)
            .collect()
    }

    /// The `k` nearest predecessors of self, excluding self.
    pub fn predecessors_of_self(&self, k: usize) -> Vec<PeerEntry> {
        self.neighbors_left(self.self_coord, k + 1)
            .into_iter()
            .filter(|e| e.id != self.self_id)
            .take(k)
            .collect()
    }

    /// Successors followed by predecessors, deduplicated in insertion order.
    /// In a small store both walks see the same peers; first sighting wins.
    pub fn neighbor_union(&self, m: usize) -> Vec<PeerEntry> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in self
            .successors_of_self(m)
            .into_iter()
            .chain(self.predecessors_of_self(m))
        {
            if seen.insert(entry.id.clone()) {
                out.push(entry);
            }
        }
        out
    }

    /// Ids shielded from capacity eviction: the union of the `m` nearest
    /// neighbors on each side of `coord`, plus self.
    pub fn protected_ids_around(&self, coord: Coord, m: usize) -> HashSet<String> {
        let mut protected: HashSet<String> = HashSet::with_capacity(2 * m + 1);
        protected.insert(self.self_id.clone());
        for entry in self.neighbors_right(coord, m + 1) {
            if entry.id != self.self_id {
                protected.insert(entry.id.clone());
            }
        }
        for entry in self.neighbors_left(coord, m + 1) {
            if entry.id != self.self_id {
                protected.insert(entry.id.clone());
            }
        }
        protected
    }

    /// The cohort responsible for `coord`: alternating right/left walks
    /// around the coordinate, deduplicated by id in visit order.
    ///
    /// Growing `want` only ever appends to the previously returned prefix.
    pub fn assemble_cohort(&self, coord: Coord, want: usize) -> Vec<PeerEntry> {
        let rights = self.neighbors_right(coord, want);
        let lefts = self.neighbors_left(coord, want);
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(want);
        let mut r = rights.into_iter();
        let mut l = lefts.into_iter();
        loop {
            if out.len() >= want {
                break;
            }
            let mut advanced = false;
            if let Some(entry) = r.next() {
                advanced = true;
                if seen.insert(entry.id.clone()) {
                    out.push(entry);
                }
            }
            if out.len() >= want {
                break;
            }
            if let Some(entry) = l.next() {
                advanced = true;
                if seen.insert(entry.id.clone()) {
                    out.push(entry);
                }
            }
            if !advanced {
                break;
            }
        }
        out
    }

    /// Index of self within the cohort for `coord`, or `None` when self is
    /// not among the `want_k` closest. 0 or 1 means self anchors the cohort.
    pub fn neighbor_distance(&self, coord: Coord, want_k: usize) -> Option<usize> {
        self.assemble_cohort(coord, want_k)
            .iter()
            .position(|e| e.id == self.self_id)
    }

    fn enforce_capacity(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let protected = self.protected_ids_around(self.self_coord, self.m.max(2));
        let mut victims: Vec<(f64, String)> = self
            .entries
            .values()
            .filter(|e| !protected.contains(&e.id))
            .map(|e| (e.relevance, e.id.clone()))
            .collect();
        victims.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        for (_, id) in victims {
            if self.entries.len() <= self.capacity {
                break;
            }
            debug!(peer = %abbrev(&id), "digitree eviction");
            self.remove(&id);
        }
    }

    /// Copy every entry into its JSON-safe exported form.
    pub fn export_entries(&self) -> Vec<SerializedPeerEntry> {
        self.entries
            .values()
            .map(|e| SerializedPeerEntry {
                id: e.id.clone(),
                coord: e.coord.to_base64url(),
                relevance: e.relevance,
                last_access: e.last_access,
                state: e.state,
                access_count: e.access_count,
                success_count: e.success_count,
                failure_count: e.failure_count,
                avg_latency_ms: e.avg_latency_ms,
                metadata: e.metadata.clone(),
            })
            .collect()
    }

    /// Re-insert exported records, forcing every restored entry to
    /// `Disconnected` — the host must re-prove liveness. Records with an
    /// undecodable coordinate or empty id are skipped. Returns the number
    /// of records inserted.
    pub fn import_entries(&mut self, records: Vec<SerializedPeerEntry>) -> usize {
        let mut inserted = 0usize;
        for record in records {
            if record.id.is_empty() {
                continue;
            }
            let Some(coord) = Coord::from_base64url(&record.coord) else {
                debug!(peer = %abbrev(&record.id), "import skipped: bad coordinate");
                continue;
            };
            let entry = PeerEntry {
                id: record.id.clone(),
                coord,
                state: PeerState::Disconnected,
                relevance: record.relevance,
                last_access: record.last_access,
                access_count: record.access_count,
                success_count: record.success_count,
                failure_count: record.failure_count,
                avg_latency_ms: record.avg_latency_ms,
                metadata: record.metadata,
            };
            if let Some(prev_coord) = self.by_id.get(&record.id).copied() {
                self.entries.remove(&(prev_coord, record.id.clone()));
            }
            self.insert_entry(entry);
            inserted += 1;
        }
        self.enforce_capacity();
        inserted
    }
}

pub(crate) fn abbrev(id: &str) -> &str {
    &id[..id.len().min(12)]
}
