//! # Simulation Harness
//!
//! Deterministic, transport-free driver for convergence and routing
//! properties. A seeded PRNG, an absolute-time event scheduler, and a
//! metrics collector run a synthetic mesh of peers whose coordinates are
//! evenly spaced around the ring, so the correct successor/predecessor
//! structure is known a priori and every divergence is measurable.
//!
//! Stabilization ticks simulate full bidirectional S/P merges between each
//! live peer and its m-neighborhood, then prune ids that no longer map to
//! live peers. Routing is greedy on clockwise ring distance, bounded by
//! `ceil(2 * log2(alive)) + 4` hops. The invariants the property tests
//! check against this harness — coverage, bounded hop count, recovery
//! under churn — are the same ones the live service must uphold.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::ring::{ring_span_div, saturating_mul_small, sub_mod, Coord};

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// PRNG seed; identical seeds replay identical runs.
    pub seed: u64,
    /// Initial peer count.
    pub peers: usize,
    /// S/P set size per side.
    pub m: usize,
    /// Cohort size target.
    pub k: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            seed: 42,
            peers: 50,
            m: 4,
            k: 3,
        }
    }
}

/// Scheduled simulation events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Two peers learn of each other directly.
    Connect { a: String, b: String },
    /// A new peer appears at a random coordinate.
    Join,
    /// A peer goes away without notice.
    Leave { id: String },
    /// One full round of S/P merges across all live peers.
    Stabilize,
    /// One greedy route attempt from `from` toward `key`.
    Route { from: String, key: Coord },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    at_ms: u64,
    seq: u64,
    event: SimEvent,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at_ms
            .cmp(&other.at_ms)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One synthetic peer: a coordinate and its current view of the ring.
#[derive(Debug, Clone)]
pub struct SimPeer {
    pub id: String,
    pub coord: Coord,
    pub alive: bool,
    known: BTreeMap<Coord, String>,
}

impl SimPeer {
    fn knows(&mut self, coord: Coord, id: &str) {
        if id != self.id {
            self.known.insert(coord, id.to_string());
        }
    }

    /// S/P view: up to `m` known successors and `m` known predecessors,
    /// both wrapping.
    fn sp_view(&self, m: usize) -> Vec<(Coord, String)> {
        let mut out: Vec<(Coord, String)> = Vec::with_capacity(2 * m);
        for (coord, id) in self
            .known
            .range((Excluded(self.coord), Unbounded))
            .chain(self.known.range(..self.coord))
            .take(m)
        {
            out.push((*coord, id.clone()));
        }
        for (coord, id) in self
            .known
            .range(..self.coord)
            .rev()
            .chain(self.known.range((Excluded(self.coord), Unbounded)).rev())
            .take(m)
        {
            let pair = (*coord, id.clone());
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
        out
    }
}

/// Counters and series produced by a run.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    pub joins: u64,
    pub leaves: u64,
    pub stabilize_cycles: u64,
    pub route_attempts: u64,
    pub route_successes: u64,
    pub total_hops: u64,
    pub max_hops: u32,
    /// Mean S/P coverage across live peers, sampled after each stabilize.
    pub coverage_series: Vec<(u64, f64)>,
}

impl SimMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.route_attempts == 0 {
            return 0.0;
        }
        self.route_successes as f64 / self.route_attempts as f64
    }

    pub fn mean_hops(&self) -> f64 {
        if self.route_successes == 0 {
            return 0.0;
        }
        self.total_hops as f64 / self.route_successes as f64
    }

    pub fn final_coverage(&self) -> f64 {
        self.coverage_series.last().map(|(_, c)| *c).unwrap_or(0.0)
    }
}

/// Deterministic in-process mesh.
pub struct Simulation {
    config: SimConfig,
    rng: StdRng,
    now_ms: u64,
    seq: u64,
    queue: BinaryHeap<Reverse<Scheduled>>,
    peers: HashMap<String, SimPeer>,
    metrics: SimMetrics,
    next_join: usize,
}

impl Simulation {
    /// Build `config.peers` evenly spaced peers, each seeded with its ideal
    /// m-neighborhood.
    pub fn new(config: SimConfig) -> Self {
        let n = config.peers.max(2);
        let gap = ring_span_div(n as u64);
        let roster: Vec<(String, Coord)> = (0..n)
            .map(|i| {
                (
                    format!("sim-{i:04}"),
                    saturating_mul_small(&gap, i as u64),
                )
            })
            .collect();

        let mut peers = HashMap::with_capacity(n);
        for (i, (id, coord)) in roster.iter().enumerate() {
            let mut known = BTreeMap::new();
            for step in 1..=config.m {
                let succ = &roster[(i + step) % n];
                let pred = &roster[(i + n - step % n) % n];
                if succ.0 != *id {
                    known.insert(succ.1, succ.0.clone());
                }
                if pred.0 != *id {
                    known.insert(pred.1, pred.0.clone());
                }
            }
            peers.insert(
                id.clone(),
                SimPeer {
                    id: id.clone(),
                    coord: *coord,
                    alive: true,
                    known,
                },
            );
        }

        Simulation {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            now_ms: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            peers,
            metrics: SimMetrics::default(),
            next_join: n,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn live_count(&self) -> usize {
        self.peers.values().filter(|p| p.alive).count()
    }

    /// Live peer ids in deterministic (sorted) order.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.alive)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn peer(&self, id: &str) -> Option<&SimPeer> {
        self.peers.get(id)
    }

    pub fn schedule(&mut self, at_ms: u64, event: SimEvent) {
        self.seq += 1;
        self.queue.push(Reverse(Scheduled {
            at_ms,
            seq: self.seq,
            event,
        }));
    }

    /// Schedule a stabilize round every `interval_ms` until `until_ms`.
    pub fn schedule_stabilizes(&mut self, interval_ms: u64, until_ms: u64) {
        let mut at = interval_ms;
        while at <= until_ms {
            self.schedule(at, SimEvent::Stabilize);
            at += interval_ms;
        }
    }

    pub fn random_live_peer(&mut self) -> Option<String> {
        let ids = self.live_ids();
        if ids.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..ids.len());
        Some(ids[pick].clone())
    }

    pub fn random_key(&mut self) -> Coord {
        let mut bytes = [0u8; 32];
        self.rng.fill(&mut bytes);
        Coord::from_bytes(bytes)
    }

    /// Drain every event scheduled at or before `t_ms`.
    pub fn run_until(&mut self, t_ms: u64) {
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.at_ms > t_ms {
                break;
            }
            let Reverse(scheduled) = self.queue.pop().expect("peeked entry exists");
            self.now_ms = scheduled.at_ms;
            self.process(scheduled.event);
        }
        self.now_ms = self.now_ms.max(t_ms);
    }

    fn process(&mut self, event: SimEvent) {
        match event {
            SimEvent::Connect { a, b } => {
                let pair = match (self.peers.get(&a), self.peers.get(&b)) {
                    (Some(pa), Some(pb)) if pa.alive && pb.alive => {
                        Some(((pa.coord, pa.id.clone()), (pb.coord, pb.id.clone())))
                    }
                    _ => None,
                };
                if let Some(((ca, ia), (cb, ib))) = pair {
                    if let Some(peer) = self.peers.get_mut(&a) {
                        peer.knows(cb, &ib);
                    }
                    if let Some(peer) = self.peers.get_mut(&b) {
                        peer.knows(ca, &ia);
                    }
                }
            }
            SimEvent::Join => self.join(),
            SimEvent::Leave { id } => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    if peer.alive {
                        peer.alive = false;
                        self.metrics.leaves += 1;
                    }
                }
            }
            SimEvent::Stabilize => {
                self.stabilize_all();
                self.metrics.stabilize_cycles += 1;
                let coverage = self.mean_coverage();
                self.metrics.coverage_series.push((self.now_ms, coverage));
            }
            SimEvent::Route { from, key } => self.handle_route(&from, key),
        }
    }

    fn join(&mut self) {
        let id = format!("sim-{:04}", self.next_join);
        self.next_join += 1;
        let mut bytes = [0u8; 32];
        self.rng.fill(&mut bytes);
        let coord = Coord::from_bytes(bytes);

        // a joiner bootstraps with the current ideal neighborhood
        let mut live: Vec<(Coord, String)> = self
            .peers
            .values()
            .filter(|p| p.alive)
            .map(|p| (p.coord, p.id.clone()))
            .collect();
        live.sort();

        let mut known = BTreeMap::new();
        if !live.is_empty() {
            let split = live.partition_point(|(c, _)| *c < coord);
            let n = live.len();
            for step in 0..self.config.m.min(n) {
                let (sc, sid) = &live[(split + step) % n];
                let (pc, pid) = &live[(split + n - 1 - step) % n];
                known.insert(*sc, sid.clone());
                known.insert(*pc, pid.clone());
            }
        }

        self.peers.insert(
            id.clone(),
            SimPeer {
                id,
                coord,
                alive: true,
                known,
            },
        );
        self.metrics.joins += 1;
    }

    /// Bidirectional S/P merge between every live peer and its live
    /// m-neighborhood, then prune dead ids everywhere.
    fn stabilize_all(&mut self) {
        let m = self.config.m;
        let live = self.live_ids();

        for id in &live {
            let Some(peer) = self.peers.get(id) else { continue };
            let mut my_view = peer.sp_view(m);
            my_view.push((peer.coord, peer.id.clone()));

            let neighborhood: Vec<String> = peer
                .sp_view(m)
                .into_iter()
                .map(|(_, nid)| nid)
                .filter(|nid| self.peers.get(nid).map(|p| p.alive).unwrap_or(false))
                .collect();

            for nid in neighborhood {
                let Some(neighbor) = self.peers.get(&nid) else { continue };
                let mut their_view = neighbor.sp_view(m);
                their_view.push((neighbor.coord, neighbor.id.clone()));

                if let Some(peer) = self.peers.get_mut(id) {
                    for (coord, kid) in &their_view {
                        peer.knows(*coord, kid);
                    }
                }
                if let Some(neighbor) = self.peers.get_mut(&nid) {
                    for (coord, kid) in &my_view {
                        neighbor.knows(*coord, kid);
                    }
                }
            }
        }

        // prune ids that no longer map to live peers
        let dead: Vec<Coord> = self
            .peers
            .values()
            .filter(|p| !p.alive)
            .map(|p| p.coord)
            .collect();
        for id in &live {
            if let Some(peer) = self.peers.get_mut(id) {
                for coord in &dead {
                    peer.known.remove(coord);
                }
            }
        }
    }

    /// Mean over live peers of `|alive ids in S∪P| / min(2m, alive - 1)`.
    pub fn mean_coverage(&self) -> f64 {
        let alive = self.live_count();
        if alive <= 1 {
            return 1.0;
        }
        let ideal = (2 * self.config.m).min(alive - 1) as f64;
        let mut sum = 0.0;
        let mut counted = 0usize;
        for peer in self.peers.values().filter(|p| p.alive) {
            let live_neighbors = peer
                .sp_view(self.config.m)
                .into_iter()
                .filter(|(_, id)| self.peers.get(id).map(|p| p.alive).unwrap_or(false))
                .count();
            sum += live_neighbors as f64 / ideal;
            counted += 1;
        }
        if counted == 0 {
            return 0.0;
        }
        (sum / counted as f64).min(1.0)
    }

    /// Mean fraction of dead ids still present in live peers' S∪P views.
    pub fn dead_neighbor_ratio(&self) -> f64 {
        let mut sum = 0.0;
        let mut counted = 0usize;
        for peer in self.peers.values().filter(|p| p.alive) {
            let view = peer.sp_view(self.config.m);
            if view.is_empty() {
                continue;
            }
            let dead = view
                .iter()
                .filter(|(_, id)| !self.peers.get(id).map(|p| p.alive).unwrap_or(false))
                .count();
            sum += dead as f64 / view.len() as f64;
            counted += 1;
        }
        if counted == 0 {
            return 0.0;
        }
        sum / counted as f64
    }

    /// The live peer whose coordinate is the clockwise successor of `key`.
    pub fn live_successor(&self, key: &Coord) -> Option<String> {
        self.peers
            .values()
            .filter(|p| p.alive)
            .min_by(|a, b| {
                sub_mod(&a.coord, key)
                    .cmp(&sub_mod(&b.coord, key))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|p| p.id.clone())
    }

    /// Greedy clockwise routing bounded by `ceil(2 * log2(alive)) + 4`
    /// hops. Success means reaching the key's live successor.
    fn handle_route(&mut self, from: &str, key: Coord) {
        self.metrics.route_attempts += 1;
        let alive = self.live_count();
        if alive == 0 {
            return;
        }
        let bound = (2.0 * (alive as f64).log2()).ceil() as u32 + 4;
        let Some(ideal) = self.live_successor(&key) else {
            return;
        };
        let Some(start) = self.peers.get(from).filter(|p| p.alive) else {
            return;
        };

        let mut current = start.id.clone();
        let mut hops = 0u32;
        loop {
            if current == ideal {
                self.metrics.route_successes += 1;
                self.metrics.total_hops += hops as u64;
                self.metrics.max_hops = self.metrics.max_hops.max(hops);
                trace!(from = %from, hops, "route delivered");
                return;
            }
            if hops >= bound {
                return;
            }
            let Some(peer) = self.peers.get(&current) else { return };
            let own_distance = sub_mod(&peer.coord, &key);
            let next = peer
                .known
                .iter()
                .filter(|(_, id)| self.peers.get(*id).map(|p| p.alive).unwrap_or(false))
                .min_by(|(ca, ia), (cb, ib)| {
                    sub_mod(ca, &key)
                        .cmp(&sub_mod(cb, &key))
                        .then_with(|| ia.cmp(ib))
                })
                .map(|(coord, id)| (*coord, id.clone()));
            match next {
                Some((coord, id)) if sub_mod(&coord, &key) < own_distance => {
                    current = id;
                    hops += 1;
                }
                _ => return,
            }
        }
    }
}
