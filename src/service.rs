//! # Overlay Service
//!
//! The stabilization state machine tying the Digitree, relevance model,
//! estimator, and routing heuristics to a host runtime.
//!
//! ## Actor Architecture
//!
//! [`FretNode`] is a cheap-to-clone public handle; [`FretActor`] privately
//! owns every piece of mutable state — the Digitree, sparsity bands,
//! estimator window, dedup cache, backoff table, token buckets, announce
//! TTL map, in-flight counter, and diagnostics — and processes commands
//! strictly sequentially. Between host-runtime awaits there is no
//! interleaving to reason about; long flows (stabilization, forwarding,
//! lookups) live on the handle side and touch state only through commands.
//!
//! ## Lifecycle
//!
//! `start()` seeds the table, registers the five protocol handlers, emits a
//! bounded proactive announce, installs the peer-event pump, and begins
//! stabilization ticks. `stop()` flips the stopped flag, sends best-effort
//! leave notices with replacement suggestions, and tears the actor down;
//! late awaits observe the stopped state through the closed command channel
//! and settle on defaults.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::estimator::{self_estimate_from_spacing, NetworkEstimator, SizeEstimate};
use crate::messages::{
    encode, ExportedTable, LeaveNotice, MaybeActReply, NeighborSnapshot, NeighborsRequest,
    PingRequest, PingResponse, SampleEntry, MAX_ACTIVITY_BYTES, MAX_REPLACEMENTS,
    MAX_SNAPSHOT_PREDECESSORS, MAX_SNAPSHOT_SAMPLES, MAX_SNAPSHOT_SUCCESSORS, MAX_TTL,
    WIRE_VERSION,
};
use crate::protocols::{
    ActivityHandler, HostRuntime, InboundHandler, InboundRequest, PeerEvent, Profile, RpcKind,
};
use crate::relevance::{self, SparsityBands};
use crate::ring::{coord_for_peer, normalized_log_distance, Coord};
use crate::routing::{compute_near_radius, select_next_hop, BackoffTracker, HopCandidate, DEFAULT_BETA};
use crate::rpc::{
    decode_bounded, now_ms, read_all_bounded, validate_timestamp, DedupCache, RejectKind,
    TokenBucket, DEDUP_MAX, DEDUP_TTL, MAX_TIMESTAMP_DRIFT_MS,
};
use crate::store::{abbrev, Digitree, PeerEntry, PeerState, SerializedPeerEntry};

/// Proactive announce fan-out at startup.
const STARTUP_ANNOUNCE_FANOUT: usize = 8;

/// Peers pinged and snapshot-fetched per stabilization tick.
const STABILIZE_PROBE_COUNT: usize = 4;

/// Replacement suggestions carried in a leave notice.
const LEAVE_REPLACEMENT_COUNT: usize = 6;

/// Replacement peers warmed up by a leave-notice receiver.
const LEAVE_WARMUP_COUNT: usize = 6;

/// Connected neighbors re-announced to around a departed coordinate.
const LEAVE_ANNOUNCE_COUNT: usize = 4;

/// An announce to the same peer is suppressed for this long.
const ANNOUNCE_TTL: Duration = Duration::from_secs(60);

/// Stabilization cadence per service mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceMode {
    /// Maintenance-only cadence.
    #[default]
    Passive,
    /// Fast cadence plus a bootstrap pre-connect loop before the first tick.
    Active,
}

impl ServiceMode {
    pub fn cadence(&self) -> Duration {
        match self {
            ServiceMode::Passive => Duration::from_millis(1500),
            ServiceMode::Active => Duration::from_millis(300),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct FretConfig {
    /// Namespace for protocol identifiers; unrelated rings never cross-talk.
    pub network_name: String,
    /// Cluster size target: cohort assembly size and bound on `want_k`.
    pub k: usize,
    /// S/P set size per side.
    pub m: usize,
    /// Digitree capacity.
    pub capacity: usize,
    pub profile: Profile,
    pub mode: ServiceMode,
    /// Seed peer ids, re-seeded every stabilization tick.
    pub bootstraps: Vec<String>,
    /// Ceiling on the TTL any message may carry.
    pub max_ttl: u32,
}

impl Default for FretConfig {
    fn default() -> Self {
        FretConfig {
            network_name: "fret".into(),
            k: 3,
            m: 4,
            capacity: 256,
            profile: Profile::default(),
            mode: ServiceMode::default(),
            bootstraps: Vec::new(),
            max_ttl: MAX_TTL,
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    PeerDiscovered { id: String },
}

/// Counters for the enumerated rejection kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectedCounters {
    pub payload_too_large: u64,
    pub timestamp_bounds: u64,
    pub ttl_expired: u64,
    pub rate_limited: u64,
    pub malformed_message: u64,
}

impl RejectedCounters {
    fn bump(&mut self, kind: RejectKind) {
        match kind {
            RejectKind::PayloadTooLarge => self.payload_too_large += 1,
            RejectKind::TimestampBounds => self.timestamp_bounds += 1,
            RejectKind::TtlExpired => self.ttl_expired += 1,
            RejectKind::RateLimited => self.rate_limited += 1,
            RejectKind::MalformedMessage => self.malformed_message += 1,
        }
    }
}

/// Observable service counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    pub rejected: RejectedCounters,
    pub pings_sent: u64,
    pub pings_received: u64,
    pub announcements_sent: u64,
    pub snapshots_merged: u64,
    pub discovery_events: u64,
    pub routes_forwarded: u64,
    pub activities_invoked: u64,
    pub leaves_sent: u64,
    pub leave_notices_received: u64,
    pub stabilize_ticks: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stat {
    PingSent,
    PingReceived,
    AnnounceSent,
    RouteForwarded,
    ActivityInvoked,
    LeaveSent,
    StabilizeTick,
}

/// Verdict of the shared envelope admission (timestamp window, then the
/// per-handler token bucket).
#[derive(Debug, Clone)]
pub(crate) enum EnvelopeVerdict {
    Proceed,
    Stale,
    Busy { retry_after_ms: u64 },
}

/// Verdict of maybeAct admission, checked in pipeline order.
#[derive(Debug, Clone)]
pub(crate) enum ActAdmission {
    Cached(MaybeActReply),
    Stale,
    TtlExpired,
    PayloadTooLarge,
    Busy { retry_after_ms: u64 },
    Proceed,
}

/// Everything `routeAct` needs from the table in one consistent view.
#[derive(Debug, Clone)]
pub(crate) struct RoutePlan {
    pub self_index: Option<usize>,
    pub cohort: Vec<String>,
    pub next_hop: Option<String>,
    pub estimate: SizeEstimate,
}

/// Targets and vouched replacements for an outgoing leave.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeaveExit {
    pub targets: Vec<String>,
    pub replacements: Vec<String>,
}

/// Recovery work after an incoming leave notice.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeaveRecovery {
    pub warm_targets: Vec<String>,
    pub announce_targets: Vec<String>,
}

/// A replacement id is usable when it is non-empty, bounded, and free of
/// control characters and whitespace.
pub(crate) fn well_formed_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 256
        && id.chars().all(|c| !c.is_control() && !c.is_whitespace())
}

enum Command {
    UpsertPeer(String, Option<oneshot::Sender<bool>>),
    SetPeerState(String, PeerState),
    GetPeer(String, oneshot::Sender<Option<PeerEntry>>),
    ListPeers(oneshot::Sender<Vec<PeerEntry>>),
    TouchPeer(String),
    RecordPeerSuccess(String, f64),
    RecordPeerFailure(String),

    ReportSize {
        estimate: f64,
        confidence: f64,
        source: String,
    },
    GetEstimate(oneshot::Sender<SizeEstimate>),
    GetChurn(oneshot::Sender<f64>),
    DetectPartition(oneshot::Sender<bool>),

    AdmitEnvelope {
        kind: RpcKind,
        timestamp: u64,
        reply: oneshot::Sender<EnvelopeVerdict>,
    },
    CountReject(RejectKind),
    Bump(Stat),

    AdmitAct {
        correlation_id: String,
        timestamp: u64,
        ttl: u32,
        activity_bytes: usize,
        reply: oneshot::Sender<ActAdmission>,
    },
    FinishAct {
        correlation_id: String,
        reply: MaybeActReply,
    },
    GetRoutePlan {
        target: Coord,
        want_k: usize,
        exclude: Vec<String>,
        reply: oneshot::Sender<RoutePlan>,
    },
    BackoffFailure(String),
    BackoffClear(String),

    BuildSnapshot(oneshot::Sender<NeighborSnapshot>),
    MergeSnapshot(Box<NeighborSnapshot>),
    NeighborUnion(usize, oneshot::Sender<Vec<PeerEntry>>),
    CohortAround(Coord, usize, oneshot::Sender<Vec<String>>),
    MarkAnnounced(String, oneshot::Sender<bool>),

    LeavePlan(oneshot::Sender<LeaveExit>),
    LeaveReceived {
        from: String,
        replacements: Vec<String>,
        reply: oneshot::Sender<LeaveRecovery>,
    },

    GetDiagnostics(oneshot::Sender<Diagnostics>),
    ExportTable(oneshot::Sender<ExportedTable>),
    ImportTable(Vec<SerializedPeerEntry>, oneshot::Sender<usize>),

    Quit,
}

struct Buckets {
    ping: TokenBucket,
    neighbors: TokenBucket,
    announce: TokenBucket,
    maybe_act: TokenBucket,
    leave: TokenBucket,
    discovery: TokenBucket,
}

impl Buckets {
    fn for_profile(profile: Profile) -> Self {
        let maybe_act = match profile {
            Profile::Core => TokenBucket::new(16, 8.0),
            Profile::Edge => TokenBucket::new(8, 4.0),
        };
        Buckets {
            ping: TokenBucket::new(10, 5.0),
            neighbors: TokenBucket::new(8, 2.0),
            announce: TokenBucket::new(8, 2.0),
            maybe_act,
            leave: TokenBucket::new(4, 1.0),
            discovery: TokenBucket::new(20, 10.0),
        }
    }

    fn for_kind(&mut self, kind: RpcKind) -> &mut TokenBucket {
        match kind {
            RpcKind::Ping => &mut self.ping,
            RpcKind::Neighbors => &mut self.neighbors,
            RpcKind::NeighborsAnnounce => &mut self.announce,
            RpcKind::MaybeAct => &mut self.maybe_act,
            RpcKind::Leave => &mut self.leave,
        }
    }
}

struct FretActor<H: HostRuntime> {
    cmd_rx: mpsc::Receiver<Command>,
    host: Arc<H>,
    config: FretConfig,
    self_id: String,
    self_coord: Coord,
    store: Digitree,
    bands: SparsityBands,
    estimator: NetworkEstimator,
    dedup: DedupCache<MaybeActReply>,
    backoff: BackoffTracker,
    buckets: Buckets,
    announced: DedupCache<()>,
    inflight_act: usize,
    diagnostics: Diagnostics,
    events_tx: mpsc::Sender<ServiceEvent>,
}

impl<H: HostRuntime> FretActor<H> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle(cmd) {
                break;
            }
        }
        debug!(peer = %abbrev(&self.self_id), "service actor stopped");
    }

    /// Returns true on Quit.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::UpsertPeer(id, reply) => {
                let fresh = self.upsert_noting(&id);
                if let Some(reply) = reply {
                    let _ = reply.send(fresh);
                }
            }
            Command::SetPeerState(id, state) => {
                self.store.set_state(&id, state);
            }
            Command::GetPeer(id, reply) => {
                let _ = reply.send(self.store.get_by_id(&id));
            }
            Command::ListPeers(reply) => {
                let _ = reply.send(self.store.list());
            }
            Command::TouchPeer(id) => self.touch(&id),
            Command::RecordPeerSuccess(id, latency_ms) => {
                let x = self.norm_dist(&id);
                let bands = &mut self.bands;
                let now = now_ms();
                self.store.update(&id, |e| {
                    relevance::record_success(e, latency_ms, x, bands, now)
                });
            }
            Command::RecordPeerFailure(id) => {
                let x = self.norm_dist(&id);
                self.store.update(&id, |e| relevance::record_failure(e, x));
                if !self.host.is_connected(&id) {
                    self.store.set_state(&id, PeerState::Disconnected);
                }
            }

            Command::ReportSize {
                estimate,
                confidence,
                source,
            } => self.estimator.report(estimate, confidence, &source, now_ms()),
            Command::GetEstimate(reply) => {
                let est = self.estimate_now();
                let _ = reply.send(est);
            }
            Command::GetChurn(reply) => {
                let _ = reply.send(self.estimator.churn_per_minute(now_ms()));
            }
            Command::DetectPartition(reply) => {
                let self_obs = self.self_observation();
                let _ = reply.send(self.estimator.detect_partition(now_ms(), self_obs));
            }

            Command::AdmitEnvelope {
                kind,
                timestamp,
                reply,
            } => {
                let verdict = self.admit_envelope(kind, timestamp);
                let _ = reply.send(verdict);
            }
            Command::CountReject(kind) => self.diagnostics.rejected.bump(kind),
            Command::Bump(stat) => self.bump(stat),

            Command::AdmitAct {
                correlation_id,
                timestamp,
                ttl,
                activity_bytes,
                reply,
            } => {
                let verdict = self.admit_act(&correlation_id, timestamp, ttl, activity_bytes);
                let _ = reply.send(verdict);
            }
            Command::FinishAct {
                correlation_id,
                reply,
            } => {
                self.dedup.insert(&correlation_id, reply);
                self.inflight_act = self.inflight_act.saturating_sub(1);
            }
            Command::GetRoutePlan {
                target,
                want_k,
                exclude,
                reply,
            } => {
                let plan = self.route_plan(target, want_k, &exclude);
                let _ = reply.send(plan);
            }
            Command::BackoffFailure(id) => self.backoff.record_failure(&id),
            Command::BackoffClear(id) => self.backoff.clear(&id),

            Command::BuildSnapshot(reply) => {
                let snapshot = self.build_snapshot();
                let _ = reply.send(snapshot);
            }
            Command::MergeSnapshot(snapshot) => self.merge_snapshot(*snapshot),
            Command::NeighborUnion(m, reply) => {
                let _ = reply.send(self.store.neighbor_union(m));
            }
            Command::CohortAround(coord, want, reply) => {
                let cohort = self
                    .store
                    .assemble_cohort(coord, want)
                    .into_iter()
                    .map(|e| e.id)
                    .collect();
                let _ = reply.send(cohort);
            }
            Command::MarkAnnounced(id, reply) => {
                let fresh = !self.announced.contains(&id);
                if fresh {
                    self.announced.insert(&id, ());
                }
                let _ = reply.send(fresh);
            }

            Command::LeavePlan(reply) => {
                let plan = self.leave_plan();
                let _ = reply.send(plan);
            }
            Command::LeaveReceived {
                from,
                replacements,
                reply,
            } => {
                let recovery = self.leave_received(&from, replacements);
                let _ = reply.send(recovery);
            }

            Command::GetDiagnostics(reply) => {
                let _ = reply.send(self.diagnostics);
            }
            Command::ExportTable(reply) => {
                let table = ExportedTable {
                    v: WIRE_VERSION,
                    peer_id: self.self_id.clone(),
                    timestamp: now_ms(),
                    entries: self.store.export_entries(),
                };
                let _ = reply.send(table);
            }
            Command::ImportTable(entries, reply) => {
                let count = self.store.import_entries(entries);
                let _ = reply.send(count);
            }

            Command::Quit => return true,
        }
        false
    }

    fn bump(&mut self, stat: Stat) {
        match stat {
            Stat::PingSent => self.diagnostics.pings_sent += 1,
            Stat::PingReceived => self.diagnostics.pings_received += 1,
            Stat::AnnounceSent => self.diagnostics.announcements_sent += 1,
            Stat::RouteForwarded => self.diagnostics.routes_forwarded += 1,
            Stat::ActivityInvoked => self.diagnostics.activities_invoked += 1,
            Stat::LeaveSent => self.diagnostics.leaves_sent += 1,
            Stat::StabilizeTick => self.diagnostics.stabilize_ticks += 1,
        }
    }

    fn norm_dist(&self, id: &str) -> f64 {
        let coord = self
            .store
            .get_by_id(id)
            .map(|e| e.coord)
            .unwrap_or_else(|| coord_for_peer(id));
        normalized_log_distance(&self.self_coord, &coord)
    }

    /// Insert a peer, emit a rate-limited discovery event when it is new.
    fn upsert_noting(&mut self, id: &str) -> bool {
        if id == self.self_id || !well_formed_id(id) {
            return false;
        }
        let fresh = !self.store.contains(id);
        self.store.upsert(id, coord_for_peer(id), now_ms());
        if fresh && self.buckets.discovery.try_take() {
            self.diagnostics.discovery_events += 1;
            let _ = self.events_tx.try_send(ServiceEvent::PeerDiscovered {
                id: id.to_string(),
            });
        }
        fresh
    }

    fn touch(&mut self, id: &str) {
        let x = self.norm_dist(id);
        let bands = &mut self.bands;
        let now = now_ms();
        self.store.update(id, |e| relevance::touch(e, x, bands, now));
    }

    fn self_observation(&self) -> Option<(f64, f64)> {
        let m = self.config.m;
        let successors: Vec<Coord> = self
            .store
            .successors_of_self(m)
            .into_iter()
            .map(|e| e.coord)
            .collect();
        let predecessors: Vec<Coord> = self
            .store
            .predecessors_of_self(m)
            .into_iter()
            .map(|e| e.coord)
            .collect();
        self_estimate_from_spacing(&self.self_coord, &successors, &predecessors, m)
    }

    fn estimate_now(&mut self) -> SizeEstimate {
        let self_obs = self.self_observation();
        self.estimator.estimate(now_ms(), self_obs)
    }

    fn admit_envelope(&mut self, kind: RpcKind, timestamp: u64) -> EnvelopeVerdict {
        if !validate_timestamp(timestamp, now_ms(), MAX_TIMESTAMP_DRIFT_MS) {
            self.diagnostics.rejected.bump(RejectKind::TimestampBounds);
            return EnvelopeVerdict::Stale;
        }
        let bucket = self.buckets.for_kind(kind);
        if !bucket.try_take() {
            let retry_after_ms = bucket.retry_after_ms();
            self.diagnostics.rejected.bump(RejectKind::RateLimited);
            return EnvelopeVerdict::Busy { retry_after_ms };
        }
        EnvelopeVerdict::Proceed
    }

    /// maybeAct admission in pipeline order: dedup, timestamp, TTL, payload
    /// size, token bucket, in-flight cap.
    fn admit_act(
        &mut self,
        correlation_id: &str,
        timestamp: u64,
        ttl: u32,
        activity_bytes: usize,
    ) -> ActAdmission {
        if let Some(cached) = self.dedup.get(correlation_id) {
            return ActAdmission::Cached(cached);
        }
        if !validate_timestamp(timestamp, now_ms(), MAX_TIMESTAMP_DRIFT_MS) {
            self.diagnostics.rejected.bump(RejectKind::TimestampBounds);
            return ActAdmission::Stale;
        }
        if ttl == 0 {
            self.diagnostics.rejected.bump(RejectKind::TtlExpired);
            return ActAdmission::TtlExpired;
        }
        if activity_bytes > MAX_ACTIVITY_BYTES {
            self.diagnostics.rejected.bump(RejectKind::PayloadTooLarge);
            return ActAdmission::PayloadTooLarge;
        }
        if !self.buckets.maybe_act.try_take() {
            let retry_after_ms = self.buckets.maybe_act.retry_after_ms();
            self.diagnostics.rejected.bump(RejectKind::RateLimited);
            return ActAdmission::Busy { retry_after_ms };
        }
        if self.inflight_act >= self.config.profile.inflight_act_cap() {
            self.diagnostics.rejected.bump(RejectKind::RateLimited);
            return ActAdmission::Busy { retry_after_ms: 500 };
        }
        self.inflight_act += 1;
        ActAdmission::Proceed
    }

    fn route_plan(&mut self, target: Coord, want_k: usize, exclude: &[String]) -> RoutePlan {
        let want_k = want_k.clamp(1, self.config.k.max(1));
        let cohort_entries = self.store.assemble_cohort(target, want_k);
        let self_index = cohort_entries.iter().position(|e| e.id == self.self_id);
        let cohort: Vec<String> = cohort_entries.iter().map(|e| e.id.clone()).collect();

        let estimate = self.estimate_now();
        let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();

        let fanout = self.config.m.max(4);
        let candidates: Vec<HopCandidate> = self
            .store
            .assemble_cohort(target, fanout + exclude.len() + 1)
            .into_iter()
            .filter(|e| e.id != self.self_id && !excluded.contains(e.id.as_str()))
            .take(fanout)
            .map(|e| HopCandidate {
                connected: self.host.is_connected(&e.id),
                link_quality: relevance::link_quality(&e),
                backoff_penalty: self.backoff.penalty(&e.id),
                id: e.id,
                coord: e.coord,
            })
            .collect();

        let next_hop = if candidates.is_empty() {
            None
        } else {
            let near_radius =
                compute_near_radius(estimate.estimate as f64, self.config.k, DEFAULT_BETA);
            select_next_hop(&target, &candidates, Some(&near_radius), estimate.confidence)
        };

        RoutePlan {
            self_index,
            cohort,
            next_hop,
            estimate,
        }
    }

    fn build_snapshot(&mut self) -> NeighborSnapshot {
        let successors: Vec<String> = self
            .store
            .successors_of_self(MAX_SNAPSHOT_SUCCESSORS)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let predecessors: Vec<String> = self
            .store
            .predecessors_of_self(MAX_SNAPSHOT_PREDECESSORS)
            .into_iter()
            .map(|e| e.id)
            .collect();

        let in_lists: HashSet<&str> = successors
            .iter()
            .chain(predecessors.iter())
            .map(String::as_str)
            .collect();
        let mut pool: Vec<PeerEntry> = self
            .store
            .list()
            .into_iter()
            .filter(|e| e.id != self.self_id && !in_lists.contains(e.id.as_str()))
            .collect();
        pool.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let sample: Vec<SampleEntry> = pool
            .into_iter()
            .take(MAX_SNAPSHOT_SAMPLES)
            .map(|e| SampleEntry {
                id: e.id,
                coord: e.coord.to_base64url(),
                relevance: e.relevance,
            })
            .collect();

        let estimate = self.estimate_now();
        NeighborSnapshot {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            timestamp: now_ms(),
            successors,
            predecessors,
            sample: if sample.is_empty() { None } else { Some(sample) },
            size_estimate: (estimate.confidence > 0.0).then_some(estimate.estimate),
            confidence: (estimate.confidence > 0.0).then_some(estimate.confidence),
            sig: String::new(),
            metadata: None,
        }
    }

    /// Merge a timestamp-validated snapshot: upsert + touch the sender and
    /// every listed peer, verify sample coordinates against the id digest,
    /// fold in the carried size estimate.
    fn merge_snapshot(&mut self, snapshot: NeighborSnapshot) {
        let sender = snapshot.from.clone();
        if !well_formed_id(&sender) || sender == self.self_id {
            self.diagnostics.rejected.bump(RejectKind::MalformedMessage);
            return;
        }
        self.upsert_noting(&sender);
        self.touch(&sender);
        if let Some(metadata) = snapshot.metadata.clone() {
            self.store
                .update(&sender, |e| e.metadata = Some(metadata));
        }

        for id in snapshot
            .successors
            .iter()
            .take(MAX_SNAPSHOT_SUCCESSORS)
            .chain(snapshot.predecessors.iter().take(MAX_SNAPSHOT_PREDECESSORS))
        {
            if id == &self.self_id || !well_formed_id(id) {
                continue;
            }
            self.upsert_noting(id);
            self.touch(id);
        }

        for sample in snapshot
            .sample
            .iter()
            .flatten()
            .take(MAX_SNAPSHOT_SAMPLES)
        {
            if sample.id == self.self_id || !well_formed_id(&sample.id) {
                continue;
            }
            // coordinates are derived from ids; a mismatch is corruption
            match Coord::from_base64url(&sample.coord) {
                Some(coord) if coord == coord_for_peer(&sample.id) => {
                    self.upsert_noting(&sample.id);
                    self.touch(&sample.id);
                }
                _ => {
                    self.diagnostics.rejected.bump(RejectKind::MalformedMessage);
                }
            }
        }

        if let (Some(size), Some(confidence)) = (snapshot.size_estimate, snapshot.confidence) {
            self.estimator.report(
                size as f64,
                confidence,
                &format!("snapshot:{sender}"),
                now_ms(),
            );
        }

        self.diagnostics.snapshots_merged += 1;
    }

    fn leave_plan(&mut self) -> LeaveExit {
        let m = self.config.m.max(2);
        let union: Vec<String> = self
            .store
            .neighbor_union(m)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let sp: HashSet<&str> = union.iter().map(String::as_str).collect();

        // replacement pool: the next 2m peers outward on each side
        let mut seen = HashSet::new();
        let mut pool: Vec<PeerEntry> = Vec::new();
        for entry in self
            .store
            .successors_of_self(m + 2 * m)
            .into_iter()
            .skip(m)
            .chain(self.store.predecessors_of_self(m + 2 * m).into_iter().skip(m))
        {
            if entry.id == self.self_id || sp.contains(entry.id.as_str()) {
                continue;
            }
            if seen.insert(entry.id.clone()) {
                pool.push(entry);
            }
        }
        pool.sort_by(|a, b| {
            let conn_a = self.host.is_connected(&a.id);
            let conn_b = self.host.is_connected(&b.id);
            conn_b.cmp(&conn_a).then_with(|| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        let replacements: Vec<String> = pool
            .into_iter()
            .take(LEAVE_REPLACEMENT_COUNT)
            .map(|e| e.id)
            .collect();

        let mut targets = union;
        for id in replacements
            .iter()
            .take(self.config.profile.leave_fanout_beyond_neighbors())
        {
            if !targets.contains(id) {
                targets.push(id.clone());
            }
        }

        LeaveExit {
            targets,
            replacements,
        }
    }

    fn leave_received(&mut self, from: &str, suggested: Vec<String>) -> LeaveRecovery {
        self.diagnostics.leave_notices_received += 1;

        let coord = self
            .store
            .get_by_id(from)
            .map(|e| e.coord)
            .unwrap_or_else(|| coord_for_peer(from));
        self.store.remove(from);

        // suggested ids first (the departing peer vouched for them), then
        // local cohort expansion around the departed coordinate
        let mut merged: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for id in suggested {
            if !well_formed_id(&id) || id == self.self_id || id == from {
                continue;
            }
            if seen.insert(id.clone()) {
                merged.push(id);
            }
        }
        for entry in self.store.assemble_cohort(coord, MAX_REPLACEMENTS) {
            if entry.id == self.self_id || entry.id == from {
                continue;
            }
            if seen.insert(entry.id.clone()) {
                merged.push(entry.id);
            }
        }
        merged.truncate(MAX_REPLACEMENTS);

        for id in &merged {
            self.upsert_noting(id);
        }

        let warm_targets: Vec<String> =
            merged.iter().take(LEAVE_WARMUP_COUNT).cloned().collect();
        let announce_targets: Vec<String> = self
            .store
            .assemble_cohort(coord, LEAVE_ANNOUNCE_COUNT * 2)
            .into_iter()
            .filter(|e| e.id != self.self_id && self.host.is_connected(&e.id))
            .take(LEAVE_ANNOUNCE_COUNT)
            .map(|e| e.id)
            .collect();

        LeaveRecovery {
            warm_targets,
            announce_targets,
        }
    }
}

/// Public handle of one overlay service instance.
///
/// Cheap to clone; every clone talks to the same actor.
pub struct FretNode<H: HostRuntime> {
    cmd_tx: mpsc::Sender<Command>,
    host: Arc<H>,
    config: Arc<FretConfig>,
    self_id: String,
    self_coord: Coord,
    stopped: Arc<AtomicBool>,
    announced_after_bootstrap: Arc<AtomicBool>,
    activity: Arc<StdMutex<Option<Arc<dyn ActivityHandler>>>>,
    events_rx: Arc<StdMutex<Option<mpsc::Receiver<ServiceEvent>>>>,
}

impl<H: HostRuntime> Clone for FretNode<H> {
    fn clone(&self) -> Self {
        FretNode {
            cmd_tx: self.cmd_tx.clone(),
            host: self.host.clone(),
            config: self.config.clone(),
            self_id: self.self_id.clone(),
            self_coord: self.self_coord,
            stopped: self.stopped.clone(),
            announced_after_bootstrap: self.announced_after_bootstrap.clone(),
            activity: self.activity.clone(),
            events_rx: self.events_rx.clone(),
        }
    }
}

impl<H: HostRuntime> FretNode<H> {
    pub fn new(self_id: impl Into<String>, config: FretConfig, host: Arc<H>) -> Self {
        let self_id = self_id.into();
        let self_coord = coord_for_peer(&self_id);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);

        let actor = FretActor {
            cmd_rx,
            host: host.clone(),
            config: config.clone(),
            self_id: self_id.clone(),
            self_coord,
            store: Digitree::new(self_id.clone(), self_coord, config.capacity, config.m),
            bands: SparsityBands::new(),
            estimator: NetworkEstimator::new(),
            dedup: DedupCache::new(DEDUP_MAX, DEDUP_TTL),
            backoff: BackoffTracker::new(),
            buckets: Buckets::for_profile(config.profile),
            announced: DedupCache::new(DEDUP_MAX, ANNOUNCE_TTL),
            inflight_act: 0,
            diagnostics: Diagnostics::default(),
            events_tx,
        };
        tokio::spawn(actor.run());

        FretNode {
            cmd_tx,
            host,
            config: Arc::new(config),
            self_id,
            self_coord,
            stopped: Arc::new(AtomicBool::new(false)),
            announced_after_bootstrap: Arc::new(AtomicBool::new(false)),
            activity: Arc::new(StdMutex::new(None)),
            events_rx: Arc::new(StdMutex::new(Some(events_rx))),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_coord(&self) -> Coord {
        self.self_coord
    }

    pub fn config(&self) -> &FretConfig {
        &self.config
    }

    pub(crate) fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Register the activity callback invoked for in-cluster deliveries.
    pub fn set_activity_handler(&self, handler: Arc<dyn ActivityHandler>) {
        if let Ok(mut slot) = self.activity.lock() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn activity_handler(&self) -> Option<Arc<dyn ActivityHandler>> {
        self.activity.lock().ok().and_then(|slot| slot.clone())
    }

    /// Take the service event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<ServiceEvent>> {
        self.events_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Seed the table, register protocol handlers, announce, install the
    /// peer-event pump, and begin stabilization ticks.
    pub async fn start(&self) -> Result<()> {
        info!(
            peer = %abbrev(&self.self_id),
            network = %self.config.network_name,
            profile = ?self.config.profile,
            mode = ?self.config.mode,
            "starting overlay service"
        );

        for id in &self.config.bootstraps {
            self.upsert_peer(id).await;
        }

        self.register_handlers()
            .await
            .context("registering protocol handlers")?;

        if self.config.mode == ServiceMode::Active {
            self.preconnect_bootstraps().await;
        }

        self.announce_round(STARTUP_ANNOUNCE_FANOUT).await;
        self.spawn_peer_event_pump().await;
        self.spawn_stabilize_loop();
        Ok(())
    }

    /// Flip the stopped flag, send best-effort leave notices, stop the actor.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let plan = self
            .request(|reply| Command::LeavePlan(reply))
            .await
            .unwrap_or_default();
        let notice = LeaveNotice {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            replacements: (!plan.replacements.is_empty()).then_some(plan.replacements),
            timestamp: now_ms(),
        };
        let body = encode(&notice);
        let protocol = RpcKind::Leave.protocol_id(&self.config.network_name);
        for target in &plan.targets {
            match self.host.request(target, &protocol, body.clone()).await {
                Ok(_) => self.bump(Stat::LeaveSent).await,
                Err(e) => {
                    debug!(peer = %abbrev(target), error = %e, "leave notice failed");
                }
            }
        }
        info!(
            peer = %abbrev(&self.self_id),
            targets = plan.targets.len(),
            "overlay service left the ring"
        );
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // ------------------------------------------------------------------
    // Command plumbing
    // ------------------------------------------------------------------

    async fn request<T, F>(&self, make: F) -> Option<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    async fn fire(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd).await;
    }

    pub(crate) async fn bump(&self, stat: Stat) {
        self.fire(Command::Bump(stat)).await;
    }

    pub(crate) async fn count_reject(&self, kind: RejectKind) {
        self.fire(Command::CountReject(kind)).await;
    }

    pub async fn upsert_peer(&self, id: &str) -> bool {
        if id == self.self_id {
            return false;
        }
        self.request(|reply| Command::UpsertPeer(id.to_string(), Some(reply)))
            .await
            .unwrap_or(false)
    }

    pub async fn get_peer(&self, id: &str) -> Option<PeerEntry> {
        self.request(|reply| Command::GetPeer(id.to_string(), reply))
            .await
            .flatten()
    }

    pub async fn list_peers(&self) -> Vec<PeerEntry> {
        self.request(Command::ListPeers).await.unwrap_or_default()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.request(Command::GetDiagnostics)
            .await
            .unwrap_or_default()
    }

    pub async fn network_size_estimate(&self) -> SizeEstimate {
        self.request(Command::GetEstimate)
            .await
            .unwrap_or(SizeEstimate::UNKNOWN)
    }

    pub async fn network_churn(&self) -> f64 {
        self.request(Command::GetChurn).await.unwrap_or(0.0)
    }

    pub async fn detect_partition(&self) -> bool {
        self.request(Command::DetectPartition)
            .await
            .unwrap_or(false)
    }

    pub async fn report_network_size(&self, estimate: f64, confidence: f64, source: &str) {
        self.fire(Command::ReportSize {
            estimate,
            confidence,
            source: source.to_string(),
        })
        .await;
    }

    /// Export the table as the persisted warm-start document.
    pub async fn export_table(&self) -> Option<ExportedTable> {
        self.request(Command::ExportTable).await
    }

    /// Import a warm-start document; restored entries come back
    /// disconnected until the host re-proves liveness.
    pub async fn import_table(&self, table: ExportedTable) -> usize {
        self.request(|reply| Command::ImportTable(table.entries, reply))
            .await
            .unwrap_or(0)
    }

    pub async fn assemble_cohort(&self, coord: Coord, want: usize) -> Vec<String> {
        self.request(|reply| Command::CohortAround(coord, want, reply))
            .await
            .unwrap_or_default()
    }

    pub(crate) async fn admit_envelope(&self, kind: RpcKind, timestamp: u64) -> EnvelopeVerdict {
        self.request(|reply| Command::AdmitEnvelope {
            kind,
            timestamp,
            reply,
        })
        .await
        .unwrap_or(EnvelopeVerdict::Busy {
            retry_after_ms: 1_000,
        })
    }

    pub(crate) async fn admit_act(
        &self,
        correlation_id: &str,
        timestamp: u64,
        ttl: u32,
        activity_bytes: usize,
    ) -> ActAdmission {
        self.request(|reply| Command::AdmitAct {
            correlation_id: correlation_id.to_string(),
            timestamp,
            ttl,
            activity_bytes,
            reply,
        })
        .await
        .unwrap_or(ActAdmission::Busy {
            retry_after_ms: 1_000,
        })
    }

    pub(crate) async fn finish_act(&self, correlation_id: &str, reply: MaybeActReply) {
        self.fire(Command::FinishAct {
            correlation_id: correlation_id.to_string(),
            reply,
        })
        .await;
    }

    pub(crate) async fn route_plan(
        &self,
        target: Coord,
        want_k: usize,
        exclude: Vec<String>,
    ) -> RoutePlan {
        self.request(|reply| Command::GetRoutePlan {
            target,
            want_k,
            exclude,
            reply,
        })
        .await
        .unwrap_or(RoutePlan {
            self_index: None,
            cohort: Vec::new(),
            next_hop: None,
            estimate: SizeEstimate::UNKNOWN,
        })
    }

    pub(crate) async fn record_peer_success(&self, id: &str, latency_ms: f64) {
        self.fire(Command::RecordPeerSuccess(id.to_string(), latency_ms))
            .await;
    }

    pub(crate) async fn record_peer_failure(&self, id: &str) {
        self.fire(Command::RecordPeerFailure(id.to_string())).await;
    }

    pub(crate) async fn backoff_failure(&self, id: &str) {
        self.fire(Command::BackoffFailure(id.to_string())).await;
    }

    pub(crate) async fn backoff_clear(&self, id: &str) {
        self.fire(Command::BackoffClear(id.to_string())).await;
    }

    // ------------------------------------------------------------------
    // Wire operations
    // ------------------------------------------------------------------

    fn protocol(&self, kind: RpcKind) -> String {
        kind.protocol_id(&self.config.network_name)
    }

    /// Ping one peer, feeding RTT and the carried size estimate back into
    /// the table.
    pub async fn ping_peer(&self, id: &str) -> Result<PingResponse> {
        let estimate = self.network_size_estimate().await;
        let request = PingRequest {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            timestamp: now_ms(),
            size_estimate: (estimate.confidence > 0.0).then_some(estimate.estimate),
            confidence: (estimate.confidence > 0.0).then_some(estimate.confidence),
        };
        self.bump(Stat::PingSent).await;
        let started = Instant::now();
        let outcome = self
            .host
            .request(id, &self.protocol(RpcKind::Ping), encode(&request))
            .await;
        match outcome {
            Ok(bytes) => {
                let response: PingResponse =
                    decode_bounded(&bytes, self.config.profile.max_request_bytes(RpcKind::Ping))
                        .map_err(|e| anyhow::anyhow!("ping reply: {e}"))?;
                if response.ok {
                    let rtt = started.elapsed().as_secs_f64() * 1000.0;
                    self.record_peer_success(id, rtt).await;
                    if let (Some(size), Some(confidence)) =
                        (response.size_estimate, response.confidence)
                    {
                        self.report_network_size(size as f64, confidence, &format!("ping:{id}"))
                            .await;
                    }
                } else {
                    self.record_peer_failure(id).await;
                }
                Ok(response)
            }
            Err(e) => {
                self.record_peer_failure(id).await;
                Err(e)
            }
        }
    }

    /// Fetch and merge a peer's snapshot.
    pub async fn fetch_neighbors(&self, id: &str) -> Result<()> {
        let request = NeighborsRequest {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            timestamp: now_ms(),
        };
        let bytes = self
            .host
            .request(id, &self.protocol(RpcKind::Neighbors), encode(&request))
            .await?;
        let snapshot: NeighborSnapshot = decode_bounded(
            &bytes,
            self.config.profile.max_request_bytes(RpcKind::Neighbors),
        )
        .map_err(|e| anyhow::anyhow!("snapshot reply: {e}"))?;
        if !validate_timestamp(snapshot.timestamp, now_ms(), MAX_TIMESTAMP_DRIFT_MS) {
            self.count_reject(RejectKind::TimestampBounds).await;
            return Ok(());
        }
        self.fire(Command::MergeSnapshot(Box::new(snapshot))).await;
        Ok(())
    }

    /// Push our snapshot to a peer, deduplicated by the announce TTL map.
    pub async fn announce_to(&self, id: &str) -> Result<()> {
        let fresh = self
            .request(|reply| Command::MarkAnnounced(id.to_string(), reply))
            .await
            .unwrap_or(false);
        if !fresh {
            return Ok(());
        }
        let snapshot = self
            .request(Command::BuildSnapshot)
            .await
            .context("service stopped")?;
        self.host
            .request(
                id,
                &self.protocol(RpcKind::NeighborsAnnounce),
                encode(&snapshot),
            )
            .await?;
        self.bump(Stat::AnnounceSent).await;
        Ok(())
    }

    async fn announce_round(&self, fanout: usize) {
        let neighbors = self
            .request(|reply| Command::NeighborUnion(fanout, reply))
            .await
            .unwrap_or_default();
        for entry in neighbors.into_iter().take(fanout) {
            if let Err(e) = self.announce_to(&entry.id).await {
                debug!(peer = %abbrev(&entry.id), error = %e, "announce failed");
            }
        }
    }

    async fn preconnect_bootstraps(&self) {
        for id in self.config.bootstraps.clone() {
            if id == self.self_id {
                continue;
            }
            if let Err(e) = self.ping_peer(&id).await {
                debug!(peer = %abbrev(&id), error = %e, "bootstrap pre-connect failed");
            }
        }
    }

    /// One stabilization pass: re-seed, probe, merge, never throws.
    pub async fn stabilize_once(&self) {
        for id in &self.config.bootstraps {
            self.upsert_peer(id).await;
        }

        let m = self.config.m.max(2);
        let union = self
            .request(|reply| Command::NeighborUnion(m, reply))
            .await
            .unwrap_or_default();
        let reachable: Vec<String> = union
            .into_iter()
            .filter(|e| {
                e.id != self.self_id
                    && (self.host.is_connected(&e.id) || self.host.has_dial_info(&e.id))
            })
            .map(|e| e.id)
            .collect();

        for id in reachable.iter().take(STABILIZE_PROBE_COUNT) {
            if self.is_stopped() {
                return;
            }
            if let Err(e) = self.ping_peer(id).await {
                debug!(peer = %abbrev(id), error = %e, "stabilize ping failed");
            }
        }

        for id in reachable.iter().take(STABILIZE_PROBE_COUNT) {
            if self.is_stopped() {
                return;
            }
            if let Err(e) = self.fetch_neighbors(id).await {
                debug!(peer = %abbrev(id), error = %e, "snapshot fetch failed");
            }
        }

        self.bump(Stat::StabilizeTick).await;
    }

    fn spawn_stabilize_loop(&self) {
        let node = self.clone();
        let cadence = self.config.mode.cadence();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.is_stopped() {
                    break;
                }
                // ticks are serialized: the next one cannot start before
                // this await settles
                node.stabilize_once().await;
            }
            trace!(peer = %abbrev(&node.self_id), "stabilization loop ended");
        });
    }

    async fn spawn_peer_event_pump(&self) {
        let mut events = self.host.peer_events().await;
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if node.is_stopped() {
                    break;
                }
                match event {
                    PeerEvent::Connected(id) => {
                        node.upsert_peer(&id).await;
                        node.fire(Command::SetPeerState(id.clone(), PeerState::Connected))
                            .await;
                        // first remote connect triggers the one-shot
                        // post-bootstrap announce
                        if !node.announced_after_bootstrap.swap(true, Ordering::SeqCst) {
                            node.announce_round(STARTUP_ANNOUNCE_FANOUT).await;
                        }
                    }
                    PeerEvent::Disconnected(id) => {
                        node.fire(Command::SetPeerState(id, PeerState::Disconnected))
                            .await;
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Protocol handlers
    // ------------------------------------------------------------------

    async fn register_handlers(&self) -> Result<()> {
        macro_rules! register {
            ($kind:expr, $serve:ident) => {{
                let node = self.clone();
                let handler: InboundHandler = Arc::new(move |req: InboundRequest| {
                    let node = node.clone();
                    Box::pin(async move { node.$serve(req).await })
                });
                self.host
                    .register_handler(&self.protocol($kind), handler)
                    .await?;
            }};
        }
        register!(RpcKind::Ping, serve_ping);
        register!(RpcKind::Neighbors, serve_neighbors);
        register!(RpcKind::NeighborsAnnounce, serve_announce);
        register!(RpcKind::MaybeAct, serve_maybe_act);
        register!(RpcKind::Leave, serve_leave);
        Ok(())
    }

    async fn read_request<T: serde::de::DeserializeOwned>(
        &self,
        kind: RpcKind,
        mut req: InboundRequest,
    ) -> Result<(String, T), RejectKind> {
        let max = self.config.profile.max_request_bytes(kind);
        let body = match read_all_bounded(req.stream.as_mut(), max).await {
            Ok(body) => body,
            Err(e) => {
                let kind = e.kind();
                self.count_reject(kind).await;
                return Err(kind);
            }
        };
        match decode_bounded::<T>(&body, max) {
            Ok(message) => Ok((req.peer_id, message)),
            Err(e) => {
                let kind = e.kind();
                self.count_reject(kind).await;
                Err(kind)
            }
        }
    }

    async fn serve_ping(&self, req: InboundRequest) -> Vec<u8> {
        let failed = PingResponse {
            ok: false,
            ts: now_ms(),
            size_estimate: None,
            confidence: None,
        };
        let Ok((peer_id, ping)) = self.read_request::<PingRequest>(RpcKind::Ping, req).await
        else {
            return encode(&failed);
        };
        match self.admit_envelope(RpcKind::Ping, ping.timestamp).await {
            EnvelopeVerdict::Proceed => {}
            EnvelopeVerdict::Busy { retry_after_ms } => {
                return encode(&crate::messages::BusyResponse::with_retry_after(
                    retry_after_ms,
                ));
            }
            EnvelopeVerdict::Stale => return encode(&failed),
        }

        let sender = if well_formed_id(&ping.from) {
            ping.from.clone()
        } else {
            peer_id
        };
        self.upsert_peer(&sender).await;
        self.fire(Command::TouchPeer(sender.clone())).await;
        if let (Some(size), Some(confidence)) = (ping.size_estimate, ping.confidence) {
            self.report_network_size(size as f64, confidence, &format!("ping:{sender}"))
                .await;
        }
        self.bump(Stat::PingReceived).await;

        let estimate = self.network_size_estimate().await;
        encode(&PingResponse {
            ok: true,
            ts: now_ms(),
            size_estimate: (estimate.confidence > 0.0).then_some(estimate.estimate),
            confidence: (estimate.confidence > 0.0).then_some(estimate.confidence),
        })
    }

    async fn serve_neighbors(&self, req: InboundRequest) -> Vec<u8> {
        let empty = NeighborSnapshot {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            timestamp: now_ms(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            sample: None,
            size_estimate: None,
            confidence: None,
            sig: String::new(),
            metadata: None,
        };
        let Ok((peer_id, request)) = self
            .read_request::<NeighborsRequest>(RpcKind::Neighbors, req)
            .await
        else {
            return encode(&empty);
        };
        match self
            .admit_envelope(RpcKind::Neighbors, request.timestamp)
            .await
        {
            EnvelopeVerdict::Proceed => {}
            EnvelopeVerdict::Busy { retry_after_ms } => {
                return encode(&crate::messages::BusyResponse::with_retry_after(
                    retry_after_ms,
                ));
            }
            EnvelopeVerdict::Stale => return encode(&empty),
        }
        let sender = if well_formed_id(&request.from) {
            request.from.clone()
        } else {
            peer_id
        };
        self.upsert_peer(&sender).await;
        match self.request(Command::BuildSnapshot).await {
            Some(snapshot) => encode(&snapshot),
            None => encode(&empty),
        }
    }

    async fn serve_announce(&self, req: InboundRequest) -> Vec<u8> {
        let ack = |ok: bool| {
            encode(&PingResponse {
                ok,
                ts: now_ms(),
                size_estimate: None,
                confidence: None,
            })
        };
        let Ok((_, snapshot)) = self
            .read_request::<NeighborSnapshot>(RpcKind::NeighborsAnnounce, req)
            .await
        else {
            return ack(false);
        };
        match self
            .admit_envelope(RpcKind::NeighborsAnnounce, snapshot.timestamp)
            .await
        {
            EnvelopeVerdict::Proceed => {}
            EnvelopeVerdict::Busy { retry_after_ms } => {
                return encode(&crate::messages::BusyResponse::with_retry_after(
                    retry_after_ms,
                ));
            }
            // stale announces are dropped without comment
            EnvelopeVerdict::Stale => return ack(false),
        }
        self.fire(Command::MergeSnapshot(Box::new(snapshot))).await;
        ack(true)
    }

    async fn serve_maybe_act(&self, req: InboundRequest) -> Vec<u8> {
        let Ok((_, message)) = self
            .read_request::<crate::messages::RouteAndMaybeAct>(RpcKind::MaybeAct, req)
            .await
        else {
            // the caller observes an aborted exchange, never a crash
            return Vec::new();
        };
        let reply = self.handle_maybe_act(message).await;
        encode(&reply.to_value())
    }

    async fn serve_leave(&self, req: InboundRequest) -> Vec<u8> {
        let ack = |ok: bool| {
            encode(&PingResponse {
                ok,
                ts: now_ms(),
                size_estimate: None,
                confidence: None,
            })
        };
        let Ok((_, notice)) = self.read_request::<LeaveNotice>(RpcKind::Leave, req).await
        else {
            return ack(false);
        };
        match self.admit_envelope(RpcKind::Leave, notice.timestamp).await {
            EnvelopeVerdict::Proceed => {}
            EnvelopeVerdict::Busy { retry_after_ms } => {
                return encode(&crate::messages::BusyResponse::with_retry_after(
                    retry_after_ms,
                ));
            }
            EnvelopeVerdict::Stale => return ack(false),
        }
        if !well_formed_id(&notice.from) {
            self.count_reject(RejectKind::MalformedMessage).await;
            return ack(false);
        }

        let recovery = self
            .request(|reply| Command::LeaveReceived {
                from: notice.from.clone(),
                replacements: notice.replacements.unwrap_or_default(),
                reply,
            })
            .await
            .unwrap_or_default();

        // warm-ups and re-announces run off the handler path
        let node = self.clone();
        tokio::spawn(async move {
            for id in &recovery.warm_targets {
                if node.is_stopped() {
                    return;
                }
                if let Err(e) = node.ping_peer(id).await {
                    debug!(peer = %abbrev(id), error = %e, "replacement warm-up failed");
                    continue;
                }
                if !node.host.is_connected(id) {
                    if let Err(e) = node.announce_to(id).await {
                        debug!(peer = %abbrev(id), error = %e, "replacement announce failed");
                    }
                }
            }
            for id in &recovery.announce_targets {
                if node.is_stopped() {
                    return;
                }
                if let Err(e) = node.announce_to(id).await {
                    debug!(peer = %abbrev(id), error = %e, "departure announce failed");
                }
            }
        });

        ack(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_a_passive_edge_node() {
        let config = FretConfig::default();
        assert_eq!(config.profile, Profile::Edge);
        assert_eq!(config.mode, ServiceMode::Passive);
        assert_eq!(config.max_ttl, MAX_TTL);
        assert!(config.k >= 1 && config.m >= 1);
    }

    #[test]
    fn cadence_differs_by_mode() {
        assert!(ServiceMode::Active.cadence() < ServiceMode::Passive.cadence());
        assert_eq!(ServiceMode::Passive.cadence(), Duration::from_millis(1500));
        assert_eq!(ServiceMode::Active.cadence(), Duration::from_millis(300));
    }

    #[test]
    fn well_formed_ids_reject_junk() {
        assert!(well_formed_id("peer-1"));
        assert!(well_formed_id("12D3KooWBdW1qo5DMfnLyzv4fY9HBMScYUJsy7sAhFMT2N9M63iw"));
        assert!(!well_formed_id(""));
        assert!(!well_formed_id("has space"));
        assert!(!well_formed_id("tab\tseparated"));
        assert!(!well_formed_id("ctrl\u{7}char"));
        assert!(!well_formed_id(&"x".repeat(300)));
    }

    #[test]
    fn rejected_counters_map_kinds() {
        let mut counters = RejectedCounters::default();
        counters.bump(RejectKind::PayloadTooLarge);
        counters.bump(RejectKind::TimestampBounds);
        counters.bump(RejectKind::TimestampBounds);
        counters.bump(RejectKind::TtlExpired);
        counters.bump(RejectKind::RateLimited);
        counters.bump(RejectKind::MalformedMessage);
        assert_eq!(counters.payload_too_large, 1);
        assert_eq!(counters.timestamp_bounds, 2);
        assert_eq!(counters.ttl_expired, 1);
        assert_eq!(counters.rate_limited, 1);
        assert_eq!(counters.malformed_message, 1);
    }
}
