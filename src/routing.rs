//! # Next-Hop Selection
//!
//! The dual-mode hop chooser and the heuristics feeding it.
//!
//! Far from the target, hops are picked by a cost function that trades raw
//! XOR distance against connectivity, link quality, and per-peer backoff —
//! a far-but-connected peer is usually cheaper than a near-but-cold one.
//! Inside the near zone (a radius proportional to `k · 2^256 / n̂`) that
//! logic inverts: the final approach is strict distance ordering, so a
//! "far but connected" peer can never derail an in-cluster landing.
//!
//! The near radius and the payload-inclusion probability both derive from
//! the current network-size estimate; with no usable estimate the caller
//! falls back to the legacy selector kept for testing.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::ring::{normalized_log_distance, ring_span_div, saturating_mul_small, Coord};

/// Default near-zone multiplier.
pub const DEFAULT_BETA: u64 = 2;

/// Default probability threshold for including the activity payload.
pub const PAYLOAD_THRESHOLD: f64 = 0.5;

/// Base delay of the per-peer backoff schedule.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff factor ceiling; the penalty is `factor / 32`.
pub const BACKOFF_MAX_FACTOR: u32 = 32;

/// Peers tracked by the backoff table before LRU eviction.
const BACKOFF_TRACKED_PEERS: usize = 1024;

/// Radius of the near zone: `min(β · k · (2^256 / max(1, round(n̂))),
/// 2^256 - 1)`. Collapses to zero without a usable size estimate.
pub fn compute_near_radius(size_estimate: f64, k: usize, beta: u64) -> Coord {
    if !size_estimate.is_finite() || size_estimate < 1.0 {
        return Coord::ZERO;
    }
    let n = size_estimate.round().max(1.0) as u64;
    let gap = ring_span_div(n);
    saturating_mul_small(&gap, beta * k.max(1) as u64)
}

/// Linear include-the-payload-now probability, gated by confidence.
///
/// `p = (nearZone - dist) / nearZone` clamped at zero; the payload ships
/// when `p · confidence` clears the threshold.
pub fn should_include_payload(
    dist_to_key: &Coord,
    size_estimate: f64,
    confidence: f64,
    k: usize,
    beta: u64,
    threshold: f64,
) -> bool {
    if !size_estimate.is_finite() || size_estimate < 1.0 || confidence <= 0.0 {
        return false;
    }
    let n = size_estimate.round().max(1.0);
    let near_zone = beta as f64 * k.max(1) as f64 * (Coord::MAX.to_f64() / n);
    if near_zone <= 0.0 {
        return false;
    }
    let p = ((near_zone - dist_to_key.to_f64()) / near_zone).max(0.0);
    p * confidence >= threshold
}

/// One scored routing candidate.
#[derive(Debug, Clone)]
pub struct HopCandidate {
    pub id: String,
    pub coord: Coord,
    pub connected: bool,
    pub link_quality: f64,
    pub backoff_penalty: f64,
}

/// Pick the next hop toward `target`.
///
/// `Some(near_radius)` selects the cost-function mode; `None` the legacy
/// nearest-connected mode retained for testing.
pub fn select_next_hop(
    target: &Coord,
    candidates: &[HopCandidate],
    near_radius: Option<&Coord>,
    confidence: f64,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    match near_radius {
        Some(radius) => select_by_cost(target, candidates, radius, confidence),
        None => select_legacy(target, candidates, 1),
    }
}

struct Scored<'a> {
    candidate: &'a HopCandidate,
    dist: Coord,
    near: bool,
    cost: f64,
}

fn select_by_cost(
    target: &Coord,
    candidates: &[HopCandidate],
    near_radius: &Coord,
    confidence: f64,
) -> Option<String> {
    let mut scored: Vec<Scored<'_>> = candidates
        .iter()
        .map(|c| {
            let dist = c.coord.xor_distance(target);
            let near = !near_radius.is_zero() && dist <= *near_radius;
            let norm = normalized_log_distance(&c.coord, target);

            let (mut w_d, mut w_conn, w_q, w_b) = if near {
                (0.7, 0.1, 0.1, 0.1)
            } else {
                (0.4, 0.4, 0.1, 0.1)
            };
            let shift = (confidence - 0.5) * 0.2;
            w_d = (w_d + shift).max(0.1);
            w_conn = (w_conn - shift).max(0.05);

            let cost = w_d * norm - w_conn * if c.connected { 1.0 } else { 0.0 }
                - w_q * c.link_quality
                + w_b * c.backoff_penalty;
            Scored {
                candidate: c,
                dist,
                near,
                cost,
            }
        })
        .collect();

    let any_near = scored.iter().any(|s| s.near);
    if any_near {
        scored.retain(|s| s.near);
        scored.sort_by(|a, b| {
            a.dist
                .cmp(&b.dist)
                .then_with(|| b.candidate.connected.cmp(&a.candidate.connected))
                .then_with(|| a.cost.partial_cmp(&b.cost).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });
    } else {
        scored.sort_by(|a, b| {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.dist.cmp(&b.dist))
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });
    }
    let winner = scored.first()?;
    trace!(
        peer = %crate::store::abbrev(&winner.candidate.id),
        near = winner.near,
        cost = winner.cost,
        "next hop selected"
    );
    Some(winner.candidate.id.clone())
}

/// First non-zero byte index of a distance; 32 for a zero distance. Higher
/// means closer.
fn leading_byte_index(dist: &Coord) -> usize {
    dist.0.iter().position(|b| *b != 0).unwrap_or(32)
}

fn select_legacy(target: &Coord, candidates: &[HopCandidate], tolerance: usize) -> Option<String> {
    let best_by_dist = candidates.iter().min_by(|a, b| {
        a.coord
            .xor_distance(target)
            .cmp(&b.coord.xor_distance(target))
            .then_with(|| a.id.cmp(&b.id))
    })?;
    let best_index = leading_byte_index(&best_by_dist.coord.xor_distance(target));
    let floor = best_index.saturating_sub(tolerance);

    let connected_winner = candidates
        .iter()
        .filter(|c| c.connected)
        .filter(|c| leading_byte_index(&c.coord.xor_distance(target)) >= floor)
        .min_by(|a, b| {
            a.coord
                .xor_distance(target)
                .cmp(&b.coord.xor_distance(target))
                .then_with(|| {
                    let score = |c: &HopCandidate| {
                        (if c.connected { 1.0 } else { 0.0 }) + 0.25 * c.link_quality
                    };
                    score(b)
                        .partial_cmp(&score(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

    Some(
        connected_winner
            .map(|c| c.id.clone())
            .unwrap_or_else(|| best_by_dist.id.clone()),
    )
}

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    factor: u32,
    until: Instant,
}

/// Per-peer exponential backoff gating re-selection through the cost
/// function. Bounded by LRU so a stream of throwaway peer ids cannot grow
/// the table.
pub struct BackoffTracker {
    peers: LruCache<String, BackoffState>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffTracker {
    pub fn new() -> Self {
        BackoffTracker {
            peers: LruCache::new(
                NonZeroUsize::new(BACKOFF_TRACKED_PEERS).expect("tracked peers must be non-zero"),
            ),
        }
    }

    /// Double the peer's factor (up to 32) and restart its window.
    pub fn record_failure(&mut self, id: &str) {
        let factor = self
            .peers
            .get(id)
            .map(|s| (s.factor * 2).min(BACKOFF_MAX_FACTOR))
            .unwrap_or(1);
        self.peers.put(
            id.to_string(),
            BackoffState {
                factor,
                until: Instant::now() + BACKOFF_BASE * factor,
            },
        );
    }

    pub fn clear(&mut self, id: &str) {
        self.peers.pop(id);
    }

    /// `factor / 32` while the window is open, 0 when expired or unknown.
    pub fn penalty(&mut self, id: &str) -> f64 {
        match self.peers.get(id) {
            Some(state) if state.until > Instant::now() => {
                state.factor as f64 / BACKOFF_MAX_FACTOR as f64
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::coord_for_peer;

    fn candidate(id: &str, coord: Coord, connected: bool) -> HopCandidate {
        HopCandidate {
            id: id.into(),
            coord,
            connected,
            link_quality: 0.5,
            backoff_penalty: 0.0,
        }
    }

    fn coord(first: u8, second: u8) -> Coord {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[1] = second;
        Coord::from_bytes(bytes)
    }

    #[test]
    fn near_radius_scales_with_network_size() {
        let small_net = compute_near_radius(10.0, 3, DEFAULT_BETA);
        let large_net = compute_near_radius(10_000.0, 3, DEFAULT_BETA);
        assert!(small_net > large_net);
        assert_eq!(compute_near_radius(0.5, 3, DEFAULT_BETA), Coord::ZERO);
        assert_eq!(compute_near_radius(f64::NAN, 3, DEFAULT_BETA), Coord::ZERO);
    }

    #[test]
    fn near_radius_saturates_in_tiny_networks() {
        // beta * k gaps of a 2-peer ring exceed the ring itself
        assert_eq!(compute_near_radius(2.0, 8, DEFAULT_BETA), Coord::MAX);
    }

    #[test]
    fn payload_ships_only_inside_the_near_zone() {
        let n = 100.0;
        let k = 3;
        let near = coord(0x00, 0x01);
        let far = coord(0x80, 0x00);
        assert!(should_include_payload(&near, n, 0.9, k, DEFAULT_BETA, PAYLOAD_THRESHOLD));
        assert!(!should_include_payload(&far, n, 0.9, k, DEFAULT_BETA, PAYLOAD_THRESHOLD));
    }

    #[test]
    fn payload_needs_a_usable_estimate() {
        let d = Coord::ZERO;
        assert!(!should_include_payload(&d, 0.0, 0.9, 3, DEFAULT_BETA, PAYLOAD_THRESHOLD));
        assert!(!should_include_payload(&d, 100.0, 0.0, 3, DEFAULT_BETA, PAYLOAD_THRESHOLD));
    }

    #[test]
    fn low_confidence_scales_the_probability_down() {
        let d = coord(0x00, 0x10);
        let n = 50.0;
        assert!(should_include_payload(&d, n, 1.0, 3, DEFAULT_BETA, PAYLOAD_THRESHOLD));
        assert!(!should_include_payload(&d, n, 0.2, 3, DEFAULT_BETA, PAYLOAD_THRESHOLD));
    }

    #[test]
    fn near_candidates_are_ranked_by_strict_distance() {
        let target = Coord::ZERO;
        let radius = coord(0x01, 0x00);
        // disconnected but nearest inside the radius
        let near_cold = candidate("near-cold", coord(0x00, 0x05), false);
        // connected but further inside the radius
        let near_warm = candidate("near-warm", coord(0x00, 0x50), true);
        // connected and far outside the radius
        let far_warm = candidate("far-warm", coord(0x40, 0x00), true);
        let picked = select_next_hop(
            &target,
            &[far_warm, near_warm, near_cold],
            Some(&radius),
            0.8,
        );
        assert_eq!(picked.as_deref(), Some("near-cold"));
    }

    #[test]
    fn far_mode_prefers_connected_peers() {
        let target = Coord::ZERO;
        let radius = coord(0x00, 0x01);
        let cold = candidate("cold", coord(0x20, 0x00), false);
        let warm = candidate("warm", coord(0x21, 0x00), true);
        let picked = select_next_hop(&target, &[cold, warm], Some(&radius), 0.5);
        assert_eq!(picked.as_deref(), Some("warm"));
    }

    #[test]
    fn backoff_penalty_derails_otherwise_equal_candidates() {
        let target = Coord::ZERO;
        let radius = coord(0x00, 0x01);
        let mut punished = candidate("punished", coord(0x20, 0x00), true);
        punished.backoff_penalty = 1.0;
        let clean = candidate("clean", coord(0x20, 0x01), true);
        let picked = select_next_hop(&target, &[punished, clean], Some(&radius), 0.5);
        assert_eq!(picked.as_deref(), Some("clean"));
    }

    #[test]
    fn legacy_mode_prefers_connected_within_tolerance() {
        let target = Coord::ZERO;
        let nearest_cold = candidate("nearest-cold", coord(0x00, 0x02), false);
        let close_warm = candidate("close-warm", coord(0x01, 0x00), true);
        let picked = select_next_hop(&target, &[nearest_cold, close_warm], None, 0.5);
        assert_eq!(picked.as_deref(), Some("close-warm"));
    }

    #[test]
    fn legacy_mode_falls_back_to_nearest_when_nothing_connected() {
        let target = Coord::ZERO;
        let a = candidate("a", coord(0x00, 0x02), false);
        let b = candidate("b", coord(0x10, 0x00), false);
        let picked = select_next_hop(&target, &[b, a], None, 0.5);
        assert_eq!(picked.as_deref(), Some("a"));
    }

    #[test]
    fn empty_candidate_set_yields_no_hop() {
        assert_eq!(select_next_hop(&Coord::ZERO, &[], None, 0.5), None);
        let r = coord_for_peer("radius");
        assert_eq!(select_next_hop(&Coord::ZERO, &[], Some(&r), 0.5), None);
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let mut tracker = BackoffTracker::new();
        tracker.record_failure("p");
        assert!((tracker.penalty("p") - 1.0 / 32.0).abs() < 1e-9);
        for _ in 0..10 {
            tracker.record_failure("p");
        }
        assert!((tracker.penalty("p") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn backoff_clears_on_success() {
        let mut tracker = BackoffTracker::new();
        tracker.record_failure("p");
        tracker.clear("p");
        assert_eq!(tracker.penalty("p"), 0.0);
    }
}
