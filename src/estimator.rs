//! # Network Size and Partition Estimator
//!
//! Every ping and snapshot reply carries the sender's current network-size
//! estimate. This module aggregates those external reports with a local
//! self-estimate derived from S/P spacing into one weighted figure, tracks
//! the churn slope over the observation window, and flags suspected
//! partitions when the estimate collapses.
//!
//! All methods take an explicit `now_ms` so the estimator stays fully
//! deterministic under the simulation harness.

use std::collections::{HashSet, VecDeque};

use crate::ring::{sub_mod, Coord};

/// Observations older than this are aged out (5 minutes).
pub const OBSERVATION_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Hard cap on retained observations.
pub const MAX_OBSERVATIONS: usize = 100;

/// One report of network size, local or remote.
#[derive(Debug, Clone)]
pub struct SizeObservation {
    pub estimate: f64,
    pub confidence: f64,
    pub timestamp_ms: u64,
    pub source: String,
}

/// Combined estimate handed to the routing heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeEstimate {
    pub estimate: u64,
    pub confidence: f64,
    pub sources: usize,
}

impl SizeEstimate {
    pub const UNKNOWN: SizeEstimate = SizeEstimate {
        estimate: 1,
        confidence: 0.0,
        sources: 0,
    };
}

/// Infer network size from how tightly packed the local S/P neighborhood is.
///
/// The arc from the furthest predecessor to the furthest successor holds
/// `neighbors + 1` peers; the implied mean gap extrapolates to the whole
/// ring. Confidence grows with how full the neighborhood is, capped at 0.6
/// so local spacing never drowns out fresh external reports.
pub fn self_estimate_from_spacing(
    self_coord: &Coord,
    successors: &[Coord],
    predecessors: &[Coord],
    m: usize,
) -> Option<(f64, f64)> {
    if successors.is_empty() && predecessors.is_empty() {
        return None;
    }
    let far_succ = successors.last().copied().unwrap_or(*self_coord);
    let far_pred = predecessors.last().copied().unwrap_or(*self_coord);
    let arc = sub_mod(&far_succ, &far_pred).to_f64();
    let peers_in_arc = successors.len() + predecessors.len() + 1;
    if arc <= 0.0 || peers_in_arc < 2 {
        return None;
    }
    let mean_gap = arc / (peers_in_arc - 1) as f64;
    if mean_gap <= 0.0 {
        return None;
    }
    let ring = Coord::MAX.to_f64();
    let estimate = (ring / mean_gap).max(1.0);
    let fill = (successors.len() + predecessors.len()) as f64 / (2 * m.max(1)) as f64;
    let confidence = (0.2 + 0.4 * fill).min(0.6);
    Some((estimate, confidence))
}

/// Weighted aggregator over a bounded, aging observation window.
#[derive(Debug, Default)]
pub struct NetworkEstimator {
    observations: VecDeque<SizeObservation>,
}

impl NetworkEstimator {
    pub fn new() -> Self {
        NetworkEstimator {
            observations: VecDeque::new(),
        }
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Append one observation; silently drops non-finite or non-positive
    /// estimates and clamps confidence into [0, 1].
    pub fn report(&mut self, estimate: f64, confidence: f64, source: &str, now_ms: u64) {
        if !estimate.is_finite() || estimate < 1.0 {
            return;
        }
        self.observations.push_back(SizeObservation {
            estimate,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp_ms: now_ms,
            source: source.to_string(),
        });
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(front) = self.observations.front() {
            if now_ms.saturating_sub(front.timestamp_ms) > OBSERVATION_WINDOW_MS {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Weighted mean of the self-estimate and all live external reports.
    ///
    /// External weights decay as `exp(-age / (window/3)) * confidence`; the
    /// self-estimate enters at zero age.
    pub fn estimate(&mut self, now_ms: u64, self_obs: Option<(f64, f64)>) -> SizeEstimate {
        self.prune(now_ms);

        let tau = OBSERVATION_WINDOW_MS as f64 / 3.0;
        let mut weight_sum = 0.0;
        let mut estimate_sum = 0.0;
        let mut confidence_sum = 0.0;
        let mut sources: HashSet<&str> = HashSet::new();

        for obs in &self.observations {
            let age = now_ms.saturating_sub(obs.timestamp_ms) as f64;
            let w = (-age / tau).exp() * obs.confidence;
            if w <= 0.0 {
                continue;
            }
            weight_sum += w;
            estimate_sum += w * obs.estimate;
            confidence_sum += w * obs.confidence;
            sources.insert(obs.source.as_str());
        }

        if let Some((est, conf)) = self_obs {
            if est.is_finite() && est >= 1.0 && conf > 0.0 {
                let w = conf.clamp(0.0, 1.0);
                weight_sum += w;
                estimate_sum += w * est;
                confidence_sum += w * w;
                sources.insert("self");
            }
        }

        if weight_sum <= 0.0 {
            return SizeEstimate::UNKNOWN;
        }

        SizeEstimate {
            estimate: (estimate_sum / weight_sum).round().max(1.0) as u64,
            confidence: (confidence_sum / weight_sum).clamp(0.0, 1.0),
            sources: sources.len(),
        }
    }

    /// Slope of the estimate across the window, in peers per minute:
    /// the newer half's mean against the older half's.
    pub fn churn_per_minute(&mut self, now_ms: u64) -> f64 {
        self.prune(now_ms);
        let n = self.observations.len();
        if n < 4 {
            return 0.0;
        }
        let mid = n / 2;
        let (older, newer): (Vec<_>, Vec<_>) = (
            self.observations.iter().take(mid).collect(),
            self.observations.iter().skip(mid).collect(),
        );
        let mean =
            |obs: &[&SizeObservation]| obs.iter().map(|o| o.estimate).sum::<f64>() / obs.len() as f64;
        let mean_ts = |obs: &[&SizeObservation]| {
            obs.iter().map(|o| o.timestamp_ms as f64).sum::<f64>() / obs.len() as f64
        };
        let dt_min = (mean_ts(&newer) - mean_ts(&older)) / 60_000.0;
        if dt_min <= 0.0 {
            return 0.0;
        }
        (mean(&newer) - mean(&older)) / dt_min
    }

    /// True when the weighted estimate collapsed to under half of the recent
    /// baseline with usable confidence, or when absolute churn exceeds 10%
    /// of the current estimate per minute. Needs at least 10 observations.
    pub fn detect_partition(&mut self, now_ms: u64, self_obs: Option<(f64, f64)>) -> bool {
        self.prune(now_ms);
        if self.observations.len() < 10 {
            return false;
        }

        let current = self.estimate(now_ms, self_obs);

        let baseline: Vec<f64> = self
            .observations
            .iter()
            .rev()
            .filter(|o| now_ms.saturating_sub(o.timestamp_ms) > 30_000)
            .take(5)
            .map(|o| o.estimate)
            .collect();
        if !baseline.is_empty() {
            let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
            if (current.estimate as f64) < mean / 2.0 && current.confidence >= 0.3 {
                return true;
            }
        }

        let churn = self.churn_per_minute(now_ms).abs();
        churn > 0.1 * current.estimate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{coord_for_peer, ring_span_div, saturating_mul_small, Coord};

    #[test]
    fn empty_estimator_reports_unknown() {
        let mut est = NetworkEstimator::new();
        assert_eq!(est.estimate(1_000, None), SizeEstimate::UNKNOWN);
    }

    #[test]
    fn recent_reports_outweigh_stale_ones() {
        let mut est = NetworkEstimator::new();
        est.report(1000.0, 0.9, "old-peer", 0);
        est.report(100.0, 0.9, "new-peer", 280_000);
        let combined = est.estimate(290_000, None);
        assert!(combined.estimate < 400, "got {}", combined.estimate);
        assert_eq!(combined.sources, 2);
    }

    #[test]
    fn observations_age_out_of_the_window() {
        let mut est = NetworkEstimator::new();
        est.report(500.0, 0.8, "peer", 0);
        let later = OBSERVATION_WINDOW_MS + 1_000;
        assert_eq!(est.estimate(later, None), SizeEstimate::UNKNOWN);
        assert_eq!(est.observation_count(), 0);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut est = NetworkEstimator::new();
        for i in 0..500u64 {
            est.report(100.0, 0.5, "peer", i);
        }
        assert_eq!(est.observation_count(), MAX_OBSERVATIONS);
    }

    #[test]
    fn garbage_reports_are_dropped() {
        let mut est = NetworkEstimator::new();
        est.report(f64::NAN, 0.5, "a", 0);
        est.report(-3.0, 0.5, "b", 0);
        est.report(0.2, 0.5, "c", 0);
        assert_eq!(est.observation_count(), 0);
    }

    #[test]
    fn churn_slope_tracks_growth_and_shrink() {
        let mut grow = NetworkEstimator::new();
        for i in 0..10u64 {
            grow.report(100.0 + 10.0 * i as f64, 0.9, "p", i * 10_000);
        }
        assert!(grow.churn_per_minute(100_000) > 0.0);

        let mut shrink = NetworkEstimator::new();
        for i in 0..10u64 {
            shrink.report(200.0 - 15.0 * i as f64, 0.9, "p", i * 10_000);
        }
        assert!(shrink.churn_per_minute(100_000) < 0.0);
    }

    #[test]
    fn partition_needs_ten_observations() {
        let mut est = NetworkEstimator::new();
        for i in 0..9u64 {
            est.report(100.0, 0.9, "p", i * 1_000);
        }
        assert!(!est.detect_partition(60_000, None));
    }

    #[test]
    fn collapse_below_half_of_baseline_is_a_partition() {
        let mut est = NetworkEstimator::new();
        // stable baseline well older than 30s
        for i in 0..10u64 {
            est.report(200.0, 0.9, "baseline", i * 1_000);
        }
        // fresh collapsed reports dominate the weighted estimate
        for i in 0..10u64 {
            est.report(40.0, 0.9, "survivor", 60_000 + i * 500);
        }
        assert!(est.detect_partition(66_000, None));
    }

    #[test]
    fn steady_network_is_not_a_partition() {
        let mut est = NetworkEstimator::new();
        for i in 0..20u64 {
            est.report(150.0, 0.8, "p", i * 2_000);
        }
        assert!(!est.detect_partition(41_000, None));
    }

    #[test]
    fn spacing_estimate_recovers_even_ring_size() {
        let n = 64u64;
        let gap = ring_span_div(n);
        let self_coord = saturating_mul_small(&gap, 10);
        let successors: Vec<Coord> = (1..=4)
            .map(|i| saturating_mul_small(&gap, 10 + i))
            .collect();
        let predecessors: Vec<Coord> = (1..=4)
            .map(|i| saturating_mul_small(&gap, 10 - i))
            .collect();
        let (estimate, confidence) =
            self_estimate_from_spacing(&self_coord, &successors, &predecessors, 4).unwrap();
        assert!((estimate - n as f64).abs() / (n as f64) < 0.05, "got {estimate}");
        assert!(confidence > 0.5);
    }

    #[test]
    fn spacing_estimate_handles_lonely_node() {
        let c = coord_for_peer("alone");
        assert!(self_estimate_from_spacing(&c, &[], &[], 4).is_none());
    }
}
