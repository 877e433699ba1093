//! # Relevance Model
//!
//! Keep-scores for Digitree entries.
//!
//! Relevance combines recency (touches), outcome history (success/failure
//! nudges), smoothed latency, and a sparsity bonus that favors peers in
//! underpopulated distance bands — the long-range fingers a ring overlay
//! needs for logarithmic routing. Scores are bounded on both sides so no
//! sequence of updates can overflow or drift a peer into an unrecoverable
//! hole.

use crate::ring::COORD_BITS;
use crate::store::PeerEntry;

/// Upper bound for any relevance score.
pub const MAX_RELEVANCE: f64 = 100.0;

/// Number of logarithmic distance bands tracked by the sparsity model.
pub const BAND_COUNT: usize = 32;

const TOUCH_NUDGE: f64 = 0.5;
const SUCCESS_NUDGE: f64 = 1.5;
const FAILURE_NUDGE: f64 = 2.0;

/// Smoothing for the per-entry RTT average.
const LATENCY_EMA_ALPHA: f64 = 0.3;

/// Smoothing for per-band observation frequency.
const DENSITY_EMA_ALPHA: f64 = 0.1;

const SPARSITY_SCALE: f64 = 0.5;

/// Per-band exponential moving average of observation frequency.
///
/// Each band covers 8 leading-zero bits of XOR distance. Bands that see few
/// interactions keep a low density and therefore grant a higher retention
/// bonus to the peers that do land in them.
#[derive(Debug, Clone)]
pub struct SparsityBands {
    density: [f64; BAND_COUNT],
}

impl Default for SparsityBands {
    fn default() -> Self {
        Self::new()
    }
}

impl SparsityBands {
    pub fn new() -> Self {
        SparsityBands {
            density: [0.0; BAND_COUNT],
        }
    }

    /// Band index for a normalized distance in [0, 1].
    fn band_for(x: f64) -> usize {
        let lz = ((1.0 - x.clamp(0.0, 1.0)) * COORD_BITS as f64) as usize;
        (lz * BAND_COUNT / COORD_BITS as usize).min(BAND_COUNT - 1)
    }

    /// Record one interaction at normalized distance `x`.
    pub fn observe(&mut self, x: f64) {
        let hit = Self::band_for(x);
        for (i, d) in self.density.iter_mut().enumerate() {
            if i == hit {
                *d = (1.0 - DENSITY_EMA_ALPHA) * *d + DENSITY_EMA_ALPHA;
            } else {
                *d *= 1.0 - DENSITY_EMA_ALPHA / BAND_COUNT as f64;
            }
        }
    }

    /// Retention bonus at normalized distance `x`, inversely proportional
    /// to the band's observed density.
    pub fn bonus(&self, x: f64) -> f64 {
        let d = self.density[Self::band_for(x)];
        SPARSITY_SCALE / (1.0 + d)
    }
}

fn clamp_relevance(r: f64) -> f64 {
    r.clamp(0.0, MAX_RELEVANCE)
}

/// Positive interaction without an RTT sample.
pub fn touch(entry: &mut PeerEntry, x: f64, bands: &mut SparsityBands, now_ms: u64) {
    entry.access_count += 1;
    entry.last_access = now_ms;
    bands.observe(x);
    entry.relevance = clamp_relevance(entry.relevance + TOUCH_NUDGE + bands.bonus(x));
}

/// Successful round trip: smooth the RTT, bump the score. Faster peers earn
/// a proportionally larger bump.
pub fn record_success(
    entry: &mut PeerEntry,
    latency_ms: f64,
    x: f64,
    bands: &mut SparsityBands,
    now_ms: u64,
) {
    entry.success_count += 1;
    entry.last_access = now_ms;
    if entry.avg_latency_ms == 0.0 {
        entry.avg_latency_ms = latency_ms;
    } else {
        entry.avg_latency_ms =
            (1.0 - LATENCY_EMA_ALPHA) * entry.avg_latency_ms + LATENCY_EMA_ALPHA * latency_ms;
    }
    bands.observe(x);
    let speed = 1.0 + (200.0 - entry.avg_latency_ms.min(200.0)) / 200.0;
    entry.relevance = clamp_relevance(entry.relevance + SUCCESS_NUDGE * speed + bands.bonus(x));
}

/// Failed interaction. The nudge scales with the peer's success ratio: a
/// failure on a historically reliable peer is the most informative signal
/// and corrects hardest. The floor keeps chronically bad peers decaying.
pub fn record_failure(entry: &mut PeerEntry, _x: f64) {
    entry.failure_count += 1;
    let attempts = entry.success_count + entry.failure_count;
    let ratio = if attempts == 0 {
        0.0
    } else {
        entry.success_count as f64 / attempts as f64
    };
    entry.relevance = clamp_relevance(entry.relevance - FAILURE_NUDGE * ratio.max(0.25));
}

/// Link quality in [0, 1] for the next-hop cost function: success ratio
/// scaled by smoothed latency. Peers with no history sit at 0.5.
pub fn link_quality(entry: &PeerEntry) -> f64 {
    let attempts = entry.success_count + entry.failure_count;
    if attempts == 0 {
        return 0.5;
    }
    let ratio = entry.success_count as f64 / attempts as f64;
    let latency_factor = if entry.avg_latency_ms <= 200.0 {
        1.0
    } else {
        (1.0 - 0.75 * (entry.avg_latency_ms - 200.0) / 1800.0).max(0.25)
    };
    (ratio * latency_factor).clamp(0.0, 1.0)
}
