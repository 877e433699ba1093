//! # Ring Arithmetic
//!
//! 256-bit ring coordinates and the distance metrics built on them.
//!
//! A [`Coord`] is a 32-byte big-endian unsigned integer modulo 2^256. Peers
//! and keys map onto the ring through a blake3 digest of their identifier,
//! so a coordinate is always derivable from an id and never needs to be
//! trusted off the wire.
//!
//! Two distances are in play:
//!
//! - **XOR distance** with lexicographic compare, used by the next-hop
//!   selector and the near-radius test.
//! - **Clockwise ring distance** (`sub_mod`), used by successor-oriented
//!   walks and the simulation harness.
//!
//! The bit-level [`normalized_log_distance`] collapses XOR distance into
//! [0, 1] for the relevance model and the selector's cost function.

use serde::{Deserialize, Serialize};

/// Number of bits in a ring coordinate.
pub const COORD_BITS: u32 = 256;

/// A position on the 2^256 ring.
///
/// Ordering is lexicographic on the big-endian bytes, which coincides with
/// numeric order. Ties between distinct peers at the same coordinate are
/// broken by id at the store layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord(#[serde(with = "b64")] pub [u8; 32]);

impl Coord {
    /// The additive identity (position zero).
    pub const ZERO: Coord = Coord([0u8; 32]);

    /// The largest representable coordinate, 2^256 - 1.
    pub const MAX: Coord = Coord([0xff; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Coord(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Byte-wise XOR distance to another coordinate.
    pub fn xor_distance(&self, other: &Coord) -> Coord {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        Coord(out)
    }

    /// Count of leading zero bits, scanning from the most significant byte.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Encode as base64url without padding (the wire form of coordinates).
    pub fn to_base64url(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Decode the wire form. Rejects anything that is not exactly 32 bytes.
    pub fn from_base64url(s: &str) -> Option<Coord> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Coord(arr))
    }

    /// Approximate the coordinate as an f64 magnitude.
    ///
    /// Exact for the top 52 bits, which is all the payload heuristic needs.
    pub fn to_f64(&self) -> f64 {
        let mut value = 0f64;
        for byte in self.0 {
            value = value * 256.0 + byte as f64;
        }
        value
    }
}

impl std::fmt::Debug for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Coord({}..)", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

/// serde adapter carrying a 32-byte field as base64url without padding.
pub(crate) mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("coordinate must be exactly 32 bytes"))
    }
}

/// Map a peer identifier onto the ring.
pub fn coord_for_peer(id: &str) -> Coord {
    Coord(*blake3::hash(id.as_bytes()).as_bytes())
}

/// Map an application key onto the ring. Same digest as peers so keys and
/// peers share one coordinate space.
pub fn coord_for_key(key: &str) -> Coord {
    Coord(*blake3::hash(key.as_bytes()).as_bytes())
}

/// Fine-grained distance in [0, 1]: `1 - leading_zero_bits(xor) / 256`.
///
/// 0.0 means identical position; 1.0 means the first bit already differs.
pub fn normalized_log_distance(a: &Coord, b: &Coord) -> f64 {
    let lz = a.xor_distance(b).leading_zero_bits();
    (1.0 - lz as f64 / COORD_BITS as f64).clamp(0.0, 1.0)
}

/// Floor of 2^256 / n, saturating to 2^256 - 1 for n <= 1.
///
/// This is the ideal inter-peer gap for a network of n evenly spread peers;
/// the near-radius computation and the simulator both build on it.
pub fn ring_span_div(n: u64) -> Coord {
    if n <= 1 {
        return Coord::MAX;
    }
    // Long division of the 33-byte value 2^256 by n. The leading quotient
    // digit is always zero for n >= 2, leaving a 32-byte result.
    let mut quotient = [0u8; 33];
    let mut rem: u128 = 0;
    for (i, q) in quotient.iter_mut().enumerate() {
        let digit: u128 = if i == 0 { 1 } else { 0 };
        let acc = rem * 256 + digit;
        *q = (acc / n as u128) as u8;
        rem = acc % n as u128;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&quotient[1..]);
    Coord(out)
}

/// Multiply a coordinate by a small scalar, saturating at 2^256 - 1.
pub fn saturating_mul_small(c: &Coord, factor: u64) -> Coord {
    let mut out = [0u8; 32];
    let mut carry: u128 = 0;
    for i in (0..32).rev() {
        let acc = c.0[i] as u128 * factor as u128 + carry;
        out[i] = (acc & 0xff) as u8;
        carry = acc >> 8;
    }
    if carry > 0 {
        return Coord::MAX;
    }
    Coord(out)
}

/// Clockwise ring distance: `(a - b) mod 2^256`.
///
/// Zero means the coordinates coincide; small values mean `a` sits just
/// after `b` in successor direction.
pub fn sub_mod(a: &Coord, b: &Coord) -> Coord {
    let mut out = [0u8; 32];
    let mut borrow: i16 = 0;
    for i in (0..32).rev() {
        let diff = a.0[i] as i16 - b.0[i] as i16 - borrow;
        if diff < 0 {
            out[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[i] = diff as u8;
            borrow = 0;
        }
    }
    Coord(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(first: u8) -> Coord {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Coord(bytes)
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = coord_for_peer("alpha");
        let b = coord_for_peer("beta");
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert!(a.xor_distance(&a).is_zero());
    }

    #[test]
    fn lexicographic_order_matches_numeric_order() {
        assert!(coord(0x01) < coord(0x02));
        assert!(Coord::ZERO < Coord::MAX);
        let mut low = [0u8; 32];
        low[31] = 0xff;
        assert!(Coord(low) < coord(0x01));
    }

    #[test]
    fn normalized_distance_endpoints() {
        let a = coord_for_peer("x");
        assert_eq!(normalized_log_distance(&a, &a), 0.0);

        let top = coord(0x80);
        assert_eq!(normalized_log_distance(&Coord::ZERO, &top), 1.0);

        let mut close = a.0;
        close[31] ^= 0x01;
        let d = normalized_log_distance(&a, &Coord(close));
        assert!((d - 1.0 / 256.0).abs() < 1e-9);
    }

    #[test]
    fn base64url_round_trip() {
        let c = coord_for_peer("round-trip");
        let encoded = c.to_base64url();
        assert!(!encoded.contains('='));
        assert_eq!(Coord::from_base64url(&encoded), Some(c));
        assert_eq!(Coord::from_base64url("too-short"), None);
    }

    #[test]
    fn span_div_halves_the_ring() {
        let half = ring_span_div(2);
        assert_eq!(half, coord(0x80));
        let quarter = ring_span_div(4);
        assert_eq!(quarter, coord(0x40));
        assert_eq!(ring_span_div(0), Coord::MAX);
        assert_eq!(ring_span_div(1), Coord::MAX);
    }

    #[test]
    fn span_div_times_n_covers_the_ring() {
        for n in [3u64, 7, 50, 1000] {
            let gap = ring_span_div(n);
            let covered = saturating_mul_small(&gap, n);
            // floor division loses at most n-1 units of ring space
            let remainder = sub_mod(&Coord::MAX, &covered);
            assert!(remainder.to_f64() < n as f64 + 1.0, "n={n}");
        }
    }

    #[test]
    fn saturating_mul_caps_at_ring_max() {
        assert_eq!(saturating_mul_small(&coord(0x80), 2), Coord::MAX);
        assert_eq!(saturating_mul_small(&coord(0x40), 2), coord(0x80));
        assert_eq!(saturating_mul_small(&Coord::ZERO, 1000), Coord::ZERO);
    }

    #[test]
    fn sub_mod_wraps_below_zero() {
        let one = {
            let mut b = [0u8; 32];
            b[31] = 1;
            Coord(b)
        };
        assert_eq!(sub_mod(&one, &Coord::ZERO), one);
        // 0 - 1 wraps to 2^256 - 1
        assert_eq!(sub_mod(&Coord::ZERO, &one), Coord::MAX);
        assert!(sub_mod(&one, &one).is_zero());
    }

    #[test]
    fn coord_to_f64_tracks_magnitude() {
        assert_eq!(Coord::ZERO.to_f64(), 0.0);
        let half = coord(0x80);
        let ratio = half.to_f64() / Coord::MAX.to_f64();
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn peer_and_key_coords_are_stable() {
        assert_eq!(coord_for_peer("peer-1"), coord_for_peer("peer-1"));
        assert_ne!(coord_for_peer("peer-1"), coord_for_peer("peer-2"));
        assert_eq!(coord_for_key("k"), coord_for_key("k"));
    }
}
