//! # Wire Protocol Messages
//!
//! Serializable types for the five overlay protocols. Every request and
//! reply is exactly one UTF-8 JSON object; 32-byte binary fields ride as
//! base64url strings without padding, and every versioned message carries
//! `"v": 1`.
//!
//! | Protocol | Request | Reply |
//! |----------|---------|-------|
//! | ping | [`PingRequest`] | [`PingResponse`] |
//! | neighbors | [`NeighborsRequest`] | [`NeighborSnapshot`] |
//! | neighbors-announce | [`NeighborSnapshot`] | [`PingResponse`] |
//! | maybeAct | [`RouteAndMaybeAct`] | [`MaybeActReply`] |
//! | leave | [`LeaveNotice`] | [`PingResponse`] |
//!
//! Reply shapes are polymorphic on the maybeAct path: a [`MaybeActReply`]
//! is decoded by discriminator probing — `busy == true` first, then the
//! presence of `anchors`, else the opaque commit certificate.
//!
//! The `sig` / `signature` fields are reserved: always serialized as the
//! empty string, never read.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::SerializedPeerEntry;

/// Wire version carried by every message.
pub const WIRE_VERSION: u8 = 1;

/// Cap on successor ids in a snapshot.
pub const MAX_SNAPSHOT_SUCCESSORS: usize = 12;

/// Cap on predecessor ids in a snapshot.
pub const MAX_SNAPSHOT_PREDECESSORS: usize = 12;

/// Cap on sample entries in a snapshot.
pub const MAX_SNAPSHOT_SAMPLES: usize = 8;

/// Cap on an embedded activity payload (128 KiB), applied to the JSON
/// encoding of the `activity` field.
pub const MAX_ACTIVITY_BYTES: usize = 128 * 1024;

/// Ceiling on the TTL any message may carry.
pub const MAX_TTL: u32 = 16;

/// Cap on a sanitized replacement list from a leave notice.
pub const MAX_REPLACEMENTS: usize = 12;

fn wire_version() -> u8 {
    WIRE_VERSION
}

/// Liveness probe; also the carrier of the sender's size estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub from: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Reply to a ping, announce, or leave notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Request for the remote peer's current neighbor snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborsRequest {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub from: String,
    pub timestamp: u64,
}

/// One Digitree entry sampled into a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEntry {
    pub id: String,
    pub coord: String,
    pub relevance: f64,
}

/// A peer's view of its own ring neighborhood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub from: String,
    pub timestamp: u64,
    pub successors: Vec<String>,
    pub predecessors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<SampleEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// The routed message: locate the cohort for `key`, and when close enough,
/// deliver the activity payload to one of its anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAndMaybeAct {
    #[serde(default = "wire_version")]
    pub v: u8,
    /// base64url ring coordinate of the key.
    pub key: String,
    pub want_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wants: Option<u32>,
    pub ttl: u32,
    pub min_sigs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breadcrumbs: Option<Vec<String>>,
    pub correlation_id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl RouteAndMaybeAct {
    pub fn breadcrumb_list(&self) -> &[String] {
        self.breadcrumbs.as_deref().unwrap_or(&[])
    }

    /// Size of the embedded activity payload as it appears on the wire.
    pub fn activity_bytes(&self) -> usize {
        self.activity
            .as_ref()
            .and_then(|a| serde_json::to_vec(a).ok())
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

/// "You are close": the responder's view of the cohort for the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearAnchor {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub anchors: Vec<String>,
    pub cohort_hint: Vec<String>,
    pub estimated_cluster_size: u64,
    pub confidence: f64,
}

/// Graceful departure, optionally vouching for replacement peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveNotice {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacements: Option<Vec<String>>,
    pub timestamp: u64,
}

/// Backpressure reply. Clients must check `busy` before interpreting any
/// other reply field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyResponse {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub busy: bool,
    pub retry_after_ms: u64,
}

impl BusyResponse {
    pub fn with_retry_after(retry_after_ms: u64) -> Self {
        BusyResponse {
            v: WIRE_VERSION,
            busy: true,
            retry_after_ms,
        }
    }
}

/// Persisted warm-start document wrapping exported Digitree entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedTable {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub peer_id: String,
    pub timestamp: u64,
    pub entries: Vec<SerializedPeerEntry>,
}

/// The three shapes a maybeAct reply can take.
#[derive(Debug, Clone)]
pub enum MaybeActReply {
    Busy(BusyResponse),
    NearAnchor(NearAnchor),
    Commit(Value),
}

impl MaybeActReply {
    /// Decode by discriminator probing: busy flag first, then anchors,
    /// otherwise the value is an opaque commit certificate.
    pub fn from_value(value: Value) -> MaybeActReply {
        if value.get("busy").and_then(Value::as_bool) == Some(true) {
            let retry = value
                .get("retry_after_ms")
                .and_then(Value::as_u64)
                .unwrap_or(1_000);
            return MaybeActReply::Busy(BusyResponse::with_retry_after(retry));
        }
        if value.get("anchors").is_some() {
            if let Ok(anchor) = serde_json::from_value::<NearAnchor>(value.clone()) {
                return MaybeActReply::NearAnchor(anchor);
            }
        }
        MaybeActReply::Commit(value)
    }

    pub fn to_value(&self) -> Value {
        match self {
            MaybeActReply::Busy(b) => serde_json::to_value(b).unwrap_or(Value::Null),
            MaybeActReply::NearAnchor(n) => serde_json::to_value(n).unwrap_or(Value::Null),
            MaybeActReply::Commit(v) => v.clone(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, MaybeActReply::Busy(_))
    }
}

/// Encode one message as its wire JSON.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::coord_for_key;

    #[test]
    fn ping_round_trip() {
        let ping = PingRequest {
            v: WIRE_VERSION,
            from: "peer-a".into(),
            timestamp: 123,
            size_estimate: Some(50),
            confidence: Some(0.7),
        };
        let bytes = encode(&ping);
        let decoded: PingRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.from, "peer-a");
        assert_eq!(decoded.size_estimate, Some(50));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let decoded: PingRequest =
            serde_json::from_str(r#"{"from":"x","timestamp":9}"#).unwrap();
        assert_eq!(decoded.v, WIRE_VERSION);
        assert!(decoded.size_estimate.is_none());

        let snapshot: NeighborSnapshot = serde_json::from_str(
            r#"{"from":"x","timestamp":9,"successors":[],"predecessors":[]}"#,
        )
        .unwrap();
        assert!(snapshot.sample.is_none());
        assert!(snapshot.sig.is_empty());
    }

    #[test]
    fn route_message_carries_coordinate_as_base64url() {
        let key = coord_for_key("the-key");
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: key.to_base64url(),
            want_k: 3,
            wants: None,
            ttl: 8,
            min_sigs: 2,
            digest: None,
            activity: Some(serde_json::json!({"op": "sign"})),
            breadcrumbs: Some(vec!["a".into(), "b".into()]),
            correlation_id: "cid-1".into(),
            timestamp: 1,
            signature: String::new(),
        };
        let bytes = encode(&msg);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains('='), "base64url must be unpadded: {text}");
        let decoded: RouteAndMaybeAct = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.key, key.to_base64url());
        assert_eq!(decoded.breadcrumb_list(), ["a", "b"]);
        assert!(decoded.activity_bytes() > 0);
    }

    #[test]
    fn maybe_act_reply_dispatches_on_busy_first() {
        let busy = serde_json::json!({"v":1, "busy": true, "retry_after_ms": 250, "anchors": []});
        match MaybeActReply::from_value(busy) {
            MaybeActReply::Busy(b) => assert_eq!(b.retry_after_ms, 250),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn maybe_act_reply_detects_near_anchor() {
        let anchor = serde_json::json!({
            "v": 1,
            "anchors": ["p1", "p2"],
            "cohort_hint": ["p1"],
            "estimated_cluster_size": 3,
            "confidence": 0.4
        });
        match MaybeActReply::from_value(anchor) {
            MaybeActReply::NearAnchor(n) => assert_eq!(n.anchors.len(), 2),
            other => panic!("expected near anchor, got {other:?}"),
        }
    }

    #[test]
    fn unknown_reply_shape_is_an_opaque_commit() {
        let commit = serde_json::json!({"commitCertificate": {"sigs": 3}});
        match MaybeActReply::from_value(commit.clone()) {
            MaybeActReply::Commit(v) => assert_eq!(v, commit),
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn absent_options_are_omitted_from_the_wire() {
        let notice = LeaveNotice {
            v: WIRE_VERSION,
            from: "p".into(),
            replacements: None,
            timestamp: 0,
        };
        let text = String::from_utf8(encode(&notice)).unwrap();
        assert!(!text.contains("replacements"));
    }

    #[test]
    fn reserved_signature_fields_stay_empty() {
        let snapshot = NeighborSnapshot {
            v: WIRE_VERSION,
            from: "p".into(),
            timestamp: 0,
            successors: vec![],
            predecessors: vec![],
            sample: None,
            size_estimate: None,
            confidence: None,
            sig: String::new(),
            metadata: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&encode(&snapshot)).unwrap();
        assert_eq!(value["sig"], serde_json::json!(""));

        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: coord_for_key("k").to_base64url(),
            want_k: 1,
            wants: None,
            ttl: 1,
            min_sigs: 0,
            digest: None,
            activity: None,
            breadcrumbs: None,
            correlation_id: "c".into(),
            timestamp: 0,
            signature: String::new(),
        };
        let value: serde_json::Value = serde_json::from_slice(&encode(&msg)).unwrap();
        assert_eq!(value["signature"], serde_json::json!(""));
    }
}
