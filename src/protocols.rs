//! Host-runtime seam and protocol identifiers.
//!
//! The overlay core never opens a socket. It consumes four capabilities
//! from the host runtime — send one framed request and read one framed
//! reply, register a handler for a named protocol, observe peer
//! connect/disconnect events, and rely on stable peer identifiers — all
//! expressed here as traits so the same core runs over a production
//! transport, the in-process test mesh, or nothing at all (the simulator
//! drives the data structures directly).
//!
//! ## Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`HostRuntime`] | request/response transport + liveness events |
//! | [`InboundStream`] | chunked body of one inbound request |
//! | [`ActivityHandler`] | application callback invoked in-cluster |

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Ring overlay wire version, part of every protocol identifier.
pub const PROTOCOL_VERSION: &str = "1";

/// The five overlay protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    Ping,
    Neighbors,
    NeighborsAnnounce,
    MaybeAct,
    Leave,
}

impl RpcKind {
    pub const ALL: [RpcKind; 5] = [
        RpcKind::Ping,
        RpcKind::Neighbors,
        RpcKind::NeighborsAnnounce,
        RpcKind::MaybeAct,
        RpcKind::Leave,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RpcKind::Ping => "ping",
            RpcKind::Neighbors => "neighbors",
            RpcKind::NeighborsAnnounce => "neighbors-announce",
            RpcKind::MaybeAct => "maybeAct",
            RpcKind::Leave => "leave",
        }
    }

    /// Full protocol identifier, namespaced so unrelated rings never
    /// cross-talk: `/fret/<network>/<version>/<name>`.
    pub fn protocol_id(&self, network: &str) -> String {
        format!("/fret/{network}/{PROTOCOL_VERSION}/{}", self.name())
    }
}

/// Resource profile of a node. Core nodes accept larger payloads and more
/// concurrent work; edge nodes run tighter bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Edge,
    Core,
}

impl Profile {
    /// Per-protocol inbound byte cap, enforced before decoding.
    pub fn max_request_bytes(&self, kind: RpcKind) -> usize {
        match (kind, self) {
            (RpcKind::Ping, _) => 1024,
            (RpcKind::Neighbors, Profile::Edge) => 65_536,
            (RpcKind::Neighbors, Profile::Core) => 131_072,
            (RpcKind::NeighborsAnnounce, Profile::Edge) => 65_536,
            (RpcKind::NeighborsAnnounce, Profile::Core) => 131_072,
            (RpcKind::MaybeAct, Profile::Edge) => 262_144,
            (RpcKind::MaybeAct, Profile::Core) => 524_288,
            (RpcKind::Leave, _) => 4_096,
        }
    }

    /// Concurrent maybeAct requests served at once.
    pub fn inflight_act_cap(&self) -> usize {
        match self {
            Profile::Edge => 4,
            Profile::Core => 16,
        }
    }

    /// Leave-notice recipients beyond the S/P neighborhood.
    pub fn leave_fanout_beyond_neighbors(&self) -> usize {
        match self {
            Profile::Edge => 2,
            Profile::Core => 4,
        }
    }
}

/// Liveness notification from the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(String),
    Disconnected(String),
}

/// Chunked body of one inbound request. `Ok(None)` is end-of-message; the
/// envelope additionally treats a long idle gap as end-of-message because
/// some stream multiplexers never surface remote-close as EOF.
#[async_trait]
pub trait InboundStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// One inbound request as delivered by the host runtime.
pub struct InboundRequest {
    pub peer_id: String,
    pub stream: Box<dyn InboundStream>,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;

/// Handler registered for a named protocol. Returns the framed reply body;
/// the host closes the stream after writing it.
pub type InboundHandler = Arc<dyn Fn(InboundRequest) -> HandlerFuture + Send + Sync>;

/// The transport capabilities the overlay core consumes.
#[async_trait]
pub trait HostRuntime: Send + Sync + 'static {
    /// Send one framed request to a known peer on a named protocol and read
    /// one framed reply.
    async fn request(&self, peer_id: &str, protocol: &str, body: Vec<u8>) -> Result<Vec<u8>>;

    /// Register the handler for a named protocol.
    async fn register_handler(&self, protocol: &str, handler: InboundHandler) -> Result<()>;

    /// Whether a live connection to the peer currently exists.
    fn is_connected(&self, peer_id: &str) -> bool;

    /// Whether the host knows how to dial the peer even without a live
    /// connection.
    fn has_dial_info(&self, peer_id: &str) -> bool;

    /// Subscribe to connect/disconnect notifications.
    async fn peer_events(&self) -> mpsc::Receiver<PeerEvent>;
}

/// Application callback invoked when this node is in the cohort responsible
/// for a routed key and the message carried an activity payload. The return
/// value is the opaque commit certificate forwarded to the requester.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn apply(
        &self,
        activity: serde_json::Value,
        cohort: Vec<String>,
        min_sigs: u32,
        correlation_id: &str,
    ) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_ids_are_namespaced_by_network() {
        let a = RpcKind::MaybeAct.protocol_id("mainnet");
        let b = RpcKind::MaybeAct.protocol_id("testnet");
        assert_eq!(a, "/fret/mainnet/1/maybeAct");
        assert_ne!(a, b);
    }

    #[test]
    fn core_profile_accepts_larger_payloads() {
        for kind in RpcKind::ALL {
            assert!(
                Profile::Core.max_request_bytes(kind) >= Profile::Edge.max_request_bytes(kind)
            );
        }
        assert_eq!(Profile::Edge.max_request_bytes(RpcKind::Ping), 1024);
        assert_eq!(Profile::Core.max_request_bytes(RpcKind::MaybeAct), 524_288);
    }

    #[test]
    fn profile_bounds_concurrency_and_fanout() {
        assert_eq!(Profile::Core.inflight_act_cap(), 16);
        assert_eq!(Profile::Edge.inflight_act_cap(), 4);
        assert!(
            Profile::Core.leave_fanout_beyond_neighbors()
                > Profile::Edge.leave_fanout_beyond_neighbors()
        );
    }
}
