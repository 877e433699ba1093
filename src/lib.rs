//! # FRET - Finger Ring Ensemble Topology
//!
//! A Chord-style structured-overlay service: peer discovery, logarithmic
//! routing toward 256-bit ring coordinates, cohort assembly, and
//! network-size estimation for a peer-to-peer runtime.
//!
//! Each node keeps a bounded, relevance-scored cache of known peers (the
//! **Digitree**) plus symmetric successor/predecessor sets around its own
//! ring position. On top of that table runs a unified route-and-maybe-act
//! pipeline: locate the cohort responsible for a key and, once close
//! enough, deliver an opaque activity payload to one of its anchors.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for the service core:
//! [`FretNode`] is a cheap-clone public handle, the private actor owns all
//! mutable state and processes commands sequentially. The transport is not
//! part of this crate — the core consumes a [`HostRuntime`]: send one
//! framed request and read one framed reply, register per-protocol
//! handlers, and observe peer connect/disconnect events. Peer identifiers
//! hash onto the ring, so coordinates are always derivable and never
//! trusted off the wire.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ring` | 256-bit coordinates, XOR/ring distance, base64url codec |
//! | `store` | Digitree ordered peer store with protected eviction |
//! | `relevance` | keep-scores: recency, outcomes, latency, sparsity |
//! | `estimator` | weighted network-size, churn, partition detection |
//! | `rpc` | envelope: bounded read, timestamps, buckets, dedup |
//! | `routing` | near-radius heuristic and dual-mode hop selection |
//! | `messages` | JSON wire types for the five overlay protocols |
//! | `protocols` | host-runtime traits and protocol identifiers |
//! | `service` | stabilization state machine and graceful leave |
//! | `route` | handleMaybeAct / routeAct / iterative lookup |
//! | `sim` | deterministic simulation harness for property tests |
//!
//! ## Resource bounds
//!
//! Every inbound path is bounded before it allocates: per-protocol byte
//! caps, per-handler token buckets, a capped in-flight counter, a bounded
//! dedup cache, and a capacity-limited peer store whose eviction never
//! removes the S/P neighborhood around self.

pub mod estimator;
pub mod messages;
pub mod protocols;
pub mod relevance;
pub mod ring;
pub mod route;
pub mod routing;
pub mod rpc;
pub mod service;
pub mod sim;
pub mod store;

pub use messages::{
    BusyResponse, ExportedTable, LeaveNotice, MaybeActReply, NearAnchor, NeighborSnapshot,
    PingRequest, PingResponse, RouteAndMaybeAct,
};
pub use protocols::{
    ActivityHandler, HostRuntime, InboundHandler, InboundRequest, InboundStream, PeerEvent,
    Profile, RpcKind,
};
pub use ring::{coord_for_key, coord_for_peer, Coord};
pub use route::{LookupOptions, RouteProgress, RouteProgressKind};
pub use service::{Diagnostics, FretConfig, FretNode, ServiceEvent, ServiceMode};
pub use sim::{SimConfig, SimEvent, Simulation};
pub use store::{Digitree, PeerEntry, PeerState, SerializedPeerEntry};
