#![allow(dead_code)] // shared by several test binaries, none uses all of it

//! In-process mesh implementing `HostRuntime` for integration tests.
//!
//! Every node registers its protocol handlers against a shared
//! [`MemoryMesh`]; requests are dispatched as direct handler invocations,
//! so a multi-node overlay runs entirely inside one test process with no
//! sockets involved.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use fret::{HostRuntime, InboundHandler, InboundRequest, InboundStream, PeerEvent};

/// One inbound body delivered as a short sequence of chunks.
pub struct VecStream {
    chunks: VecDeque<Vec<u8>>,
}

impl VecStream {
    pub fn new(body: Vec<u8>) -> Self {
        let mut chunks = VecDeque::new();
        if !body.is_empty() {
            chunks.push_back(body);
        }
        VecStream { chunks }
    }

    pub fn chunked(body: &[u8], chunk_size: usize) -> Self {
        let chunks = body
            .chunks(chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        VecStream { chunks }
    }
}

#[async_trait]
impl InboundStream for VecStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.chunks.pop_front())
    }
}

#[derive(Default)]
struct MeshInner {
    handlers: HashMap<(String, String), InboundHandler>,
    adjacency: HashMap<String, HashSet<String>>,
    event_taps: HashMap<String, Vec<mpsc::Sender<PeerEvent>>>,
}

/// Shared in-process transport fabric.
#[derive(Default)]
pub struct MemoryMesh {
    inner: Mutex<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryMesh::default())
    }

    /// A host bound to one peer id on this mesh.
    pub fn host(self: &Arc<Self>, peer_id: &str) -> Arc<MemoryHost> {
        Arc::new(MemoryHost {
            mesh: self.clone(),
            self_id: peer_id.to_string(),
        })
    }

    /// Mark two peers connected and notify both sides.
    pub async fn connect(&self, a: &str, b: &str) {
        let taps = {
            let mut inner = self.inner.lock().expect("mesh lock");
            inner
                .adjacency
                .entry(a.to_string())
                .or_default()
                .insert(b.to_string());
            inner
                .adjacency
                .entry(b.to_string())
                .or_default()
                .insert(a.to_string());
            let mut taps = Vec::new();
            for (peer, other) in [(a, b), (b, a)] {
                for tap in inner.event_taps.get(peer).into_iter().flatten() {
                    taps.push((tap.clone(), PeerEvent::Connected(other.to_string())));
                }
            }
            taps
        };
        for (tap, event) in taps {
            let _ = tap.send(event).await;
        }
    }

    pub async fn disconnect(&self, a: &str, b: &str) {
        let taps = {
            let mut inner = self.inner.lock().expect("mesh lock");
            if let Some(set) = inner.adjacency.get_mut(a) {
                set.remove(b);
            }
            if let Some(set) = inner.adjacency.get_mut(b) {
                set.remove(a);
            }
            let mut taps = Vec::new();
            for (peer, other) in [(a, b), (b, a)] {
                for tap in inner.event_taps.get(peer).into_iter().flatten() {
                    taps.push((tap.clone(), PeerEvent::Disconnected(other.to_string())));
                }
            }
            taps
        };
        for (tap, event) in taps {
            let _ = tap.send(event).await;
        }
    }

    fn handler_for(&self, peer: &str, protocol: &str) -> Option<InboundHandler> {
        let inner = self.inner.lock().expect("mesh lock");
        inner
            .handlers
            .get(&(peer.to_string(), protocol.to_string()))
            .cloned()
    }

    fn knows_peer(&self, peer: &str) -> bool {
        let inner = self.inner.lock().expect("mesh lock");
        inner.handlers.keys().any(|(p, _)| p == peer)
    }

    fn are_connected(&self, a: &str, b: &str) -> bool {
        let inner = self.inner.lock().expect("mesh lock");
        inner
            .adjacency
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }
}

/// One peer's view of the mesh.
pub struct MemoryHost {
    mesh: Arc<MemoryMesh>,
    self_id: String,
}

impl MemoryHost {
    pub fn self_id(&self) -> &str {
        &self.self_id
    }
}

#[async_trait]
impl HostRuntime for MemoryHost {
    async fn request(&self, peer_id: &str, protocol: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let handler = self
            .mesh
            .handler_for(peer_id, protocol)
            .ok_or_else(|| anyhow!("no handler for {peer_id} on {protocol}"))?;
        let request = InboundRequest {
            peer_id: self.self_id.clone(),
            stream: Box::new(VecStream::new(body)),
        };
        let reply = handler(request).await;
        if reply.is_empty() {
            return Err(anyhow!("stream aborted by {peer_id}"));
        }
        Ok(reply)
    }

    async fn register_handler(&self, protocol: &str, handler: InboundHandler) -> Result<()> {
        let mut inner = self.mesh.inner.lock().expect("mesh lock");
        inner
            .handlers
            .insert((self.self_id.clone(), protocol.to_string()), handler);
        Ok(())
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.mesh.are_connected(&self.self_id, peer_id)
    }

    fn has_dial_info(&self, peer_id: &str) -> bool {
        self.mesh.knows_peer(peer_id)
    }

    async fn peer_events(&self) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.mesh.inner.lock().expect("mesh lock");
        inner
            .event_taps
            .entry(self.self_id.clone())
            .or_default()
            .push(tx);
        rx
    }
}
