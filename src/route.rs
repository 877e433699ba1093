//! # Route Pipeline
//!
//! The unified route-and-maybe-act path.
//!
//! Server side, [`FretNode::handle_maybe_act`] admits one message through
//! the pipeline — breadcrumb loop check, correlation-id dedup, timestamp
//! window, TTL, payload cap, token bucket, in-flight cap — and then
//! [`FretNode::route_act`] either lands it (self anchors the cohort and the
//! activity callback runs) or forwards it one hop with a decremented TTL
//! and self appended to the breadcrumbs. Every failure path degrades to a
//! NearAnchor carrying the local cohort, so a caller always learns who to
//! try next.
//!
//! Client side, [`FretNode::iterative_lookup`] drives the same protocol as
//! a lazy stream of [`RouteProgress`] events: probe, forward, collect
//! anchors, push the activity payload once close enough, finish with
//! `complete` or `exhausted`. Dropping the receiver cancels the lookup at
//! its next send.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::{
    encode, BusyResponse, MaybeActReply, NearAnchor, RouteAndMaybeAct, WIRE_VERSION,
};
use crate::protocols::{HostRuntime, RpcKind};
use crate::ring::{coord_for_key, coord_for_peer, Coord};
use crate::routing::{should_include_payload, DEFAULT_BETA, PAYLOAD_THRESHOLD};
use crate::rpc::{decode_bounded, now_ms, RejectKind};
use crate::service::{ActAdmission, FretNode, RoutePlan, Stat};
use crate::store::abbrev;

/// Options for a client-side lookup.
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub want_k: u32,
    pub ttl: u32,
    pub min_sigs: u32,
    pub activity: Option<Value>,
    pub digest: Option<String>,
}

impl Default for LookupOptions {
    fn default() -> Self {
        LookupOptions {
            want_k: 3,
            ttl: 8,
            min_sigs: 1,
            activity: None,
            digest: None,
        }
    }
}

/// Kind of one lookup progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteProgressKind {
    Probing,
    Forwarding,
    NearAnchor,
    ActivitySent,
    Complete,
    Exhausted,
}

/// One step of an iterative lookup.
#[derive(Debug, Clone)]
pub struct RouteProgress {
    pub kind: RouteProgressKind,
    pub hop: u32,
    pub peer_id: Option<String>,
    pub near_anchor: Option<NearAnchor>,
    pub result: Option<Value>,
    pub ttl_remaining: Option<u32>,
}

impl RouteProgress {
    fn event(kind: RouteProgressKind, hop: u32) -> Self {
        RouteProgress {
            kind,
            hop,
            peer_id: None,
            near_anchor: None,
            result: None,
            ttl_remaining: None,
        }
    }
}

fn near_anchor_from_plan(plan: &RoutePlan) -> MaybeActReply {
    MaybeActReply::NearAnchor(NearAnchor {
        v: WIRE_VERSION,
        anchors: plan.cohort.clone(),
        cohort_hint: plan.cohort.clone(),
        estimated_cluster_size: plan.cohort.len() as u64,
        confidence: plan.estimate.confidence,
    })
}

fn fresh_correlation_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

impl<H: HostRuntime> FretNode<H> {
    /// Server entry point for one maybeAct message.
    pub async fn handle_maybe_act(&self, message: RouteAndMaybeAct) -> MaybeActReply {
        let Some(target) = Coord::from_base64url(&message.key) else {
            self.count_reject(RejectKind::MalformedMessage).await;
            let plan = self.route_plan(self.self_coord(), 1, Vec::new()).await;
            return near_anchor_from_plan(&plan);
        };
        let want_k = message.want_k.max(1) as usize;

        // a message that already visited us is never forwarded again
        if message
            .breadcrumb_list()
            .iter()
            .any(|id| id == self.self_id())
        {
            trace!(
                correlation = %message.correlation_id,
                "breadcrumb loop detected"
            );
            let plan = self.route_plan(target, want_k, Vec::new()).await;
            return near_anchor_from_plan(&plan);
        }

        let admission = self
            .admit_act(
                &message.correlation_id,
                message.timestamp,
                message.ttl,
                message.activity_bytes(),
            )
            .await;
        match admission {
            ActAdmission::Cached(reply) => reply,
            ActAdmission::Busy { retry_after_ms } => {
                MaybeActReply::Busy(BusyResponse::with_retry_after(retry_after_ms))
            }
            ActAdmission::Stale | ActAdmission::TtlExpired | ActAdmission::PayloadTooLarge => {
                let plan = self.route_plan(target, want_k, Vec::new()).await;
                near_anchor_from_plan(&plan)
            }
            ActAdmission::Proceed => {
                let correlation_id = message.correlation_id.clone();
                let reply = self.route_act(message).await;
                self.finish_act(&correlation_id, reply.clone()).await;
                reply
            }
        }
    }

    /// Land the message in-cluster or forward it one hop.
    pub async fn route_act(&self, message: RouteAndMaybeAct) -> MaybeActReply {
        let Some(target) = Coord::from_base64url(&message.key) else {
            let plan = self.route_plan(self.self_coord(), 1, Vec::new()).await;
            return near_anchor_from_plan(&plan);
        };
        let want_k = message.want_k.max(1) as usize;

        let mut exclude: Vec<String> = message.breadcrumb_list().to_vec();
        exclude.push(self.self_id().to_string());
        let plan = self.route_plan(target, want_k, exclude).await;

        // self at index 0 or 1 of the cohort means we are in-cluster
        if matches!(plan.self_index, Some(0) | Some(1)) {
            if let Some(activity) = message.activity.clone() {
                if let Some(handler) = self.activity_handler() {
                    self.bump(Stat::ActivityInvoked).await;
                    match handler
                        .apply(
                            activity,
                            plan.cohort.clone(),
                            message.min_sigs,
                            &message.correlation_id,
                        )
                        .await
                    {
                        Ok(certificate) => return MaybeActReply::Commit(certificate),
                        Err(e) => {
                            warn!(
                                correlation = %message.correlation_id,
                                error = %e,
                                "activity handler failed"
                            );
                            return near_anchor_from_plan(&plan);
                        }
                    }
                }
            }
            // in-cluster without a payload invites a resend to an anchor
            return near_anchor_from_plan(&plan);
        }

        if message.ttl > 0 {
            if let Some(next) = plan.next_hop.clone() {
                let mut forwarded = message.clone();
                forwarded.ttl = message.ttl.min(self.config().max_ttl) - 1;
                let mut crumbs = message.breadcrumb_list().to_vec();
                crumbs.push(self.self_id().to_string());
                forwarded.breadcrumbs = Some(crumbs);

                match self.send_maybe_act(&next, &forwarded).await {
                    Ok(reply) if reply.is_busy() => {
                        self.backoff_failure(&next).await;
                    }
                    Ok(reply) => {
                        self.backoff_clear(&next).await;
                        self.bump(Stat::RouteForwarded).await;
                        return reply;
                    }
                    Err(e) => {
                        debug!(peer = %abbrev(&next), error = %e, "forward failed");
                        self.backoff_failure(&next).await;
                        self.record_peer_failure(&next).await;
                    }
                }
            }
        }

        near_anchor_from_plan(&plan)
    }

    /// Send one maybeAct message and decode the polymorphic reply.
    pub(crate) async fn send_maybe_act(
        &self,
        peer: &str,
        message: &RouteAndMaybeAct,
    ) -> Result<MaybeActReply> {
        let protocol = RpcKind::MaybeAct.protocol_id(&self.config().network_name);
        let started = Instant::now();
        let bytes = self.host().request(peer, &protocol, encode(message)).await?;
        let value: Value = decode_bounded(
            &bytes,
            self.config().profile.max_request_bytes(RpcKind::MaybeAct),
        )
        .map_err(|e| anyhow::anyhow!("maybeAct reply: {e}"))?;
        let reply = MaybeActReply::from_value(value);
        if !reply.is_busy() {
            let rtt = started.elapsed().as_secs_f64() * 1000.0;
            self.record_peer_success(peer, rtt).await;
        }
        Ok(reply)
    }

    /// Client-side lookup as an ordered stream of progress events.
    ///
    /// Performs at most `ttl + 2` attempts; each attempt re-reads the size
    /// estimate, decides payload inclusion, and targets either the best
    /// known anchor or a fresh local cohort member. The stream always ends
    /// with `Complete` or `Exhausted`.
    pub fn iterative_lookup(&self, key: &str, options: LookupOptions) -> mpsc::Receiver<RouteProgress> {
        let (tx, rx) = mpsc::channel(16);
        let node = self.clone();
        let target = coord_for_key(key);
        tokio::spawn(async move {
            node.run_lookup(target, options, tx).await;
        });
        rx
    }

    async fn run_lookup(
        &self,
        target: Coord,
        options: LookupOptions,
        tx: mpsc::Sender<RouteProgress>,
    ) {
        let want_k = options.want_k.max(1);
        let max_attempts = options.ttl + 2;
        let mut best_anchors: Vec<String> = Vec::new();
        let mut skip: HashSet<String> = HashSet::new();
        skip.insert(self.self_id().to_string());

        macro_rules! emit {
            ($progress:expr) => {
                if tx.send($progress).await.is_err() {
                    // consumer dropped: cancelled
                    return;
                }
            };
        }

        for attempt in 1..=max_attempts {
            if self.is_stopped() {
                break;
            }
            emit!(RouteProgress {
                ttl_remaining: Some(options.ttl),
                ..RouteProgress::event(RouteProgressKind::Probing, attempt)
            });

            let estimate = self.network_size_estimate().await;

            let candidate = match best_anchors.iter().find(|id| !skip.contains(*id)).cloned() {
                Some(anchor) => Some(anchor),
                None => {
                    let plan = self
                        .route_plan(target, want_k as usize, skip.iter().cloned().collect())
                        .await;
                    plan.next_hop.or_else(|| {
                        plan.cohort
                            .into_iter()
                            .find(|id| !skip.contains(id))
                    })
                }
            };
            let Some(peer) = candidate else {
                break;
            };

            let dist = coord_for_peer(&peer).xor_distance(&target);
            let include_payload = options.activity.is_some()
                && should_include_payload(
                    &dist,
                    estimate.estimate as f64,
                    estimate.confidence,
                    want_k as usize,
                    DEFAULT_BETA,
                    PAYLOAD_THRESHOLD,
                );

            let message = RouteAndMaybeAct {
                v: WIRE_VERSION,
                key: target.to_base64url(),
                want_k,
                wants: None,
                ttl: options.ttl.min(self.config().max_ttl),
                min_sigs: options.min_sigs,
                digest: options.digest.clone(),
                activity: if include_payload {
                    options.activity.clone()
                } else {
                    None
                },
                breadcrumbs: Some(vec![self.self_id().to_string()]),
                correlation_id: fresh_correlation_id(),
                timestamp: now_ms(),
                signature: String::new(),
            };

            emit!(RouteProgress {
                peer_id: Some(peer.clone()),
                ttl_remaining: Some(message.ttl),
                ..RouteProgress::event(
                    if include_payload {
                        RouteProgressKind::ActivitySent
                    } else {
                        RouteProgressKind::Forwarding
                    },
                    attempt,
                )
            });

            match self.send_maybe_act(&peer, &message).await {
                Ok(MaybeActReply::Busy(busy)) => {
                    trace!(peer = %abbrev(&peer), retry_ms = busy.retry_after_ms, "peer busy");
                    self.backoff_failure(&peer).await;
                    skip.insert(peer);
                }
                Ok(MaybeActReply::Commit(result)) => {
                    self.backoff_clear(&peer).await;
                    emit!(RouteProgress {
                        peer_id: Some(peer),
                        result: Some(result),
                        ..RouteProgress::event(RouteProgressKind::Complete, attempt)
                    });
                    return;
                }
                Ok(MaybeActReply::NearAnchor(anchor)) => {
                    emit!(RouteProgress {
                        peer_id: Some(peer.clone()),
                        near_anchor: Some(anchor.clone()),
                        ..RouteProgress::event(RouteProgressKind::NearAnchor, attempt)
                    });

                    let push_target = anchor
                        .anchors
                        .iter()
                        .find(|id| !skip.contains(*id))
                        .cloned();
                    if options.activity.is_some() && !include_payload {
                        if let Some(anchor_peer) = push_target {
                            // push the payload straight to the anchor with
                            // one hop left; the responding peer joins the
                            // breadcrumbs unless it is the anchor itself
                            let mut crumbs = vec![self.self_id().to_string()];
                            if peer != anchor_peer {
                                crumbs.push(peer.clone());
                            }
                            let push = RouteAndMaybeAct {
                                activity: options.activity.clone(),
                                ttl: 1,
                                breadcrumbs: Some(crumbs),
                                correlation_id: fresh_correlation_id(),
                                timestamp: now_ms(),
                                ..message.clone()
                            };
                            emit!(RouteProgress {
                                peer_id: Some(anchor_peer.clone()),
                                ttl_remaining: Some(1),
                                ..RouteProgress::event(RouteProgressKind::ActivitySent, attempt)
                            });
                            match self.send_maybe_act(&anchor_peer, &push).await {
                                Ok(MaybeActReply::Commit(result)) => {
                                    self.backoff_clear(&anchor_peer).await;
                                    emit!(RouteProgress {
                                        peer_id: Some(anchor_peer),
                                        result: Some(result),
                                        ..RouteProgress::event(
                                            RouteProgressKind::Complete,
                                            attempt,
                                        )
                                    });
                                    return;
                                }
                                Ok(MaybeActReply::Busy(_)) => {
                                    self.backoff_failure(&anchor_peer).await;
                                    skip.insert(anchor_peer);
                                }
                                Ok(MaybeActReply::NearAnchor(next_anchor)) => {
                                    best_anchors = next_anchor.anchors;
                                }
                                Err(e) => {
                                    debug!(
                                        peer = %abbrev(&anchor_peer),
                                        error = %e,
                                        "activity push failed"
                                    );
                                    self.backoff_failure(&anchor_peer).await;
                                    skip.insert(anchor_peer);
                                }
                            }
                            continue;
                        }
                    }
                    best_anchors = anchor.anchors;
                }
                Err(e) => {
                    debug!(peer = %abbrev(&peer), error = %e, "lookup attempt failed");
                    self.backoff_failure(&peer).await;
                    best_anchors.retain(|a| a != &peer);
                    skip.insert(peer);
                }
            }
        }

        let _ = tx
            .send(RouteProgress::event(
                RouteProgressKind::Exhausted,
                max_attempts,
            ))
            .await;
    }
}
