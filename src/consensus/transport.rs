// Link-backed `RaftTransport` (§4.4/§5): turns the link layer's fire-and-
// forget frames into the request/response shape `RaftGroup` expects, by
// tagging every RPC with a correlation id and parking a oneshot until the
// matching reply frame arrives. Grounded in the same correlate-by-id idiom
// the delivery engine's outbox/ack pairing uses, generalized from a
// send-and-retry outbox row to a single awaited round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::consensus::node::{GroupCommand, RaftTransport};
use crate::consensus::types::{AppendEntriesRequest, AppendEntriesResponse, GroupId, VoteRequest, VoteResponse};
use crate::consensus::ConsensusService;
use crate::error::{MeshError, Result};
use crate::identity::NodeId;
use crate::link::manager::{LinkEvent, LinkManagerHandle};
use crate::link::FrameType;

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
enum RaftWireMsg {
    VoteReq { correlation_id: u64, req: VoteRequest },
    VoteResp { correlation_id: u64, resp: VoteResponse },
    AppendReq { correlation_id: u64, req: AppendEntriesRequest },
    AppendResp { correlation_id: u64, resp: AppendEntriesResponse },
}

pub struct LinkRaftTransport {
    links: LinkManagerHandle,
    pending: DashMap<u64, oneshot::Sender<RaftWireMsg>>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
}

impl LinkRaftTransport {
    pub fn new(links: LinkManagerHandle, rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { links, pending: DashMap::new(), next_id: AtomicU64::new(1), rpc_timeout })
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn roundtrip(&self, peer: &NodeId, frame_type: FrameType, correlation_id: u64, msg: &RaftWireMsg) -> Result<RaftWireMsg> {
        let link = self.links.link_to(peer).await.ok_or_else(|| MeshError::NoRoute(peer.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);

        let payload = bincode::encode_to_vec(msg, bincode::config::standard())?;
        if let Err(e) = link.send_frame(frame_type, 0, BytesMut::from(&payload[..])).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MeshError::TimedOut(format!("raft rpc to {peer} dropped"))),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(MeshError::TimedOut(format!("raft rpc to {peer} timed out")))
            }
        }
    }
}

#[async_trait]
impl RaftTransport for LinkRaftTransport {
    async fn send_vote_request(&self, peer: &NodeId, req: VoteRequest) -> Result<VoteResponse> {
        let correlation_id = self.next_correlation_id();
        let msg = RaftWireMsg::VoteReq { correlation_id, req };
        match self.roundtrip(peer, FrameType::RaftVote, correlation_id, &msg).await? {
            RaftWireMsg::VoteResp { resp, .. } => Ok(resp),
            _ => Err(MeshError::Internal("unexpected raft vote reply shape".into())),
        }
    }

    async fn send_append_entries(&self, peer: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let correlation_id = self.next_correlation_id();
        let msg = RaftWireMsg::AppendReq { correlation_id, req };
        match self.roundtrip(peer, FrameType::RaftAppend, correlation_id, &msg).await? {
            RaftWireMsg::AppendResp { resp, .. } => Ok(resp),
            _ => Err(MeshError::Internal("unexpected raft append reply shape".into())),
        }
    }
}

/// Drains link frame events, completing parked round trips on reply frames
/// and dispatching inbound requests to the addressed group's mailbox.
pub async fn run_receiver(transport: Arc<LinkRaftTransport>, consensus: Arc<ConsensusService>, links: LinkManagerHandle) {
    let mut events = links.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        let LinkEvent::Frame(from, frame) = event else { continue };
        if !matches!(frame.header.frame_type, FrameType::RaftVote | FrameType::RaftAppend) {
            continue;
        }

        let msg: RaftWireMsg = match bincode::decode_from_slice(&frame.payload, bincode::config::standard()) {
            Ok((msg, _)) => msg,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "failed to decode inbound raft rpc");
                continue;
            }
        };

        match msg {
            RaftWireMsg::VoteResp { correlation_id, .. } | RaftWireMsg::AppendResp { correlation_id, .. } => {
                if let Some((_, tx)) = transport.pending.remove(&correlation_id) {
                    let _ = tx.send(msg);
                }
            }
            RaftWireMsg::VoteReq { correlation_id, req } => {
                let group_id = GroupId(req.group.clone());
                let transport = transport.clone();
                let consensus = consensus.clone();
                let links = links.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let Some(mailbox) = consensus.mailbox_for(&group_id).await else { return };
                    let (tx, rx) = oneshot::channel();
                    if mailbox.send(GroupCommand::HandleVoteRequest { req, respond: tx }).is_err() {
                        return;
                    }
                    let Ok(resp) = rx.await else { return };
                    let reply = RaftWireMsg::VoteResp { correlation_id, resp };
                    if let Some(link) = links.link_to(&from).await {
                        if let Ok(payload) = bincode::encode_to_vec(&reply, bincode::config::standard()) {
                            let _ = link.send_frame(FrameType::RaftVote, 0, BytesMut::from(&payload[..])).await;
                        }
                    }
                    let _ = transport;
                });
            }
            RaftWireMsg::AppendReq { correlation_id, req } => {
                let group_id = GroupId(req.group.clone());
                let consensus = consensus.clone();
                let links = links.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let Some(mailbox) = consensus.mailbox_for(&group_id).await else { return };
                    let (tx, rx) = oneshot::channel();
                    if mailbox.send(GroupCommand::HandleAppendEntries { req, respond: tx }).is_err() {
                        return;
                    }
                    let Ok(resp) = rx.await else { return };
                    let reply = RaftWireMsg::AppendResp { correlation_id, resp };
                    if let Some(link) = links.link_to(&from).await {
                        if let Ok(payload) = bincode::encode_to_vec(&reply, bincode::config::standard()) {
                            let _ = link.send_frame(FrameType::RaftAppend, 0, BytesMut::from(&payload[..])).await;
                        }
                    }
                });
            }
        }
    }
}
