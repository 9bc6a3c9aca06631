// One established link to a peer: the handshake, the writer/reader pump
// tasks, PING/PONG keep-alive, and STALE detection (§4.2). Reconnection with
// backoff lives in `manager.rs`; this module only knows how to run a single
// already-connected socket until it dies.
//
// Scheduling follows the "one writer, one reader per link, mailbox not flag
// polling" discipline: the writer task owns the socket's write half and only
// ever receives work through its mpsc channel, including its own shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::error::{MeshError, Result};
use crate::identity::{IdentityService, NodeId};
use crate::link::codec::FrameCodec;
use crate::link::flow_control::LinkFlowControl;
use crate::link::frame::{FrameHeader, FrameType};
use crate::link::handshake::{Hello, HelloAck};

/// Inbound frame handed up to the link manager / stream layer after the
/// codec and any internally-handled control frames (PING/PONG/CREDIT) are
/// stripped out.
#[derive(Debug)]
pub struct InboundFrame {
    pub header: FrameHeader,
    pub payload: BytesMut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Stale,
    Closed,
}

enum WriterCommand {
    Send { frame_type: FrameType, logical_stream_id: u64, seq: u64, payload: BytesMut },
    Shutdown,
}

/// Handle to a running link. Cloning is cheap; all clones share the same
/// underlying writer task and state.
#[derive(Clone)]
pub struct Link {
    pub peer_id: NodeId,
    pub peer_addr: SocketAddr,
    state: Arc<RwLock<LinkState>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    pub flow_control: Arc<LinkFlowControl>,
    next_seq: Arc<AtomicU64>,
    missed_pings: Arc<AtomicU32>,
    last_pong: Arc<RwLock<Instant>>,
    ping_sent_at: Arc<RwLock<Instant>>,
    last_rtt_ms: Arc<AtomicU64>,
}

impl Link {
    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a DATA/RAFT/ACK frame. Honors the per-stream credit window
    /// before writing, per §4.2's per-stream flow control requirement.
    pub async fn send_frame(&self, frame_type: FrameType, logical_stream_id: u64, payload: BytesMut) -> Result<()> {
        if matches!(frame_type, FrameType::Data) {
            self.flow_control.acquire(logical_stream_id, payload.len()).await?;
        }
        let seq = self.next_seq();
        self.writer_tx
            .send(WriterCommand::Send { frame_type, logical_stream_id, seq, payload })
            .await
            .map_err(|_| MeshError::NoRoute(format!("link to {} is closed", self.peer_id)))
    }

    pub async fn send_credit(&self, logical_stream_id: u64, amount: u32) -> Result<()> {
        let payload = BytesMut::from(&amount.to_be_bytes()[..]);
        let seq = self.next_seq();
        self.writer_tx
            .send(WriterCommand::Send { frame_type: FrameType::Credit, logical_stream_id, seq, payload })
            .await
            .map_err(|_| MeshError::NoRoute(format!("link to {} is closed", self.peer_id)))
    }

    pub async fn close(&self) {
        *self.state.write().await = LinkState::Closed;
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
    }

    /// Latest measured PING/PONG round-trip, in milliseconds. `0` until the
    /// first PONG lands (§4.3's background probe reads this as its latency
    /// sample).
    pub fn last_rtt_ms(&self) -> f64 {
        self.last_rtt_ms.load(Ordering::Relaxed) as f64
    }
}

/// Runs the HELLO/HELLO_ACK exchange on a freshly-connected socket, then
/// spawns the writer and reader pump tasks. Returns the link handle plus a
/// channel the caller drains for application-level inbound frames.
pub async fn establish(
    stream: TcpStream,
    peer_addr: SocketAddr,
    identity: Arc<IdentityService>,
    peer_public_key: [u8; 32],
    incarnation: u64,
    credit_window_bytes: usize,
    is_initiator: bool,
) -> Result<(Link, mpsc::Receiver<InboundFrame>)> {
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let peer_node_id = if is_initiator {
        do_handshake_initiator(&mut read_half, &mut write_half, &identity, peer_public_key, incarnation).await?
    } else {
        do_handshake_responder(&mut read_half, &mut write_half, &identity, peer_public_key, incarnation).await?
    };

    let (writer_tx, writer_rx) = mpsc::channel(1024);
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);

    let state = Arc::new(RwLock::new(LinkState::Active));
    let flow_control = Arc::new(LinkFlowControl::new(credit_window_bytes));
    let missed_pings = Arc::new(AtomicU32::new(0));
    let last_pong = Arc::new(RwLock::new(Instant::now()));
    let ping_sent_at = Arc::new(RwLock::new(Instant::now()));
    let last_rtt_ms = Arc::new(AtomicU64::new(0));

    tokio::spawn(run_writer(write_half, writer_rx));
    tokio::spawn(run_reader(
        read_half,
        inbound_tx,
        flow_control.clone(),
        missed_pings.clone(),
        last_pong.clone(),
        state.clone(),
        ping_sent_at.clone(),
        last_rtt_ms.clone(),
    ));

    let link = Link {
        peer_id: peer_node_id,
        peer_addr,
        state,
        writer_tx,
        flow_control,
        next_seq: Arc::new(AtomicU64::new(0)),
        missed_pings,
        last_pong,
        ping_sent_at,
        last_rtt_ms,
    };

    Ok((link, inbound_rx))
}

async fn do_handshake_initiator(
    read_half: &mut ReadHalf<TcpStream>,
    write_half: &mut WriteHalf<TcpStream>,
    identity: &IdentityService,
    _peer_public_key: [u8; 32],
    incarnation: u64,
) -> Result<NodeId> {
    let hello = Hello::new(identity, incarnation);
    write_framed(write_half, FrameType::Hello, &hello).await?;

    let (header, payload) = read_framed(read_half).await?;
    if header.frame_type != FrameType::HelloAck {
        return Err(MeshError::AuthRejected("expected HELLO_ACK".into()));
    }
    let (ack, _): (HelloAck, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
    ack.into_result()?;

    Ok(NodeId::from_string(hello.node_id)?)
}

async fn do_handshake_responder(
    read_half: &mut ReadHalf<TcpStream>,
    write_half: &mut WriteHalf<TcpStream>,
    identity: &IdentityService,
    peer_public_key: [u8; 32],
    _incarnation: u64,
) -> Result<NodeId> {
    let (header, payload) = read_framed(read_half).await?;
    if header.frame_type != FrameType::Hello {
        return Err(MeshError::AuthRejected("expected HELLO".into()));
    }
    let (hello, _): (Hello, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;

    match hello.validate(&peer_public_key) {
        Ok(()) => {
            let ack = HelloAck::accepted(identity, hello.link_version);
            write_framed(write_half, FrameType::HelloAck, &ack).await?;
            Ok(hello.node_id()?)
        }
        Err(e) => {
            let ack = HelloAck::rejected(identity, e.to_string());
            write_framed(write_half, FrameType::HelloAck, &ack).await?;
            Err(e)
        }
    }
}

async fn write_framed<T: bincode::Encode>(write_half: &mut WriteHalf<TcpStream>, frame_type: FrameType, value: &T) -> Result<()> {
    let payload = bincode::encode_to_vec(value, bincode::config::standard())?;
    let codec = FrameCodec::new();
    let buf = codec.encode(frame_type, 0, 0, &payload)?;
    write_half.write_all(&buf).await.map_err(MeshError::Io)
}

async fn read_framed(read_half: &mut ReadHalf<TcpStream>) -> Result<(FrameHeader, BytesMut)> {
    let codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(result) = codec.try_decode(&mut buf)? {
            return Ok(result);
        }
        let mut chunk = [0u8; 4096];
        let n = read_half.read(&mut chunk).await.map_err(MeshError::Io)?;
        if n == 0 {
            return Err(MeshError::NoRoute("peer closed during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn run_writer(mut write_half: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<WriterCommand>) {
    let codec = FrameCodec::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send { frame_type, logical_stream_id, seq, payload } => {
                match codec.encode(frame_type, logical_stream_id, seq, &payload) {
                    Ok(buf) => {
                        if write_half.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode outgoing frame");
                    }
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn run_reader(
    mut read_half: ReadHalf<TcpStream>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    flow_control: Arc<LinkFlowControl>,
    missed_pings: Arc<AtomicU32>,
    last_pong: Arc<RwLock<Instant>>,
    state: Arc<RwLock<LinkState>>,
    ping_sent_at: Arc<RwLock<Instant>>,
    last_rtt_ms: Arc<AtomicU64>,
) {
    let codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut chunk = [0u8; 64 * 1024];

    loop {
        match codec.try_decode(&mut buf) {
            Ok(Some((header, payload))) => {
                missed_pings.store(0, Ordering::Relaxed);
                match header.frame_type {
                    FrameType::Pong => {
                        let now = Instant::now();
                        *last_pong.write().await = now;
                        let rtt = now.saturating_duration_since(*ping_sent_at.read().await).as_millis() as u64;
                        last_rtt_ms.store(rtt, Ordering::Relaxed);
                    }
                    FrameType::Credit => {
                        if payload.len() >= 4 {
                            let amount = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                            flow_control.credit(header.logical_stream_id, amount as usize).await;
                        }
                    }
                    FrameType::Goodbye => {
                        *state.write().await = LinkState::Closed;
                        return;
                    }
                    _ => {
                        if inbound_tx.send(InboundFrame { header, payload }).await.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "link reader decode error, closing link");
                *state.write().await = LinkState::Closed;
                return;
            }
        }

        match read_half.read(&mut chunk).await {
            Ok(0) => {
                *state.write().await = LinkState::Closed;
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => {
                *state.write().await = LinkState::Closed;
                return;
            }
        }
    }
}

/// Background keep-alive loop: sends PING every `ping_interval`, declares the
/// link STALE after `missed_threshold` consecutive misses, per §4.2.
pub async fn run_keepalive(link: Link, ping_interval: Duration, missed_threshold: u32) {
    let mut ticker = tokio::time::interval(ping_interval);
    loop {
        ticker.tick().await;
        if link.state().await == LinkState::Closed {
            return;
        }

        *link.ping_sent_at.write().await = Instant::now();
        if link.send_frame(FrameType::Ping, 0, BytesMut::new()).await.is_err() {
            return;
        }

        let missed = link.missed_pings.fetch_add(1, Ordering::Relaxed) + 1;
        if missed >= missed_threshold {
            tracing::warn!(peer = %link.peer_id, missed, "link missed too many pings, marking stale");
            *link.state.write().await = LinkState::Stale;
            return;
        }
    }
}
