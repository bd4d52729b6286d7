//! TCP Session Implementation
//!
//! Handshake, framed reads with a reusable buffer, and the two tasks that
//! drive an established session.
//!
//! ## Session Layout
//!
//! ```text
//! socket read half ──> [reader task] ──ping──> PeerConnection::send
//!                          │
//!                          └──app frames──> FrameSink::deliver
//!
//! PeerConnection::send ──> [bounded queue] ──> [writer task] ──> socket write half
//!                                                  └── heartbeat when idle
//! ```
//!
//! Either task ending closes the connection, which stops the other one and
//! tells the routing table the session is gone.

use super::{FrameSink, PeerConnection, TransportConfig};
use crate::cluster::RoutingTable;
use crate::discovery::IdGenerator;
use crate::error::{Result, TransportError};
use bytes::{Buf, BytesMut};
use codec::{
    read_length_prefix, ControlType, Frame, FrameView, Hello, ProtocolError, HEADER_LEN,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// First four bytes a dialing peer writes
pub const HANDSHAKE_MAGIC: u32 = u32::from_le_bytes(*b"SBUS");

/// Buffered frame reader over any async byte stream
///
/// Returned views borrow the internal buffer and stay valid until the next
/// read call, which is when their bytes are released.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    consumed: usize,
    max_frame_len: usize,
    bytes_received: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, capacity: usize, max_frame_len: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(capacity),
            consumed: 0,
            max_frame_len,
            bytes_received: 0,
        }
    }

    /// Next complete frame, or `None` on a clean end of stream
    pub async fn read_frame(&mut self) -> Result<Option<FrameView<'_>>> {
        self.release_consumed();

        let len = loop {
            if let Some(len) = self.complete_frame_len()? {
                break len;
            }
            if !self.fill().await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::connection(
                    format!(
                        "peer closed mid-frame with {} bytes buffered",
                        self.buffer.len()
                    ),
                    None,
                ));
            }
        };

        self.consumed = len;
        Ok(Some(FrameView::decode(&self.buffer[..len])?))
    }

    /// Little-endian u32 read ahead of framed traffic
    pub async fn read_u32_le(&mut self) -> Result<u32> {
        self.release_consumed();
        while self.buffer.len() < 4 {
            if !self.fill().await? {
                return Err(TransportError::connection(
                    "peer closed during handshake",
                    None,
                ));
            }
        }
        Ok(self.buffer.get_u32_le())
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn release_consumed(&mut self) {
        if self.consumed > 0 {
            self.buffer.advance(self.consumed);
            self.consumed = 0;
        }
    }

    fn complete_frame_len(&mut self) -> Result<Option<usize>> {
        let Some(len) = read_length_prefix(&self.buffer) else {
            return Ok(None);
        };
        if len < HEADER_LEN {
            return Err(
                ProtocolError::message_too_small(HEADER_LEN, len, "declared frame length").into(),
            );
        }
        if len > self.max_frame_len {
            return Err(TransportError::protocol(format!(
                "frame of {} bytes exceeds maximum {}",
                len, self.max_frame_len
            )));
        }
        if self.buffer.len() >= len {
            return Ok(Some(len));
        }
        self.buffer.reserve(len - self.buffer.len());
        Ok(None)
    }

    async fn fill(&mut self) -> Result<bool> {
        if self.buffer.capacity() == self.buffer.len() {
            self.buffer.reserve(HEADER_LEN.max(4096));
        }
        let n = self
            .inner
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to read from peer", e))?;
        self.bytes_received += n as u64;
        Ok(n > 0)
    }
}

async fn write_all_with_deadline<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    deadline: Duration,
) -> Result<()> {
    tokio::time::timeout(deadline, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::timeout("write frame", deadline.as_millis() as u64))?
    .map_err(|e| TransportError::network_with_source("Failed to write to peer", e))
}

async fn read_hello<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Hello> {
    let frame = reader
        .read_frame()
        .await?
        .ok_or_else(|| TransportError::connection("peer closed before hello", None))?;
    if frame.frame_type() != u16::from(ControlType::Hello) {
        return Err(TransportError::protocol(format!(
            "expected hello frame, got frame type {}",
            frame.frame_type()
        )));
    }
    Ok(Hello::decode(frame.payload())?)
}

fn hello_frame(hello: &Hello) -> Result<Frame> {
    Ok(Frame::encode(ControlType::Hello.into(), &hello.encode(), &[])?)
}

/// Dialing side: send magic and our hello, then read the peer's hello
pub async fn client_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    local: &Hello,
    deadline: Duration,
) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = hello_frame(local)?;
    let mut opening = Vec::with_capacity(4 + hello.total_length());
    opening.extend_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
    opening.extend_from_slice(hello.as_bytes());
    write_all_with_deadline(writer, &opening, deadline).await?;

    tokio::time::timeout(deadline, read_hello(reader))
        .await
        .map_err(|_| TransportError::timeout("handshake", deadline.as_millis() as u64))?
}

/// Accepting side: verify magic, read the peer's hello, answer with ours
pub async fn server_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    local: &Hello,
    deadline: Duration,
) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = tokio::time::timeout(deadline, async {
        let magic = reader.read_u32_le().await?;
        if magic != HANDSHAKE_MAGIC {
            return Err(TransportError::from(ProtocolError::invalid_magic(
                HANDSHAKE_MAGIC,
                magic,
            )));
        }
        read_hello(reader).await
    })
    .await
    .map_err(|_| TransportError::timeout("handshake", deadline.as_millis() as u64))??;

    write_all_with_deadline(writer, hello_frame(local)?.as_bytes(), deadline).await?;
    Ok(peer)
}

/// Everything a session needs from its node
pub struct SessionContext {
    /// Identity this node announces
    pub local: Hello,
    pub config: TransportConfig,
    pub sink: Arc<dyn FrameSink>,
    pub table: Arc<RoutingTable>,
    pub ids: Arc<dyn IdGenerator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Run the handshake, register the session and start its tasks
async fn establish(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    role: Role,
) -> Result<Arc<PeerConnection>> {
    let remote_addr = stream.peer_addr().ok();
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::network_with_source("Failed to set TCP_NODELAY", e))?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(
        read_half,
        ctx.config.read_buffer_size,
        ctx.config.max_frame_len,
    );
    let deadline = ctx.config.io_deadline;

    let peer = match role {
        Role::Client => client_handshake(&mut reader, &mut write_half, &ctx.local, deadline).await?,
        Role::Server => server_handshake(&mut reader, &mut write_half, &ctx.local, deadline).await?,
    };
    if peer.machine_id == ctx.local.machine_id {
        return Err(TransportError::protocol(format!(
            "peer at {:?} announced this node's own identity {}",
            remote_addr, peer.machine_id
        )));
    }

    let session_id = ctx.ids.next_id();
    let (tx, rx) = mpsc::channel(ctx.config.send_queue_depth);
    let connection = Arc::new(PeerConnection::new(session_id, peer.machine_id, remote_addr, tx));

    ctx.table
        .register_session(peer.machine_id, peer.group.clone(), Arc::clone(&connection))
        .map_err(|e| {
            TransportError::connection(format!("session not registered: {e}"), remote_addr)
        })?;

    info!(
        session_id,
        peer = peer.machine_id,
        group = %peer.group,
        remote = ?remote_addr,
        role = ?role,
        "peer session established"
    );

    tokio::spawn(read_loop(Arc::clone(&ctx), reader, Arc::clone(&connection)));
    tokio::spawn(write_loop(ctx.config.clone(), write_half, rx, Arc::clone(&connection)));
    Ok(connection)
}

async fn read_loop<R: AsyncRead + Unpin>(
    ctx: Arc<SessionContext>,
    mut reader: FrameReader<R>,
    connection: Arc<PeerConnection>,
) {
    let peer = connection.machine_id();
    let deadline = ctx.config.io_deadline;
    let mut closed = connection.closed_signal();

    loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            next = tokio::time::timeout(deadline, reader.read_frame()) => next,
        };
        let frame = match next {
            Err(_) => {
                warn!(
                    peer,
                    deadline_ms = deadline.as_millis() as u64,
                    "peer read deadline exceeded"
                );
                break;
            }
            Ok(Err(e)) => {
                warn!(peer, error = %e, "peer read failed");
                break;
            }
            Ok(Ok(None)) => {
                debug!(peer, "peer closed the connection");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
        };

        match ControlType::classify(frame.frame_type()) {
            Some(control) if control.is_transport_local() => {
                if !handle_control(control, &connection) {
                    break;
                }
            }
            _ => {
                if let Err(e) = ctx.sink.deliver(peer, &frame) {
                    warn!(
                        peer,
                        frame_type = frame.frame_type(),
                        error = %e,
                        "inbound frame dropped"
                    );
                }
            }
        }
    }

    connection.close();
    if let Err(e) = ctx.table.session_lost(peer, connection.session_id()) {
        debug!(peer, error = %e, "session loss not recorded");
    }
    debug!(
        peer,
        session_id = connection.session_id(),
        bytes_received = reader.bytes_received(),
        "peer reader stopped"
    );
}

/// Returns false when the session should end
fn handle_control(control: ControlType, connection: &PeerConnection) -> bool {
    let peer = connection.machine_id();
    match control {
        ControlType::Heartbeat | ControlType::Nil => true,
        ControlType::Ping => {
            match Frame::encode(ControlType::Pong.into(), &[], &[]) {
                Ok(pong) => {
                    if let Err(e) = connection.send(pong) {
                        debug!(peer, error = %e, "pong not queued");
                    }
                }
                Err(e) => warn!(error = %e, "pong frame not encoded"),
            }
            true
        }
        ControlType::Pong => {
            trace!(peer, "pong received");
            true
        }
        ControlType::Exit => {
            info!(peer, "peer sent exit");
            false
        }
        ControlType::Hello => {
            warn!(peer, "unexpected hello on established session");
            true
        }
        _ => true,
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    config: TransportConfig,
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    connection: Arc<PeerConnection>,
) {
    let peer = connection.machine_id();
    let mut closed = connection.closed_signal();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut batch = BytesMut::with_capacity(config.read_buffer_size);
    let mut last_write = Instant::now();
    let mut bytes_sent: u64 = 0;

    loop {
        batch.clear();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            next = rx.recv() => {
                let Some(frame) = next else { break };
                batch.extend_from_slice(frame.as_bytes());
                while batch.len() < config.read_buffer_size {
                    match rx.try_recv() {
                        Ok(frame) => batch.extend_from_slice(frame.as_bytes()),
                        Err(_) => break,
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_write.elapsed() < config.heartbeat_interval {
                    continue;
                }
                match Frame::encode(ControlType::Heartbeat.into(), &[], &[]) {
                    Ok(frame) => batch.extend_from_slice(frame.as_bytes()),
                    Err(e) => {
                        warn!(error = %e, "heartbeat frame not encoded");
                        continue;
                    }
                }
            }
        }

        if let Err(e) = write_all_with_deadline(&mut writer, &batch, config.io_deadline).await {
            warn!(peer, error = %e, "peer write failed");
            break;
        }
        bytes_sent += batch.len() as u64;
        last_write = Instant::now();
    }

    // Best effort goodbye; the peer may already be gone
    if let Ok(exit) = Frame::encode(ControlType::Exit.into(), &[], &[]) {
        let _ = write_all_with_deadline(&mut writer, exit.as_bytes(), config.io_deadline).await;
    }
    let _ = writer.shutdown().await;
    connection.close();
    debug!(peer, session_id = connection.session_id(), bytes_sent, "peer writer stopped");
}

/// Listening socket that turns inbound connections into sessions
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::network_with_source(format!("Failed to bind {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("Failed to read bound address", e))?;
        info!(%local_addr, "listening for peers");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` flips to true
    pub async fn run(self, ctx: Arc<SessionContext>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = establish(ctx, stream, Role::Server).await {
                            warn!(%remote, error = %e, "inbound session rejected");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        info!(local_addr = %self.local_addr, "acceptor stopped");
    }
}

/// Open a session to `addr`
pub async fn dial(addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<Arc<PeerConnection>> {
    let timeout = ctx.config.connect_timeout;
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::timeout("connect", timeout.as_millis() as u64))?
        .map_err(|e| TransportError::connection(format!("connect failed: {e}"), Some(addr)))?;
    establish(ctx, stream, Role::Client).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(frame_type: u16, payload: &[u8]) -> Frame {
        Frame::encode(frame_type, payload, &[]).unwrap()
    }

    #[tokio::test]
    async fn test_reader_splits_coalesced_frames() {
        let (mut client, server) = duplex(1024);
        let mut bytes = frame(60, b"one").into_bytes();
        bytes.extend_from_slice(frame(61, b"two").as_bytes());
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, 16, 1024);
        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!((first.frame_type(), first.payload()), (60, &b"one"[..]));
        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!((second.frame_type(), second.payload()), (61, &b"two"[..]));
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_reassembles_partial_frames() {
        let (mut client, server) = duplex(1024);
        let bytes = frame(70, &[9u8; 100]).into_bytes();
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FrameReader::new(server, 8, 1024);
        let view = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(view.payload(), &[9u8; 100][..]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_frames() {
        let (mut client, server) = duplex(1024);
        client.write_all(&frame(60, &[0u8; 64]).into_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server, 16, 32);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_connection_error() {
        let (mut client, server) = duplex(1024);
        let bytes = frame(60, b"partial").into_bytes();
        client.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, 16, 1024);
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            TransportError::Connection { .. }
        ));
    }

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let (client_io, server_io) = duplex(1024);
        let (client_read, mut client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);
        let deadline = Duration::from_secs(1);

        let server = tokio::spawn(async move {
            let mut reader = FrameReader::new(server_read, 64, 1024);
            server_handshake(&mut reader, &mut server_write, &Hello::new(1, "hub"), deadline).await
        });
        let mut reader = FrameReader::new(client_read, 64, 1024);
        let seen_by_client =
            client_handshake(&mut reader, &mut client_write, &Hello::new(2, "workers"), deadline)
                .await
                .unwrap();
        let seen_by_server = server.await.unwrap().unwrap();

        assert_eq!(seen_by_client, Hello::new(1, "hub"));
        assert_eq!(seen_by_server, Hello::new(2, "workers"));
    }

    #[tokio::test]
    async fn test_bad_magic_is_protocol_error() {
        let (mut client, server) = duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        client.write_all(b"HTTP").await.unwrap();

        let mut reader = FrameReader::new(server_read, 64, 1024);
        let err = server_handshake(
            &mut reader,
            &mut server_write,
            &Hello::new(1, "hub"),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }));
        assert!(!err.is_retryable());
    }
}
