//! Replica side of replication: the handshake with the primary and the
//! link that feeds propagated commands into the local command queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::handler::{self, ConnectionKind, JobSender};
use crate::rdb;
use crate::resp::{decode, decode_snapshot, DecodeError, Message, StreamDecoder};
use crate::types::{ReplicationState, ServerState};

/// Handshake steps, in the only order they may occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    AwaitPong,
    AwaitReplconf1Ok,
    AwaitReplconf2Ok,
    AwaitFullresync,
    AwaitSnapshot,
    Connected,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected reply {reply:?} from primary in state {state:?}")]
    UnexpectedReply { state: HandshakeState, reply: Message },
    #[error("primary closed the connection in state {0:?}")]
    Closed(HandshakeState),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The replica's handshake state machine. Pure: it consumes replies and
/// says what to send next, and does no I/O itself.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    listening_port: u16,
}

impl Handshake {
    pub fn new(listening_port: u16) -> Self {
        Self {
            state: HandshakeState::Start,
            listening_port,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Leaves `Start`, returning the opening `PING`. `None` if already started.
    pub fn start(&mut self) -> Option<Message> {
        if self.state != HandshakeState::Start {
            return None;
        }
        self.state = HandshakeState::AwaitPong;
        Some(Message::command(["PING"]))
    }

    /// Advances on one reply from the primary. Returns the next command to send, if any.
    ///
    /// On error the state is left unchanged: the handshake halts where it failed.
    pub fn on_reply(&mut self, reply: &Message) -> Result<Option<Message>, HandshakeError> {
        use HandshakeState::*;

        let (next, send) = match (self.state, reply) {
            (AwaitPong, Message::SimpleString(s)) if s.eq_ignore_ascii_case("PONG") => {
                let port = self.listening_port.to_string();
                (AwaitReplconf1Ok, Some(Message::command(["REPLCONF".into(), "listening-port".into(), port])))
            }
            (AwaitReplconf1Ok, Message::SimpleString(s)) if s.eq_ignore_ascii_case("OK") => {
                (AwaitReplconf2Ok, Some(Message::command(["REPLCONF", "capa", "psync2"])))
            }
            (AwaitReplconf2Ok, Message::SimpleString(s)) if s.eq_ignore_ascii_case("OK") => {
                (AwaitFullresync, Some(Message::command(["PSYNC", "?", "-1"])))
            }
            (AwaitFullresync, Message::SimpleString(s)) if s.starts_with("FULLRESYNC") => {
                debug!(reply = %s, "primary accepted full resynchronization");
                (AwaitSnapshot, None)
            }
            (AwaitSnapshot, Message::BulkString(_)) => (Connected, None),
            (state, reply) => {
                return Err(HandshakeError::UnexpectedReply {
                    state,
                    reply: reply.clone(),
                })
            }
        };
        self.state = next;
        Ok(send)
    }

    pub fn is_connected(&self) -> bool {
        self.state == HandshakeState::Connected
    }
}

/// Drives the handshake over `stream`, returning the snapshot payload.
///
/// Bytes the primary sent after the snapshot stay in `buf` for the caller.
pub async fn perform_handshake<S>(
    stream: &mut S,
    listening_port: u16,
    replication: &ReplicationState,
    buf: &mut BytesMut,
) -> Result<Bytes, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(listening_port);
    if let Some(ping) = handshake.start() {
        stream.write_all(&ping.to_bytes()).await?;
    }
    replication.record_link_state(handshake.state());

    loop {
        let decoded = if handshake.state() == HandshakeState::AwaitSnapshot {
            decode_snapshot(&buf[..])?
        } else {
            decode(&buf[..])?
        };
        let Some((reply, used)) = decoded else {
            if stream.read_buf(buf).await? == 0 {
                return Err(HandshakeError::Closed(handshake.state()));
            }
            continue;
        };
        buf.advance(used);

        if let Some(next) = handshake.on_reply(&reply)? {
            stream.write_all(&next.to_bytes()).await?;
        }
        replication.record_link_state(handshake.state());

        if handshake.is_connected() {
            return match reply {
                Message::BulkString(snapshot) => Ok(snapshot),
                _ => Ok(Bytes::new()),
            };
        }
    }
}

/// Connects to the primary, completes the handshake, then streams propagated
/// commands into the command queue until the link closes.
///
/// Errors are returned only for failures before the link is established;
/// a replica that cannot sync has nothing useful to do.
pub async fn run_link(primary: String, state: Arc<ServerState>, jobs: JobSender) -> Result<()> {
    info!(%primary, "connecting to primary");
    let mut stream = TcpStream::connect(&primary)
        .await
        .with_context(|| format!("failed to connect to primary at {primary}"))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%primary, error = %e, "failed to set TCP_NODELAY");
    }

    let mut buf = BytesMut::with_capacity(4096);
    let snapshot = perform_handshake(&mut stream, state.config.port, &state.replication, &mut buf)
        .await
        .with_context(|| format!("handshake with primary at {primary} failed"))?;
    info!(
        %primary,
        snapshot_bytes = snapshot.len(),
        rdb_version = rdb::header_version(&snapshot).unwrap_or("unknown"),
        "replication link established"
    );

    let (reader, writer) = stream.into_split();
    let conn = handler::open_connection(ConnectionKind::PrimaryLink, writer, &state);
    let result = handler::read_loop(reader, buf, StreamDecoder::after_snapshot(), &conn, &jobs).await;
    state.replication.mark_link_down();
    match result {
        Ok(()) => info!(%primary, "primary closed the replication link"),
        Err(e) => warn!(%primary, error = %e, "replication link failed"),
    }
    Ok(())
}
