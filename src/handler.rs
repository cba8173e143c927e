use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::propagator::{self, Delivery};
use crate::resp::{DecodeError, Message, StreamDecoder};
use crate::types::ServerState;

const READ_BUF: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection's messages come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    /// An ordinary client, or a replica that attached through `PSYNC`.
    Client,
    /// This replica's link to its primary. Replies are mostly discarded.
    PrimaryLink,
}

/// A frame queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Reply(Bytes),
    /// A write command forwarded to a replica; retried on failure.
    Propagated(Bytes),
}

/// Cheap, cloneable sink for one connection's outgoing bytes.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    kind: ConnectionKind,
    tx: UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// A handle with no writer task attached; the caller owns the receiving end.
    pub fn pair(kind: ConnectionKind) -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, kind, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Returns `false` once the writer has gone away.
    pub fn send_reply(&self, bytes: Bytes) -> bool {
        self.tx.send(Outbound::Reply(bytes)).is_ok()
    }

    pub fn send_propagated(&self, bytes: Bytes) -> bool {
        self.tx.send(Outbound::Propagated(bytes)).is_ok()
    }
}

/// A decoded message waiting for the executor, with the connection to answer on.
#[derive(Debug)]
pub struct Job {
    pub conn: ConnectionHandle,
    pub message: Message,
}

pub type JobSender = UnboundedSender<Job>;

/// Serves one accepted client until it disconnects or sends malformed bytes.
pub async fn handle_client(stream: TcpStream, state: Arc<ServerState>, jobs: JobSender) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let conn = open_connection(ConnectionKind::Client, writer, &state);
    debug!(conn = conn.id(), "client connected");

    let buf = BytesMut::with_capacity(READ_BUF);
    let result = read_loop(reader, buf, StreamDecoder::new(), &conn, &jobs).await;
    if state.replication.propagator.detach(conn.id()) {
        debug!(replica = conn.id(), "replica disconnected");
    }
    result
}

/// Registers a connection and spawns the task that owns its write half.
pub(crate) fn open_connection<W>(kind: ConnectionKind, writer: W, state: &Arc<ServerState>) -> ConnectionHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (conn, rx) = ConnectionHandle::pair(kind);
    tokio::spawn(run_writer(conn.id(), writer, rx, Arc::clone(state)));
    conn
}

/// Feeds every complete message into the command queue in arrival order.
///
/// Bytes already in `buf` are decoded before the first read.
pub(crate) async fn read_loop<R>(
    mut reader: R,
    mut buf: BytesMut,
    mut decoder: StreamDecoder,
    conn: &ConnectionHandle,
    jobs: &JobSender,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut messages = Vec::new();
    loop {
        decoder.decode_many(&mut buf, &mut messages)?;
        for message in messages.drain(..) {
            let job = Job { conn: conn.clone(), message };
            if jobs.send(job).is_err() {
                bail!("command queue closed");
            }
        }

        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() && decoder.is_idle() {
                return Ok(());
            }
            return Err(DecodeError::Truncated.into());
        }
    }
}

async fn run_writer<W>(id: u64, mut writer: W, mut rx: UnboundedReceiver<Outbound>, state: Arc<ServerState>)
where
    W: AsyncWrite + Unpin,
{
    let mut abandoned_in_a_row = 0u32;
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Reply(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(conn = id, error = %e, "write failed, closing connection");
                    break;
                }
            }
            Outbound::Propagated(bytes) => match propagator::write_with_retry(&mut writer, &bytes, id).await {
                Delivery::Sent => abandoned_in_a_row = 0,
                Delivery::Dropped => {
                    abandoned_in_a_row += 1;
                    let evict = state
                        .config
                        .evict_replica_after
                        .is_some_and(|limit| abandoned_in_a_row >= limit);
                    if evict {
                        warn!(replica = id, abandoned = abandoned_in_a_row, "evicting unresponsive replica");
                        state.replication.propagator.detach(id);
                        break;
                    }
                }
                Delivery::Torn => {
                    warn!(replica = id, "replication stream cut mid-frame, closing replica connection");
                    state.replication.propagator.detach(id);
                    break;
                }
            },
        }
    }
    let _ = writer.shutdown().await;
}
