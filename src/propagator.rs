use std::io;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::handler::ConnectionHandle;
use crate::resp::Message;

/// Write attempts per propagated command per replica.
pub const PROPAGATION_ATTEMPTS: usize = 3;

/// Primary-side fan-out of write commands to attached replicas.
///
/// `propagate` only enqueues: each replica's writer task does the socket
/// I/O, so a slow replica never holds up the executor or other replicas.
#[derive(Default)]
pub struct Propagator {
    replicas: RwLock<Vec<ConnectionHandle>>,
    offset: AtomicI64,
}

impl Propagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, replica: ConnectionHandle) {
        self.replicas.write().push(replica);
    }

    /// Returns whether a replica with this connection id was attached.
    pub fn detach(&self, id: u64) -> bool {
        let mut replicas = self.replicas.write();
        let before = replicas.len();
        replicas.retain(|r| r.id() != id);
        replicas.len() != before
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    /// Bytes of replication stream produced so far.
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Sends `frame` to every attached replica, in call order.
    pub fn propagate(&self, frame: &Message) {
        let bytes = frame.to_bytes();
        self.offset.fetch_add(bytes.len() as i64, Ordering::Relaxed);

        // Copy-on-read: attach/detach never race with this iteration.
        let replicas = self.replicas.read().clone();
        for replica in &replicas {
            if !replica.send_propagated(bytes.clone()) {
                debug!(replica = replica.id(), "replica writer gone, detaching");
                self.detach(replica.id());
            }
        }
    }
}

/// Outcome of writing one propagated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// Every attempt failed before any byte went out; the stream is intact.
    Dropped,
    /// Attempts ran out after part of the frame was written. The replica's
    /// stream can no longer be parsed.
    Torn,
}

/// Writes one propagated frame, allowing up to [`PROPAGATION_ATTEMPTS`]
/// failed writes. A retry resumes at the first unwritten byte.
pub(crate) async fn write_with_retry<W>(writer: &mut W, frame: &[u8], replica: u64) -> Delivery
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut failures = 0;
    while written < frame.len() {
        let err = match writer.write(&frame[written..]).await {
            Ok(0) => io::Error::from(io::ErrorKind::WriteZero),
            Ok(n) => {
                written += n;
                continue;
            }
            Err(e) => e,
        };
        failures += 1;
        warn!(replica, attempt = failures, written, error = %err, "propagation write failed");
        if failures == PROPAGATION_ATTEMPTS {
            warn!(replica, "propagated command abandoned");
            return if written == 0 { Delivery::Dropped } else { Delivery::Torn };
        }
    }
    Delivery::Sent
}
