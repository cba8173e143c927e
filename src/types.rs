use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::db::InMemoryDB;
use crate::propagator::Propagator;
use crate::rdb;
use crate::replica::HandshakeState;

pub const DEFAULT_PORT: u16 = 6379;

/// Startup parameters consumed by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// `host:port` of the primary; `Some` makes this instance a replica.
    pub replica_of: Option<String>,
    /// Detach a replica after this many propagated commands in a row were
    /// abandoned. `None` keeps replicas attached forever.
    pub evict_replica_after: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            replica_of: None,
            evict_replica_after: None,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn role(&self) -> Role {
        if self.replica_of.is_some() {
            Role::Replica
        } else {
            Role::Primary
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// Name used on the wire by `INFO`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "master",
            Role::Replica => "slave",
        }
    }
}

pub struct ReplicationState {
    pub role: Role,
    /// 40 hex characters, fixed for the life of the process.
    pub replid: String,
    /// Replicas attached to this primary.
    pub propagator: Propagator,
    link: Mutex<HandshakeState>,
    link_up: AtomicBool,
}

impl ReplicationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            replid: generate_replid(),
            propagator: Propagator::new(),
            link: Mutex::new(HandshakeState::Start),
            link_up: AtomicBool::new(false),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Progress of the handshake with our primary (replica side).
    pub fn link_state(&self) -> HandshakeState {
        *self.link.lock()
    }

    pub fn record_link_state(&self, state: HandshakeState) {
        *self.link.lock() = state;
        if state == HandshakeState::Connected {
            self.link_up.store(true, Ordering::Release);
        }
    }

    pub fn mark_link_down(&self) {
        self.link_up.store(false, Ordering::Release);
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }
}

fn generate_replid() -> String {
    let raw: [u8; 20] = rand::random();
    hex::encode(raw)
}

/// Everything the command path needs, passed explicitly to every handler.
pub struct ServerState {
    pub config: ServerConfig,
    pub db: InMemoryDB,
    pub replication: ReplicationState,
    /// Payload sent after every `FULLRESYNC`.
    pub snapshot: Bytes,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let snapshot = rdb::empty_snapshot()?;
        Ok(Self {
            replication: ReplicationState::new(config.role()),
            db: InMemoryDB::new(),
            config,
            snapshot,
        })
    }
}
