#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use replikv::resp::{decode, Message};
use replikv::server::Server;
use replikv::types::{ServerConfig, ServerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn command(parts: &[&str]) -> Message {
    Message::command(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())))
}

/// A server running in the background on an ephemeral port.
pub struct Running {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub task: JoinHandle<Result<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Running {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let server = Server::bind(ServerConfig { port: 0, ..config }).await?;
        let addr = server.local_addr()?;
        let state = server.state();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = signal.await;
        }));
        Ok(Self { addr, state, task, shutdown: Some(shutdown) })
    }

    pub async fn primary() -> Result<Self> {
        Self::start(ServerConfig::default()).await
    }

    pub async fn replica_of(primary: SocketAddr) -> Result<Self> {
        Self::start(ServerConfig {
            replica_of: Some(primary.to_string()),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn client(&self) -> Result<RespClient> {
        RespClient::connect(self.addr).await
    }

    /// Waits until this replica has completed its handshake.
    pub async fn wait_linked(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        eventually(|| state.replication.link_up()).await
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.task).await??
    }
}

pub async fn eventually<F>(mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            bail!("condition not reached within {WAIT:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Minimal RESP client over a raw socket.
pub struct RespClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = timeout(WAIT, TcpStream::connect(addr)).await??;
        Ok(Self { stream, buf: BytesMut::new() })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream, buf: BytesMut::new() }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn send(&mut self, parts: &[&str]) -> Result<()> {
        self.write_raw(&command(parts).to_bytes()).await
    }

    pub async fn read(&mut self) -> Result<Message> {
        timeout(WAIT, self.next_message()).await?
    }

    async fn next_message(&mut self) -> Result<Message> {
        loop {
            if let Some((message, used)) = decode(&self.buf)? {
                self.buf.advance(used);
                return Ok(message);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                bail!("connection closed");
            }
        }
    }

    pub async fn call(&mut self, parts: &[&str]) -> Result<Message> {
        self.send(parts).await?;
        self.read().await
    }

    /// Reads exactly `n` raw bytes, for payloads that are not framed messages.
    pub async fn read_exact_raw(&mut self, n: usize) -> Result<Bytes> {
        timeout(WAIT, self.fill(n)).await??;
        Ok(self.buf.split_to(n).freeze())
    }

    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                bail!("connection closed");
            }
        }
        Ok(())
    }
}
