use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::commands::{self, Command, CommandName};
use crate::handler::{self, ConnectionKind, Job};
use crate::replica;
use crate::resp;
use crate::types::{ServerConfig, ServerState};

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds the listener. Port 0 picks an ephemeral port, which is then
    /// recorded in the config so a replica announces the real one.
    pub async fn bind(mut config: ServerConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        config.port = listener.local_addr()?.port();
        let state = Arc::new(ServerState::new(config)?);
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown` resolves. Returns an error if this is a
    /// replica and the link to its primary could not be established.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        let (jobs, queue) = mpsc::unbounded_channel();
        let executor = tokio::spawn(run_executor(Arc::clone(&state), queue));

        let mut link = state
            .config
            .replica_of
            .clone()
            .map(|primary| tokio::spawn(replica::run_link(primary, Arc::clone(&state), jobs.clone())));

        tokio::pin!(shutdown);
        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let state = Arc::clone(&state);
                        let jobs = jobs.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler::handle_client(stream, state, jobs).await {
                                debug!(%peer, error = %e, "connection closed");
                            }
                        });
                    }
                    Err(e) => warn!(error = ?e, "accept error"),
                },
                joined = wait_link(&mut link) => {
                    link = None;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = ?e, "replication link could not be established");
                            break Err(e);
                        }
                        Err(e) => break Err(e).context("replication link task failed"),
                    }
                }
            }
        };

        if let Some(link) = link {
            link.abort();
        }
        executor.abort();
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn wait_link(link: &mut Option<JoinHandle<Result<()>>>) -> Result<Result<()>, JoinError> {
    match link {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// The single consumer of the command queue. Every store mutation happens here.
async fn run_executor(state: Arc<ServerState>, mut queue: UnboundedReceiver<Job>) {
    while let Some(job) = queue.recv().await {
        execute_job(&state, job);
    }
    debug!("command queue closed");
}

fn execute_job(state: &ServerState, job: Job) {
    let Job { conn, message } = job;
    let Some(command) = Command::from_message(message) else {
        debug!(conn = conn.id(), "ignoring non-command message");
        return;
    };

    let result = commands::execute(state, &command);
    let resync = command.name == CommandName::Psync && result.is_ok();
    let reply = result.unwrap_or_else(|e| e.to_message());

    if conn.kind() == ConnectionKind::PrimaryLink && !command.is_getack() {
        return;
    }
    conn.send_reply(reply.to_bytes());

    if resync {
        let mut out = BytesMut::with_capacity(state.snapshot.len() + 16);
        resp::encode_snapshot(&state.snapshot, &mut out);
        conn.send_reply(out.freeze());
        state.replication.propagator.attach(conn.clone());
        info!(
            replica = conn.id(),
            replicas = state.replication.propagator.replica_count(),
            "replica attached"
        );
    }
}
