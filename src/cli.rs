use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::types::{ServerConfig, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Redis-compatible key-value server with primary/replica replication", long_about = None)]
pub struct Cli {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Run as a replica of the given primary: "<host> <port>" or "<host>:<port>".
    #[arg(long, num_args = 1..=2, value_name = "PRIMARY")]
    pub replicaof: Option<Vec<String>>,

    /// Detach a replica after this many propagated commands in a row could not be written.
    #[arg(long, value_name = "N")]
    pub evict_replica_after: Option<u32>,
}

impl Cli {
    pub fn into_config(self) -> Result<ServerConfig> {
        let replica_of = self.replicaof.map(|parts| parse_primary(&parts)).transpose()?;
        Ok(ServerConfig {
            bind: self.bind,
            port: self.port,
            replica_of,
            evict_replica_after: self.evict_replica_after,
        })
    }
}

/// Normalizes the accepted spellings of a primary address to `host:port`.
fn parse_primary(parts: &[String]) -> Result<String> {
    let joined = parts.join(" ");
    let (host, port) = match joined.split_whitespace().collect::<Vec<_>>().as_slice() {
        [host, port] => (host.to_string(), port.to_string()),
        [single] => match single.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => bail!("primary address '{joined}' has no port"),
        },
        _ => bail!("invalid primary address '{joined}'"),
    };
    if host.is_empty() {
        bail!("primary address '{joined}' has no host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid primary port '{port}'"))?;
    Ok(format!("{host}:{port}"))
}
