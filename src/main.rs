use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use replikv::cli::Cli;
use replikv::server::Server;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config()?;
    let server = Server::bind(config).await?;
    let state = server.state();
    info!(
        addr = %server.local_addr()?,
        role = state.replication.role.as_str(),
        replid = %state.replication.replid,
        "listening"
    );

    if let Err(err) = server.run_until_ctrl_c().await {
        error!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
