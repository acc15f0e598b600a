use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    config::{ClientSettings, ServerSettings},
    server::Server,
};

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout carries chat traffic, so logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let settings = ServerSettings::load(&args)?;
            init_tracing(settings.mode.default_log_filter());

            let server = Server::bind(&settings).await?;
            let addr = server.local_addr()?;
            info!(mode = ?settings.mode, policy = ?settings.read_error_policy, "server ready");
            println!("chat server listening on {addr}");
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            let settings = ClientSettings::load(&args)?;
            init_tracing("info");
            client::run(settings).await?;
        }
    }

    Ok(())
}
