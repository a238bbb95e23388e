use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use radar_relay::{
    broker::Broker,
    cli::{Cli, Command},
    client, publisher,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let broker = Broker::bind(args.into()).await?;
            info!("broker listening on {}", broker.tcp_addr()?);
            info!("websocket listening on {}", broker.http_addr()?);
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Subscribe(args) => client::run(args).await?,
        Command::PublishDemo(args) => publisher::run_demo(args).await?,
    }

    Ok(())
}
