use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use causal_chat::{cli::Cli, clock::LamportClock, dispatcher::Dispatcher, request::RequestChannel};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let clock = Arc::new(LamportClock::new());

    let channel = RequestChannel::connect(cli.broker, Arc::clone(&clock), cli.reply_timeout())
        .await
        .with_context(|| format!("failed to connect to the broker at {}", cli.broker))?;

    Dispatcher::new(channel, clock, cli.feed).run().await
}
