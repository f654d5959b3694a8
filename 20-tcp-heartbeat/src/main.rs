use anyhow::Result;
use clap::Parser;

use tcp_heartbeat::{
    cli::{Cli, Command},
    client, server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => server::start(&(&args).into()),
        Command::Client(args) => client::start(&(&args).into(), args.payloads()),
    }
}
