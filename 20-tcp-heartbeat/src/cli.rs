use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};

use crate::{
    client::ClientConfig,
    heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
    net::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_BUFFER},
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept TCP connections and send every peer a periodic PING.
    Server(ServerArgs),
    /// Connect to a server and send the given messages.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host name or address to listen on.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Milliseconds between heartbeat probes.
    #[arg(
        long,
        default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub heartbeat_ms: u64,

    /// Maximum number of bytes taken from a connection per read.
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER)]
    pub read_buffer: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the server.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port of the server.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of bytes taken from the connection per read.
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER)]
    pub read_buffer: usize,

    /// Message to send once connected. Repeat to send several, in order.
    #[arg(long = "message", default_value = "Test Message!")]
    pub messages: Vec<String>,

    /// Half-close the connection after the messages are sent.
    #[arg(long)]
    pub half_close: bool,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
            read_buffer_size: args.read_buffer,
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            read_buffer_size: args.read_buffer,
            half_close_when_drained: args.half_close,
        }
    }
}

impl ClientArgs {
    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages
            .iter()
            .map(|message| Bytes::from(message.clone()))
            .collect()
    }
}
