use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::connection::OUTBOUND_CAPACITY;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve tables over HTTP and WebSocket.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9876")]
    pub listen: SocketAddr,

    /// SQLite file holding every table. `:memory:` keeps tables in memory only.
    #[arg(long, default_value = "sheets.db")]
    pub database: PathBuf,

    /// Replies buffered per connection before a slow client is disconnected.
    #[arg(long, default_value_t = OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Seconds to wait for connections to drain on shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl ServeArgs {
    pub fn in_memory(&self) -> bool {
        self.database.as_os_str() == ":memory:"
    }
}
