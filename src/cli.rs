//! Command-line surface (spec §5): `api` serves the HTTP surface, `worker`
//! runs the job lifecycle (worker pool, cleanup scheduler, dynamic-config
//! refresh ticker) standalone. Both honor one shared shutdown signal.

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "refyne-core")]
#[command(about = "Refyne core engine: multi-tenant job lifecycle manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API server.
    Api(ApiArgs),

    /// Run the worker pool, cleanup scheduler, and dynamic-config ticker.
    Worker,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    /// Overrides `server.bind_addr` from the loaded config.
    #[arg(long)]
    pub address: Option<SocketAddr>,
}
