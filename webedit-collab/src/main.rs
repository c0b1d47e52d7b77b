use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use webedit_collab::server::shutdown_signal;
use webedit_collab::{CollabServer, ServerConfig};

/// Real-time collaborative editing server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "8001")]
    port: u16,
    /// Seconds between heartbeat pings
    #[clap(long, default_value = "20")]
    ping_interval: u64,
    /// Seconds to wait for a pong before dropping the connection
    #[clap(long, default_value = "10")]
    ping_timeout: u64,
    /// Outbound frames buffered per connection before it is evicted
    #[clap(long, default_value = "256")]
    outbox_capacity: usize,
    /// Directory for durable file storage (in-memory only if omitted)
    #[clap(long)]
    storage_path: Option<PathBuf>,
    /// File saves buffered for the storage writer
    #[clap(long, default_value = "1024")]
    persist_queue: usize,
    /// Seconds to wait for connections to drain on shutdown
    #[clap(long, default_value = "5")]
    shutdown_grace: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: format!("{}:{}", args.host, args.port),
            outbox_capacity: args.outbox_capacity,
            ping_interval: Duration::from_secs(args.ping_interval),
            ping_timeout: Duration::from_secs(args.ping_timeout),
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            storage_path: args.storage_path,
            persist_queue: args.persist_queue,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    log::info!("Starting collaboration server on {}", config.bind_addr);

    let server = match CollabServer::open(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
