use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use xferbench::driver::{self, DriverOptions};
use xferbench::engine::TransportCredentials;
use xferbench::{Agent, FileServer};

const DEFAULT_CLIENT_ADDR: &str = "localhost:8443";
const DEFAULT_SERVER_ADDR: &str = "localhost:9443";

/// Distributed synthetic load generator for HTTP bulk file transfer.
#[derive(Debug, Parser)]
#[command(name = "xferbench")]
#[command(version = env!("XFERBENCH_VERSION"), about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a file server answering download requests
    Server(ServerArgs),
    /// Start a client process that executes load requests from the driver
    Client(ClientArgs),
    /// Run a test campaign against one or more clients
    Driver(DriverArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Network address to listen on (host:port)
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    addr: String,

    /// PEM file with the certificates of the accepted client CAs
    #[arg(long, default_value = "ca.pem")]
    ca: PathBuf,

    /// PEM file with the certificate this server presents
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,

    /// PEM file with the private key of the server certificate
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,

    /// Serve plain HTTP instead of TLS
    #[arg(long = "plain-http", default_value_t = false)]
    plain_http: bool,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Network address to listen on for driver instructions (host:port)
    #[arg(long, default_value = DEFAULT_CLIENT_ADDR)]
    addr: String,

    /// PEM file with the certificates of the trusted server CAs
    #[arg(long, default_value = "ca.pem")]
    ca: PathBuf,

    /// PEM file with the certificate this client presents to servers
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM file with the private key of the client certificate
    #[arg(long)]
    key: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DriverArgs {
    /// Comma-separated client agent addresses (host:port)
    #[arg(long, default_value = DEFAULT_CLIENT_ADDR)]
    clients: String,

    /// Comma-separated file server addresses (host:port)
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    servers: String,

    /// Campaign duration in seconds
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// Concurrent downloads per client (0 = twice the client's CPU count)
    #[arg(long, default_value_t = 0)]
    concurrency: usize,

    /// Mean file size in MB; actual sizes follow a normal distribution
    #[arg(long, default_value_t = 100)]
    size: u64,

    /// Use HTTP/1.1 for downloads instead of the default HTTP/2
    #[arg(long, default_value_t = false)]
    http1: bool,

    /// Use plain HTTP (no TLS) on the data plane
    #[arg(long = "plain-http", default_value_t = false)]
    plain_http: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client(args) => run_client(args).await,
        Commands::Driver(args) => run_driver(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let server = if args.plain_http {
        FileServer::new_plain(&args.addr)
    } else {
        FileServer::new(&args.addr, &args.cert, &args.key, &args.ca)?
    };
    server.serve().await
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let credentials = TransportCredentials {
        ca: args.ca,
        cert: args.cert,
        key: args.key,
    };
    Agent::new(&args.addr, credentials).run().await
}

async fn run_driver(args: DriverArgs) -> anyhow::Result<()> {
    driver::run(&DriverOptions {
        clients: args.clients,
        servers: args.servers,
        duration_secs: args.duration,
        concurrency: args.concurrency,
        mean_size_mb: args.size,
        use_http1: args.http1,
        plain_http: args.plain_http,
    })
    .await
}
