//! flistd - flist mount and container lifecycle daemon.

use clap::Parser;
use flistd::{Config, run_daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "flistd")]
#[command(version = VERSION)]
#[command(about = "Mounts flists and manages their containers over a Unix socket")]
struct Args {
    /// Control socket path
    #[arg(long, default_value = flistd::SOCKET_PATH)]
    socket: PathBuf,

    /// Local cache for store blocks
    #[arg(long, default_value = "/var/lib/flist/store")]
    store: PathBuf,

    /// Parent directory for container mounts
    #[arg(long, default_value = "/var/lib/flist/containers")]
    containers: PathBuf,

    /// Parent directory for per-container unpack directories
    #[arg(long, default_value = "/var/lib/flist/tmp")]
    tmp: PathBuf,

    /// Remote block store
    #[arg(long, default_value = "zdb://hub.grid.tf:9900")]
    storage_url: String,

    /// Path to the g8ufs binary
    #[arg(long, default_value = "g8ufs")]
    g8ufs: PathBuf,

    /// Seconds a client may take to send its command
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Seconds to wait for a mount to come up
    #[arg(long, default_value_t = 60)]
    mount_timeout: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            socket_path: args.socket,
            store_dir: args.store,
            containers_dir: args.containers,
            tmp_dir: args.tmp,
            storage_url: args.storage_url,
            g8ufs_path: args.g8ufs,
            request_timeout: Duration::from_secs(args.request_timeout),
            mount_timeout: Duration::from_secs(args.mount_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flistd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!(version = VERSION, socket = %args.socket.display(), "flistd starting");

    match run_daemon(args.into()).await {
        Ok(()) => {
            info!("flistd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "flistd failed");
            ExitCode::FAILURE
        }
    }
}
