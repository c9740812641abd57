//! flistctl - command line client for flistd.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use flistd::client;
use flistd::protocol::{ContainerInfo, Request, Response};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flistctl")]
#[command(version)]
#[command(about = "Control a running flistd")]
struct Args {
    /// Control socket path
    #[arg(long, default_value = flistd::SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a flist and start its entrypoint
    Run {
        /// Flist locator
        meta_url: String,
        /// Program to run inside the mount
        #[arg(long, default_value = "/bin/sh")]
        entrypoint: String,
        /// Container name (generated when omitted)
        #[arg(long, default_value = "")]
        name: String,
        /// Mount directory (defaults to the daemon's containers directory)
        #[arg(long, default_value = "")]
        mountpoint: String,
    },
    /// Stop a container and unmount its flist
    Stop { name: String },
    /// Remove a container
    Rm { name: String },
    /// List containers
    Ps {
        /// Show only this container
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let request = match args.command {
        Command::Run {
            meta_url,
            entrypoint,
            name,
            mountpoint,
        } => Request::run(meta_url, entrypoint, name, mountpoint),
        Command::Stop { name } => Request::stop(name),
        Command::Rm { name } => Request::rm(name),
        Command::Ps { name } => Request::ps(name.unwrap_or_default()),
    };

    match client::send(&args.socket, &request).await? {
        Response::Ok { containers } => {
            print_table(&containers);
            Ok(())
        }
        Response::Error { kind, message } => bail!("{kind:?}: {message}"),
    }
}

fn print_table(containers: &[ContainerInfo]) {
    println!("{:<38} {:<10} {:<8} PATH", "ID", "STATUS", "PID");
    for c in containers {
        let pid = c.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:<10} {:<8} {}", c.id, c.status, pid, c.path);
    }
}
