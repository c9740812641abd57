//! Unix socket acceptor.
//!
//! Binds the control socket and spawns one `Worker` per accepted connection.
//! There is no limit on concurrent workers.

use crate::error::Result;
use crate::services::container::ContainerService;
use crate::services::worker::Worker;
use crate::utils::launch::Launcher;
use crate::utils::mount::Mounter;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

/// The bound control socket.
///
/// Dropping the server removes the socket file.
pub struct Server<M, L> {
    listener: UnixListener,
    socket_path: PathBuf,
    service: ContainerService<M, L>,
    request_timeout: Duration,
}

impl<M: Mounter, L: Launcher> Server<M, L> {
    /// Bind the socket at `socket_path`, replacing a stale socket file.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        socket_path: &Path,
        service: ContainerService<M, L>,
        request_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Listening");

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            service,
            request_timeout,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until accepting fails.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            debug!("Accepted connection");

            let worker = Worker::new(stream, self.service.clone(), self.request_timeout);
            tokio::spawn(worker.serve());
        }
    }

    /// Accept connections until `shutdown` resolves or accepting fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown => {
                info!("Stopped accepting connections");
                Ok(())
            }
        }
    }
}

impl<M, L> Drop for Server<M, L> {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}
