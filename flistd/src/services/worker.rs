//! Worker - serves exactly one client connection.
//!
//! `Connected → Decoded → Dispatched → Completed | Failed → Closed`. Every
//! failure, including a malformed request, ends only this connection.

use crate::error::{Error, Result};
use crate::protocol::{self, CommandKind, Request, Response};
use crate::services::container::ContainerService;
use crate::services::registry::Container;
use crate::utils::launch::Launcher;
use crate::utils::mount::Mounter;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub struct Worker<S, M, L> {
    stream: S,
    service: ContainerService<M, L>,
    /// Deadline for the client to deliver its request.
    request_timeout: Duration,
}

impl<S, M, L> Worker<S, M, L>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    M: Mounter,
    L: Launcher,
{
    pub fn new(stream: S, service: ContainerService<M, L>, request_timeout: Duration) -> Self {
        Self {
            stream,
            service,
            request_timeout,
        }
    }

    /// Decode one request, execute it, write the response and close.
    pub async fn serve(mut self) {
        let response = match self.handle().await {
            Ok(containers) => Response::containers(containers),
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "Command failed");
                Response::from(&e)
            }
        };

        if let Err(e) = protocol::write_response(&mut self.stream, &response).await {
            debug!(error = %e, "Client went away before the response was written");
        }
        let _ = self.stream.shutdown().await;
    }

    async fn handle(&mut self) -> Result<Vec<Container>> {
        let request = tokio::time::timeout(
            self.request_timeout,
            protocol::read_request(&mut self.stream),
        )
        .await
        .map_err(|_| Error::Timeout("command".to_string()))??;

        info!(
            command = ?request.command,
            container = %request.container_name,
            "Dispatching command"
        );
        dispatch(&self.service, &request).await
    }
}

/// Execute a decoded request against the container service.
pub async fn dispatch<M: Mounter, L: Launcher>(
    service: &ContainerService<M, L>,
    request: &Request,
) -> Result<Vec<Container>> {
    match request.command {
        CommandKind::Run => service.run(request).await.map(|c| vec![c]),
        CommandKind::Stop => service.stop(&request.container_name).await.map(|c| vec![c]),
        CommandKind::Rm => service.remove(&request.container_name).await.map(|c| vec![c]),
        CommandKind::Ps => service.list(&request.container_name).await,
    }
}
