//! Container Registry - the daemon-wide record of known containers.
//!
//! A single `RegistryDispatcher` task owns the container map. Every worker
//! holds a cloned `Registry` handle and talks to that one task, so all
//! connections observe the same state and mutations are serialized.

mod dispatcher;

pub use dispatcher::RegistryDispatcher;

use crate::error::{Error, Result};
use crate::utils::mount::MountHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Id reserved, mount in progress.
    Creating,
    /// Mounted. The entrypoint may already have exited, in which case the
    /// container's `pid` is cleared.
    Running,
    /// Claimed by a stop or forced unmount.
    Stopping,
    Stopped,
    /// Claimed by rm.
    Removing,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Removing => "removing",
        };
        f.pad(s)
    }
}

/// A container tracked by the registry.
///
/// The mount handle is plain data, so any worker can tear the mount down,
/// not only the one that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    /// Directory the flist is mounted on.
    pub path: PathBuf,
    pub status: Status,
    pub meta_url: String,
    pub entrypoint: String,
    /// PID of the entrypoint process, once launched.
    pub pid: Option<u32>,
    pub mount: MountHandle,
}

/// Commands that can be sent to the registry.
#[derive(Debug)]
pub enum Command {
    Insert {
        container: Container,
        responder: oneshot::Sender<Result<()>>,
    },
    Find {
        id: String,
        responder: oneshot::Sender<Option<Container>>,
    },
    SetStatus {
        id: String,
        status: Status,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Compare-and-set of the status. Answers with the entry as it was before.
    Transition {
        id: String,
        from: &'static [Status],
        to: Status,
        responder: oneshot::Sender<Result<Container>>,
    },
    /// Move a `creating` entry to `running` with its live mount and pid.
    Activate {
        id: String,
        mount: MountHandle,
        pid: Option<u32>,
        responder: oneshot::Sender<Result<Container>>,
    },
    /// Forget the entrypoint pid once that process is gone.
    ClearPid {
        id: String,
        pid: u32,
        responder: oneshot::Sender<Result<bool>>,
    },
    Remove {
        id: String,
        responder: oneshot::Sender<Result<Container>>,
    },
    List {
        responder: oneshot::Sender<Vec<Container>>,
    },
}

/// Cloneable handle to the registry task.
#[derive(Debug, Clone)]
pub struct Registry {
    command_tx: mpsc::Sender<Command>,
}

impl Registry {
    /// Spawn the registry task and return a handle to it.
    pub fn spawn() -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let dispatcher = RegistryDispatcher::new(command_rx);
        tokio::spawn(async move {
            dispatcher.run().await;
        });
        Self { command_tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (responder, rx) = oneshot::channel();
        self.command_tx
            .send(build(responder))
            .await
            .map_err(|_| Error::RegistryUnavailable)?;
        rx.await.map_err(|_| Error::RegistryUnavailable)
    }

    /// Add a new container. Fails with `DuplicateId` if the id is taken.
    pub async fn insert(&self, container: Container) -> Result<()> {
        self.request(|responder| Command::Insert {
            container,
            responder,
        })
        .await?
    }

    pub async fn find(&self, id: &str) -> Result<Option<Container>> {
        self.request(|responder| Command::Find {
            id: id.to_string(),
            responder,
        })
        .await
    }

    pub async fn set_status(&self, id: &str, status: Status) -> Result<()> {
        self.request(|responder| Command::SetStatus {
            id: id.to_string(),
            status,
            responder,
        })
        .await?
    }

    /// Atomically move `id` from any of `from` to `to`.
    ///
    /// Returns the container as it was before the transition.
    pub async fn transition(
        &self,
        id: &str,
        from: &'static [Status],
        to: Status,
    ) -> Result<Container> {
        self.request(|responder| Command::Transition {
            id: id.to_string(),
            from,
            to,
            responder,
        })
        .await?
    }

    pub async fn activate(
        &self,
        id: &str,
        mount: MountHandle,
        pid: Option<u32>,
    ) -> Result<Container> {
        self.request(|responder| Command::Activate {
            id: id.to_string(),
            mount,
            pid,
            responder,
        })
        .await?
    }

    /// Clear the container's pid if it is still `pid`.
    ///
    /// Returns whether anything changed.
    pub async fn clear_pid(&self, id: &str, pid: u32) -> Result<bool> {
        self.request(|responder| Command::ClearPid {
            id: id.to_string(),
            pid,
            responder,
        })
        .await?
    }

    pub async fn remove(&self, id: &str) -> Result<Container> {
        self.request(|responder| Command::Remove {
            id: id.to_string(),
            responder,
        })
        .await?
    }

    /// All containers in insertion order.
    pub async fn list(&self) -> Result<Vec<Container>> {
        self.request(|responder| Command::List { responder }).await
    }
}
