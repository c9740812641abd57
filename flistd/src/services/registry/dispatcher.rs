//! Registry Dispatcher - sole owner of the container map.

use super::{Command, Container, Status};
use crate::error::{Error, Result};
use crate::utils::mount::MountHandle;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Registry Dispatcher.
/// Receives commands and applies them to the container map one at a time.
pub struct RegistryDispatcher {
    command_rx: mpsc::Receiver<Command>,
    containers: HashMap<String, Container>,
    /// Container ids in insertion order.
    order: Vec<String>,
}

impl RegistryDispatcher {
    pub fn new(command_rx: mpsc::Receiver<Command>) -> Self {
        Self {
            command_rx,
            containers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Run the dispatcher loop until every `Registry` handle is dropped.
    pub async fn run(mut self) {
        debug!("Registry dispatcher running");

        while let Some(cmd) = self.command_rx.recv().await {
            self.handle_command(cmd);
        }

        debug!("Registry channel closed, shutting down");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert {
                container,
                responder,
            } => {
                let _ = responder.send(self.insert(container));
            }
            Command::Find { id, responder } => {
                let _ = responder.send(self.containers.get(&id).cloned());
            }
            Command::SetStatus {
                id,
                status,
                responder,
            } => {
                let _ = responder.send(self.set_status(&id, status));
            }
            Command::Transition {
                id,
                from,
                to,
                responder,
            } => {
                let _ = responder.send(self.transition(&id, from, to));
            }
            Command::Activate {
                id,
                mount,
                pid,
                responder,
            } => {
                let _ = responder.send(self.activate(&id, mount, pid));
            }
            Command::ClearPid { id, pid, responder } => {
                let _ = responder.send(self.clear_pid(&id, pid));
            }
            Command::Remove { id, responder } => {
                let _ = responder.send(self.remove(&id));
            }
            Command::List { responder } => {
                let _ = responder.send(self.list());
            }
        }
    }

    fn insert(&mut self, container: Container) -> Result<()> {
        if self.containers.contains_key(&container.id) {
            return Err(Error::DuplicateId(container.id));
        }

        info!(id = %container.id, status = %container.status, "Registered container");
        self.order.push(container.id.clone());
        self.containers.insert(container.id.clone(), container);
        Ok(())
    }

    fn set_status(&mut self, id: &str, status: Status) -> Result<()> {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        debug!(id, from = %container.status, to = %status, "Status change");
        container.status = status;
        Ok(())
    }

    fn transition(&mut self, id: &str, from: &[Status], to: Status) -> Result<Container> {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !from.contains(&container.status) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                expected: join_statuses(from),
                actual: container.status,
            });
        }

        let before = container.clone();
        debug!(id, from = %container.status, to = %to, "Status change");
        container.status = to;
        Ok(before)
    }

    fn activate(&mut self, id: &str, mount: MountHandle, pid: Option<u32>) -> Result<Container> {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if container.status != Status::Creating {
            return Err(Error::InvalidState {
                id: id.to_string(),
                expected: Status::Creating.to_string(),
                actual: container.status,
            });
        }

        container.mount = mount;
        container.pid = pid;
        container.status = Status::Running;
        Ok(container.clone())
    }

    fn clear_pid(&mut self, id: &str, pid: u32) -> Result<bool> {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if container.pid != Some(pid) {
            return Ok(false);
        }
        debug!(id, pid, "Entrypoint gone");
        container.pid = None;
        Ok(true)
    }

    fn remove(&mut self, id: &str) -> Result<Container> {
        let container = self
            .containers
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        self.order.retain(|existing| existing != id);
        info!(id, "Removed container");
        Ok(container)
    }

    fn list(&self) -> Vec<Container> {
        self.order
            .iter()
            .filter_map(|id| self.containers.get(id))
            .cloned()
            .collect()
    }
}

fn join_statuses(statuses: &[Status]) -> String {
    statuses
        .iter()
        .map(Status::to_string)
        .collect::<Vec<_>>()
        .join(" or ")
}
