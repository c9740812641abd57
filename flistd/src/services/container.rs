//! Container Service - run, stop, rm and ps against the shared registry.
//!
//! Every worker gets a clone of the same `ContainerService`, so the registry,
//! mounter and launcher are shared daemon-wide. Mount handles are read back
//! from the registry, which lets any connection stop or remove a container
//! created by another one.

use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::services::registry::{Container, Registry, Status};
use crate::utils::launch::Launcher;
use crate::utils::mount::{MountHandle, MountRequest, Mounter};
use crate::utils::process::Supervised;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared container lifecycle operations.
pub struct ContainerService<M, L> {
    inner: Arc<Inner<M, L>>,
}

struct Inner<M, L> {
    registry: Registry,
    mounter: M,
    launcher: L,
    /// Default parent of mount directories.
    containers_dir: PathBuf,
    /// Parent of per-container backend directories.
    tmp_dir: PathBuf,
}

impl<M, L> Clone for ContainerService<M, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Mounter, L: Launcher> ContainerService<M, L> {
    pub fn new(
        registry: Registry,
        mounter: M,
        launcher: L,
        containers_dir: PathBuf,
        tmp_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                mounter,
                launcher,
                containers_dir,
                tmp_dir,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Mount the requested flist, launch its entrypoint and register it.
    pub async fn run(&self, request: &Request) -> Result<Container> {
        if request.meta_url.is_empty() {
            return Err(Error::InvalidRequest("run requires metaURL".to_string()));
        }
        if request.entrypoint.trim().is_empty() {
            return Err(Error::InvalidRequest("run requires entrypoint".to_string()));
        }

        let id = if request.container_name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            validate_id(&request.container_name)?;
            request.container_name.clone()
        };

        let target = if request.mountpoint.is_empty() {
            self.inner.containers_dir.join(&id)
        } else {
            let mountpoint = PathBuf::from(&request.mountpoint);
            if !mountpoint.is_absolute() {
                return Err(Error::InvalidRequest(format!(
                    "mountpoint must be absolute: {}",
                    request.mountpoint
                )));
            }
            mountpoint
        };
        let backend = self.inner.tmp_dir.join(&id);

        // Reserve the id first so concurrent runs with the same name collide here.
        let reserved = Container {
            id: id.clone(),
            path: target.clone(),
            status: Status::Creating,
            meta_url: request.meta_url.clone(),
            entrypoint: request.entrypoint.clone(),
            pid: None,
            mount: MountHandle::new(&target, &backend),
        };
        self.inner.registry.insert(reserved.clone()).await?;

        match self.start(&reserved).await {
            Ok(container) => {
                info!(id = %container.id, path = %container.path.display(), "Container running");
                Ok(container)
            }
            Err(e) => {
                error!(id = %id, error = %e, "Failed to run container");
                // Directories go first, while the reservation still holds the id.
                if let Err(cleanup_err) = self.cleanup(&reserved).await {
                    warn!(id = %id, error = %cleanup_err, "Cleanup after failed run incomplete");
                }
                if let Err(remove_err) = self.inner.registry.remove(&id).await {
                    warn!(id = %id, error = %remove_err, "Failed to drop reservation");
                }
                Err(e)
            }
        }
    }

    async fn start(&self, reserved: &Container) -> Result<Container> {
        let request = MountRequest {
            meta_url: reserved.meta_url.clone(),
            target: reserved.mount.target.clone(),
            backend: reserved.mount.backend.clone(),
        };

        for dir in [&request.target, &request.backend] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::MountFailed {
                    target: request.target.display().to_string(),
                    reason: format!("failed to create {}: {e}", dir.display()),
                })?;
        }

        let handle = self.inner.mounter.mount(&request).await?;

        let process = match self
            .inner
            .launcher
            .launch(&request.target, &reserved.entrypoint)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                if let Err(unmount_err) = self.inner.mounter.unmount(&handle).await {
                    warn!(id = %reserved.id, error = %unmount_err, "Failed to unmount after launch failure");
                }
                return Err(e);
            }
        };

        let container = self
            .inner
            .registry
            .activate(&reserved.id, handle, Some(process.pid))
            .await?;
        self.watch_entrypoint(reserved.id.clone(), process);

        Ok(container)
    }

    /// Clear the registry pid once the entrypoint has been reaped.
    fn watch_entrypoint(&self, id: String, process: Supervised) {
        let registry = self.inner.registry.clone();
        tokio::spawn(async move {
            if process.exited.await.is_err() {
                return;
            }
            match registry.clear_pid(&id, process.pid).await {
                Ok(true) => info!(id = %id, pid = process.pid, "Entrypoint exited"),
                // Already terminated by stop/rm, or the container is gone.
                Ok(false) | Err(_) => {}
            }
        });
    }

    /// Stop a container: terminate its entrypoint and unmount it.
    ///
    /// Stopping an already stopped container succeeds without side effects.
    pub async fn stop(&self, name: &str) -> Result<Container> {
        let name = require_name(name, "stop")?;

        let current = self
            .inner
            .registry
            .find(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if current.status == Status::Stopped {
            return Ok(current);
        }

        let claimed = self
            .inner
            .registry
            .transition(name, &[Status::Running], Status::Stopping)
            .await?;

        if let Err(e) = self.teardown(&claimed).await {
            self.mark_status(name, Status::Running).await;
            return Err(e);
        }

        self.inner.registry.set_status(name, Status::Stopped).await?;
        info!(id = name, "Container stopped");

        Ok(Container {
            status: Status::Stopped,
            pid: None,
            ..claimed
        })
    }

    /// Remove a container, unmounting it first if it is still running.
    ///
    /// Directory cleanup failures are reported as `CleanupFailed`, but the
    /// registry entry is removed regardless.
    pub async fn remove(&self, name: &str) -> Result<Container> {
        let name = require_name(name, "rm")?;

        let claimed = self
            .inner
            .registry
            .transition(name, &[Status::Running, Status::Stopped], Status::Removing)
            .await?;

        if claimed.status == Status::Running
            && let Err(e) = self.teardown(&claimed).await
        {
            self.mark_status(name, claimed.status).await;
            return Err(e);
        }

        // Clean up while the entry still reserves the id.
        let cleanup = self.cleanup(&claimed).await;

        let removed = self.inner.registry.remove(name).await?;
        info!(id = name, "Container removed");

        cleanup?;
        Ok(Container {
            status: Status::Stopped,
            ..removed
        })
    }

    /// List containers. A non-empty `name` selects a single container.
    pub async fn list(&self, name: &str) -> Result<Vec<Container>> {
        if name.is_empty() {
            return self.inner.registry.list().await;
        }

        self.inner
            .registry
            .find(name)
            .await?
            .map(|c| vec![c])
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Force-unmount every running container and mark it stopped.
    ///
    /// Failures are logged and leave the container running. Returns how many
    /// containers were stopped.
    pub async fn stop_all(&self) -> usize {
        let containers = match self.inner.registry.list().await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "Cannot list containers for forced unmount");
                return 0;
            }
        };

        let mut stopped = 0;
        for container in containers
            .into_iter()
            .filter(|c| c.status == Status::Running)
        {
            let id = container.id;
            let claimed = match self
                .inner
                .registry
                .transition(&id, &[Status::Running], Status::Stopping)
                .await
            {
                Ok(claimed) => claimed,
                // Stopped or removed by a worker in the meantime
                Err(_) => continue,
            };

            match self.teardown(&claimed).await {
                Ok(()) => {
                    self.mark_status(&id, Status::Stopped).await;
                    info!(id = %id, "Container force-unmounted");
                    stopped += 1;
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Forced unmount failed");
                    self.mark_status(&id, Status::Running).await;
                }
            }
        }

        stopped
    }

    /// Terminate the entrypoint and unmount.
    ///
    /// The pid is cleared once the entrypoint has been asked to exit, so a
    /// container left `running` after a failed unmount has no entrypoint.
    async fn teardown(&self, container: &Container) -> Result<()> {
        if let Some(pid) = container.pid {
            if let Err(e) = self.inner.launcher.terminate(pid).await {
                warn!(id = %container.id, pid, error = %e, "Failed to terminate entrypoint");
            }
            if let Err(e) = self.inner.registry.clear_pid(&container.id, pid).await {
                warn!(id = %container.id, pid, error = %e, "Failed to clear entrypoint pid");
            }
        }

        self.inner.mounter.unmount(&container.mount).await
    }

    async fn mark_status(&self, id: &str, status: Status) {
        if let Err(e) = self.inner.registry.set_status(id, status).await {
            warn!(id, status = %status, error = %e, "Failed to update container status");
        }
    }

    /// Remove the backend directory and, if the daemon created it, the mount directory.
    async fn cleanup(&self, container: &Container) -> Result<()> {
        let mut first_failure = None;

        let backend = &container.mount.backend;
        if let Err(e) = tokio::fs::remove_dir_all(backend).await
            && e.kind() != IoErrorKind::NotFound
        {
            warn!(path = %backend.display(), error = %e, "Failed to remove backend directory");
            first_failure.get_or_insert((backend.clone(), e));
        }

        // Only the directory itself; a non-empty mountpoint is left alone.
        let target = &container.mount.target;
        if self.owns_mountpoint(target)
            && let Err(e) = tokio::fs::remove_dir(target).await
            && e.kind() != IoErrorKind::NotFound
        {
            warn!(path = %target.display(), error = %e, "Failed to remove mount directory");
            first_failure.get_or_insert((target.clone(), e));
        }

        match first_failure {
            None => Ok(()),
            Some((path, e)) => Err(Error::CleanupFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn owns_mountpoint(&self, target: &Path) -> bool {
        target.parent() == Some(self.inner.containers_dir.as_path())
    }
}

fn require_name<'a>(name: &'a str, command: &str) -> Result<&'a str> {
    if name.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "{command} requires containerName"
        )));
    }
    Ok(name)
}

/// Container ids become directory names.
fn validate_id(id: &str) -> Result<()> {
    if id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(Error::InvalidRequest(format!("invalid containerName: {id:?}")));
    }
    Ok(())
}
