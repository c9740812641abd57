//! Flist mounting through the external `g8ufs` filesystem daemon.
//!
//! `g8ufs` builds the overlay for a flist and stays in the foreground for as
//! long as the mount exists. The daemon only needs to start it, wait for the
//! target to show up in the mount table, and later detach the target.

use crate::error::{Error, Result};
use crate::utils::process::ProcessTable;
use nix::mount::{MntFlags, umount2};
use std::ffi::OsString;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Interval between mount table polls while waiting for a mount.
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to mount and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub meta_url: String,
    /// Directory the flist will be visible at.
    pub target: PathBuf,
    /// Per-container read-write staging directory.
    pub backend: PathBuf,
}

/// Everything needed to tear a mount down again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub target: PathBuf,
    pub backend: PathBuf,
    /// PID of the filesystem process serving the mount.
    pub pid: Option<u32>,
}

impl MountHandle {
    pub fn new(target: impl Into<PathBuf>, backend: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            backend: backend.into(),
            pid: None,
        }
    }
}

/// Capability to realize a flist as a directory tree and tear it down.
pub trait Mounter: Send + Sync + 'static {
    fn mount(&self, request: &MountRequest) -> impl Future<Output = Result<MountHandle>> + Send;

    /// Unmount `handle`. Unmounting something that is no longer mounted succeeds.
    fn unmount(&self, handle: &MountHandle) -> impl Future<Output = Result<()>> + Send;
}

/// `Mounter` backed by the `g8ufs` executable.
#[derive(Debug, Clone)]
pub struct G8ufsMounter {
    binary: PathBuf,
    storage_url: String,
    cache_dir: PathBuf,
    ready_timeout: Duration,
    processes: ProcessTable,
}

impl G8ufsMounter {
    pub fn new(
        binary: PathBuf,
        storage_url: String,
        cache_dir: PathBuf,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            storage_url,
            cache_dir,
            ready_timeout,
            processes: ProcessTable::default(),
        }
    }

    fn command_args(&self, request: &MountRequest) -> Vec<OsString> {
        vec![
            "--meta".into(),
            request.meta_url.clone().into(),
            "--storage-url".into(),
            self.storage_url.clone().into(),
            "--cache".into(),
            self.cache_dir.clone().into(),
            "--backend".into(),
            request.backend.clone().into(),
            request.target.clone().into(),
        ]
    }

    async fn mount_impl(&self, request: &MountRequest) -> Result<MountHandle> {
        let target = request.target.display().to_string();
        let failed = |reason: String| Error::MountFailed {
            target: target.clone(),
            reason,
        };

        if is_mounted(&request.target) {
            return Err(failed("target is already a mount point".to_string()));
        }

        info!(
            binary = %self.binary.display(),
            meta = %request.meta_url,
            target = %request.target.display(),
            "Starting g8ufs"
        );

        let mut child = Command::new(&self.binary)
            .args(self.command_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| failed(format!("failed to execute {}: {e}", self.binary.display())))?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if is_mounted(&request.target) {
                break;
            }

            if let Some(status) = child.try_wait()? {
                return Err(failed(format!("g8ufs exited early with {status}")));
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(failed(format!(
                    "not mounted after {}s",
                    self.ready_timeout.as_secs()
                )));
            }

            tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
        }

        let pid = child.id();
        info!(target = %request.target.display(), pid = ?pid, "Flist mounted");

        // g8ufs exits once the mount goes away.
        if let Some(pid) = pid {
            self.processes
                .supervise(pid, child, format!("g8ufs {}", request.target.display()));
        }

        Ok(MountHandle {
            target: request.target.clone(),
            backend: request.backend.clone(),
            pid,
        })
    }

    async fn unmount_impl(&self, handle: &MountHandle) -> Result<()> {
        let target = handle.target.clone();

        if is_mounted(&target) {
            info!(target = %target.display(), "Unmounting flist");
            let detach_target = target.clone();
            tokio::task::spawn_blocking(move || umount2(&detach_target, MntFlags::MNT_DETACH))
                .await
                .map_err(|e| Error::UnmountFailed {
                    target: target.display().to_string(),
                    reason: e.to_string(),
                })?
                .map_err(|e| Error::UnmountFailed {
                    target: target.display().to_string(),
                    reason: e.to_string(),
                })?;
        } else {
            debug!(target = %target.display(), "Not mounted, nothing to detach");
        }

        if let Some(pid) = handle.pid {
            self.processes.terminate(pid);
        }

        Ok(())
    }
}

impl Mounter for G8ufsMounter {
    fn mount(&self, request: &MountRequest) -> impl Future<Output = Result<MountHandle>> + Send {
        self.mount_impl(request)
    }

    fn unmount(&self, handle: &MountHandle) -> impl Future<Output = Result<()>> + Send {
        self.unmount_impl(handle)
    }
}

/// Whether `target` currently appears in the mount table.
pub fn is_mounted(target: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mount_table_contains(&mounts, target)
}

fn mount_table_contains(table: &str, target: &Path) -> bool {
    let wanted = target.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|field| unescape_mount_field(field) == wanted)
}

/// Undo the octal escaping /proc/mounts applies to whitespace and backslashes.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
