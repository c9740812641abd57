//! Entrypoint launching inside a mounted flist.

use crate::error::{Error, Result};
use crate::utils::process::{ProcessTable, Supervised};
use std::ffi::CString;
use std::future::Future;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Capability to start and stop a container's entrypoint process.
pub trait Launcher: Send + Sync + 'static {
    /// Start `entrypoint` with `root` as its root directory.
    fn launch(
        &self,
        root: &Path,
        entrypoint: &str,
    ) -> impl Future<Output = Result<Supervised>> + Send;

    /// Ask the process to exit. A process that has already been reaped is
    /// left alone and is not an error.
    fn terminate(&self, pid: u32) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the entrypoint chrooted into the mount.
#[derive(Debug, Clone, Default)]
pub struct ChrootLauncher {
    processes: ProcessTable,
}

impl ChrootLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    async fn launch_impl(&self, root: &Path, entrypoint: &str) -> Result<Supervised> {
        let failed = |reason: String| Error::LaunchFailed {
            entrypoint: entrypoint.to_string(),
            reason,
        };

        let (program, args) = split_entrypoint(entrypoint)
            .ok_or_else(|| failed("entrypoint is empty".to_string()))?;

        let root_c = CString::new(root.as_os_str().as_bytes())
            .map_err(|_| failed("root path contains a NUL byte".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .stdin(Stdio::null());

        // SAFETY: chroot(2) and chdir(2) are async-signal-safe and the path
        // is allocated before fork.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::chroot(root_c.as_c_str())?;
                nix::unistd::chdir("/")?;
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| failed("process exited before its PID was read".to_string()))?;

        info!(entrypoint, root = %root.display(), pid, "Entrypoint started");

        Ok(self.processes.supervise(pid, child, entrypoint.to_string()))
    }
}

impl Launcher for ChrootLauncher {
    fn launch(
        &self,
        root: &Path,
        entrypoint: &str,
    ) -> impl Future<Output = Result<Supervised>> + Send {
        self.launch_impl(root, entrypoint)
    }

    fn terminate(&self, pid: u32) -> impl Future<Output = Result<()>> + Send {
        self.processes.terminate(pid);
        std::future::ready(Ok(()))
    }
}

/// Split an entrypoint command line into program and arguments.
fn split_entrypoint(entrypoint: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = entrypoint.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_entrypoint() {
        assert_eq!(
            split_entrypoint("/bin/sh -c  'sleep'"),
            Some(("/bin/sh", vec!["-c", "'sleep'"]))
        );
        assert_eq!(split_entrypoint("/sbin/init"), Some(("/sbin/init", vec![])));
        assert_eq!(split_entrypoint("   "), None);
    }

    #[tokio::test]
    async fn test_empty_entrypoint_is_rejected() {
        let err = ChrootLauncher::new()
            .launch(Path::new("/"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_terminate_unknown_process() {
        // Not a child of this launcher, so nothing is signalled.
        ChrootLauncher::new().terminate(1).await.unwrap();
    }
}
