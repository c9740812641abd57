//! In-memory mounter and launcher for tests.
//!
//! Used by the unit tests and, with the `test-util` feature, by the
//! integration tests, so neither needs root privileges or g8ufs.

use crate::error::{Error, Result};
use crate::utils::launch::Launcher;
use crate::utils::mount::{MountHandle, MountRequest, Mounter};
use crate::utils::process::Supervised;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MounterState {
    mounted: Mutex<HashSet<PathBuf>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
}

/// Mounter that only records which targets are mounted.
#[derive(Clone, Default)]
pub struct FakeMounter {
    state: Arc<MounterState>,
    delay: Option<Duration>,
}

impl FakeMounter {
    /// Simulate mount latency, so concurrent requests overlap.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        lock(&self.state.mounted).contains(target)
    }

    pub fn mounted_count(&self) -> usize {
        lock(&self.state.mounted).len()
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.state.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unmounts(&self, fail: bool) {
        self.state.fail_unmount.store(fail, Ordering::SeqCst);
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, request: &MountRequest) -> impl Future<Output = Result<MountHandle>> + Send {
        let state = Arc::clone(&self.state);
        let delay = self.delay;
        let request = request.clone();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if state.fail_mount.load(Ordering::SeqCst) {
                return Err(Error::MountFailed {
                    target: request.target.display().to_string(),
                    reason: "store unreachable".to_string(),
                });
            }
            lock(&state.mounted).insert(request.target.clone());
            Ok(MountHandle::new(&request.target, &request.backend))
        }
    }

    fn unmount(&self, handle: &MountHandle) -> impl Future<Output = Result<()>> + Send {
        let result = if self.state.fail_unmount.load(Ordering::SeqCst) {
            Err(Error::UnmountFailed {
                target: handle.target.display().to_string(),
                reason: "device busy".to_string(),
            })
        } else {
            lock(&self.state.mounted).remove(&handle.target);
            Ok(())
        };
        std::future::ready(result)
    }
}

#[derive(Default)]
struct LauncherState {
    launched: AtomicU32,
    running: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    terminated: Mutex<Vec<u32>>,
}

/// Launcher that hands out PIDs starting at 1000.
///
/// A fake process runs until it is terminated or `exit` is called for it.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    /// PIDs that were asked to terminate, in order.
    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.state.terminated).clone()
    }

    /// Make `pid` exit on its own.
    pub fn exit(&self, pid: u32) {
        if let Some(exited) = lock(&self.state.running).remove(&pid) {
            let _ = exited.send(());
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        _root: &Path,
        _entrypoint: &str,
    ) -> impl Future<Output = Result<Supervised>> + Send {
        let pid = 1000 + self.state.launched.fetch_add(1, Ordering::SeqCst);
        let (exited_tx, exited) = oneshot::channel();
        lock(&self.state.running).insert(pid, exited_tx);
        std::future::ready(Ok(Supervised { pid, exited }))
    }

    fn terminate(&self, pid: u32) -> impl Future<Output = Result<()>> + Send {
        if let Some(exited) = lock(&self.state.running).remove(&pid) {
            lock(&self.state.terminated).push(pid);
            let _ = exited.send(());
        }
        std::future::ready(Ok(()))
    }
}
