//! Child process supervision.
//!
//! Every child the daemon spawns is owned by a reaper task. SIGTERM is sent
//! from inside that task while the child is still unreaped, so a PID is never
//! signalled after the kernel may have handed it to another process.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A supervised child.
#[derive(Debug)]
pub struct Supervised {
    pub pid: u32,
    /// Resolves once the child has exited and been reaped.
    pub exited: oneshot::Receiver<()>,
}

struct Entry {
    generation: u64,
    terminate: oneshot::Sender<()>,
}

/// Live children by PID.
#[derive(Clone, Default)]
pub struct ProcessTable {
    live: Arc<Mutex<HashMap<u32, Entry>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTable")
            .field("live", &lock(&self.live).len())
            .finish()
    }
}

impl ProcessTable {
    /// Hand `child` (whose PID is `pid`) over to a reaper task.
    pub fn supervise(&self, pid: u32, mut child: Child, name: String) -> Supervised {
        let (terminate_tx, mut terminate_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        lock(&self.live).insert(
            pid,
            Entry {
                generation,
                terminate: terminate_tx,
            },
        );

        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut terminate_rx => {
                    send_sigterm(pid);
                    child.wait().await
                }
            };

            match status {
                Ok(status) => info!(name = %name, pid, %status, "Process exited"),
                Err(e) => warn!(name = %name, pid, error = %e, "Failed to wait for process"),
            }

            {
                let mut live = lock(&live);
                if live.get(&pid).is_some_and(|e| e.generation == generation) {
                    live.remove(&pid);
                }
            }
            let _ = exited_tx.send(());
        });

        Supervised {
            pid,
            exited: exited_rx,
        }
    }

    /// Ask the child `pid` to exit.
    ///
    /// Returns false when `pid` is not a live child of this table, in which
    /// case nothing is signalled.
    pub fn terminate(&self, pid: u32) -> bool {
        match lock(&self.live).remove(&pid) {
            Some(entry) => entry.terminate.send(()).is_ok(),
            None => {
                debug!(pid, "Process already reaped, not signalling");
                false
            }
        }
    }

    /// Whether `pid` is a live child of this table.
    pub fn is_live(&self, pid: u32) -> bool {
        lock(&self.live).contains_key(&pid)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_sigterm(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "PID out of range, not signalling");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "Sent SIGTERM"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> (u32, Child) {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        (child.id().unwrap(), child)
    }

    #[tokio::test]
    async fn test_terminate_live_child() {
        let table = ProcessTable::default();
        let (pid, child) = spawn("sleep", &["30"]);
        let supervised = table.supervise(pid, child, "sleep".to_string());
        assert!(table.is_live(pid));

        assert!(table.terminate(pid));
        tokio::time::timeout(Duration::from_secs(5), supervised.exited)
            .await
            .unwrap()
            .unwrap();
        assert!(!table.is_live(pid));
    }

    #[tokio::test]
    async fn test_reaped_child_is_never_signalled() {
        let table = ProcessTable::default();
        let (pid, child) = spawn("true", &[]);
        let supervised = table.supervise(pid, child, "true".to_string());

        supervised.exited.await.unwrap();
        assert!(!table.is_live(pid));
        assert!(!table.terminate(pid));
    }

    #[tokio::test]
    async fn test_unknown_pid() {
        let table = ProcessTable::default();
        assert!(!table.terminate(i32::MAX as u32));
    }
}
