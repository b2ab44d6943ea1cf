//! Background exit watcher.
//!
//! The watcher task owns the process handle. It ends when the process exits
//! or when asked to kill it, and in either case withdraws its own endpoint
//! publication exactly once. Dropping the watcher withdraws it as well.

use crate::endpoint::{LiveEndpoint, Publication};
use crate::error::{Result, SupervisorError};
use crate::launch::ProcessHandle;
use crate::util::{is_process_alive, kill_process};
use std::io;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type KillReply = oneshot::Sender<io::Result<()>>;

/// Handle to a running watcher task.
#[derive(Debug)]
pub(crate) struct ExitWatcher {
    kill: Option<oneshot::Sender<KillReply>>,
    task: JoinHandle<()>,
    pid: Option<u32>,
    endpoint: LiveEndpoint,
    publication: Publication,
    resolver: String,
}

impl ExitWatcher {
    /// Starts watching `handle`. When it exits, `publication` is withdrawn
    /// from `endpoint`.
    pub(crate) fn spawn(
        handle: ProcessHandle,
        endpoint: LiveEndpoint,
        publication: Publication,
        poll_interval: Duration,
        resolver: String,
    ) -> Self {
        let pid = handle.pid();
        let (kill_tx, kill_rx) = oneshot::channel();
        let task = {
            let endpoint = endpoint.clone();
            let publication = publication.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                let killed = match handle {
                    ProcessHandle::Child(child) => watch_child(&resolver, child, kill_rx).await,
                    ProcessHandle::Foreign { pid } => {
                        watch_foreign(&resolver, pid, poll_interval, kill_rx).await
                    }
                };
                if endpoint.clear_if(&publication) && !killed {
                    info!(resolver = %resolver, pid = ?pid, "Resolver exited, endpoint withdrawn");
                }
            })
        };
        Self {
            kill: Some(kill_tx),
            task,
            pid,
            endpoint,
            publication,
            resolver,
        }
    }

    /// Process id being watched.
    pub(crate) const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns `true` once the process has exited or been killed.
    pub(crate) fn has_exited(&self) -> bool {
        self.task.is_finished()
    }

    /// Kills the process if it is still running and waits for the watcher
    /// to finish.
    pub(crate) async fn terminate(mut self) -> Result<()> {
        let Some(kill) = self.kill.take() else {
            return Ok(());
        };
        if self.task.is_finished() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if kill.send(reply_tx).is_err() {
            // The process exited between the check and the send.
            return Ok(());
        }
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SupervisorError::Teardown(e.to_string())),
            Err(_) => {}
        }
        if let Err(e) = (&mut self.task).await {
            warn!(resolver = %self.resolver, error = %e, "Exit watcher task failed");
        }
        Ok(())
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        // The aborted task never reaches its own withdrawal.
        self.endpoint.clear_if(&self.publication);
        // Dropping the task drops an owned child, which `kill_on_drop` kills.
        self.task.abort();
    }
}

/// Returns `true` if the exit was caused by a kill request.
async fn watch_child(
    resolver: &str,
    mut child: tokio::process::Child,
    mut kill_rx: oneshot::Receiver<KillReply>,
) -> bool {
    let mut kill_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(resolver, %status, "Resolver process exited"),
                    Err(e) => warn!(resolver, error = %e, "Failed to wait on resolver process"),
                }
                return false;
            }
            request = &mut kill_rx, if kill_open => match request {
                Ok(reply) => {
                    let _ = reply.send(child.kill().await);
                    return true;
                }
                Err(_) => kill_open = false,
            },
        }
    }
}

/// Returns `true` if the exit was caused by a kill request.
async fn watch_foreign(
    resolver: &str,
    pid: u32,
    poll_interval: Duration,
    mut kill_rx: oneshot::Receiver<KillReply>,
) -> bool {
    let mut interval = tokio::time::interval(poll_interval);
    let mut kill_open = true;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let alive = tokio::task::spawn_blocking(move || is_process_alive(pid))
                    .await
                    .unwrap_or(false);
                if !alive {
                    info!(resolver, pid, "Resolver process is gone");
                    return false;
                }
            }
            request = &mut kill_rx, if kill_open => match request {
                Ok(reply) => {
                    let result = tokio::task::spawn_blocking(move || kill_process(pid))
                        .await
                        .unwrap_or_else(|e| Err(io::Error::other(e)));
                    let _ = reply.send(result);
                    return true;
                }
                Err(_) => kill_open = false,
            },
        }
    }
}
