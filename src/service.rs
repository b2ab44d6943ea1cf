//! Service-mode launching on Windows.
//!
//! The resolver is registered as an on-demand service, started, and its
//! process is then looked up so it can be watched and killed like a child.
//! The default collaborators shell out to `sc.exe` and `tasklist`; both are
//! behind traits so the launcher can be exercised anywhere.

use crate::config::ResolverLayout;
use crate::error::{Result, SupervisorError};
use crate::launch::{LaunchMode, Launcher, ProcessHandle};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Session id of the non-interactive system session.
pub const SYSTEM_SESSION: u32 = 0;

/// `ERROR_SERVICE_DOES_NOT_EXIST`
const SC_NO_SUCH_SERVICE: i32 = 1060;
/// `ERROR_SERVICE_NOT_ACTIVE`
const SC_NOT_ACTIVE: i32 = 1062;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STOP_POLL_ATTEMPTS: u32 = 40;

/// The OS service manager, reduced to what the supervisor needs.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Stops and deletes `name`. A missing or stopped service is not an
    /// error.
    async fn stop_and_delete(&self, name: &str) -> Result<()>;

    /// Registers `name` as an on-demand service running `binary` and
    /// starts it.
    async fn install_and_start(&self, name: &str, binary: &Path) -> Result<()>;

    /// Process id of the running service, if the manager reports one.
    async fn service_pid(&self, name: &str) -> Result<Option<u32>>;
}

/// Finds a running process by image name and session.
#[async_trait]
pub trait ProcessLocator: Send + Sync {
    /// Returns the first process named `process_name` in `session`.
    async fn find(&self, process_name: &str, session: u32) -> Result<Option<u32>>;
}

/// Launches the resolver through a [`ServiceControl`].
pub struct ManagedServiceLauncher {
    services: Arc<dyn ServiceControl>,
    processes: Arc<dyn ProcessLocator>,
    session: u32,
}

impl ManagedServiceLauncher {
    /// Creates a launcher from explicit collaborators.
    #[must_use]
    pub fn new(services: Arc<dyn ServiceControl>, processes: Arc<dyn ProcessLocator>) -> Self {
        Self {
            services,
            processes,
            session: SYSTEM_SESSION,
        }
    }

    /// Creates a launcher backed by `sc.exe` and `tasklist`.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(ScServiceControl), Arc::new(TasklistLocator))
    }

    /// The service's own pid when the manager knows it, otherwise the first
    /// process with the resolver's name in the system session.
    async fn locate(&self, layout: &ResolverLayout) -> Result<Option<u32>> {
        match self.services.service_pid(&layout.service_name).await {
            Ok(Some(pid)) => return Ok(Some(pid)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Service pid query failed, falling back to name lookup"),
        }
        self.processes.find(&layout.process_name, self.session).await
    }
}

#[async_trait]
impl Launcher for ManagedServiceLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::ManagedService
    }

    async fn launch(&self, layout: &ResolverLayout) -> Result<ProcessHandle> {
        let name = &layout.service_name;
        let binary = std::path::absolute(&layout.binary_path)?;

        // Leftover from a run that never cleaned up.
        self.services.stop_and_delete(name).await?;
        self.services.install_and_start(name, &binary).await?;

        let Some(pid) = self.locate(layout).await? else {
            if let Err(e) = self.services.stop_and_delete(name).await {
                warn!(service = %name, error = %e, "Failed to remove service after lookup failure");
            }
            return Err(SupervisorError::Launch(format!(
                "service {name} started but no {} process was found",
                layout.process_name
            )));
        };

        info!(service = %name, pid, "Started resolver service");
        Ok(ProcessHandle::Foreign { pid })
    }

    async fn teardown(&self, layout: &ResolverLayout) -> Result<()> {
        self.services
            .stop_and_delete(&layout.service_name)
            .await
            .map_err(|e| SupervisorError::Teardown(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// sc.exe
// ---------------------------------------------------------------------------

/// [`ServiceControl`] driving `sc.exe`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScServiceControl;

impl ScServiceControl {
    async fn sc(args: &[&str]) -> Result<Output> {
        Ok(Command::new("sc.exe")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?)
    }

    async fn wait_stopped(name: &str) -> Result<()> {
        for _ in 0..STOP_POLL_ATTEMPTS {
            let out = Self::sc(&["query", name]).await?;
            if out.status.code() == Some(SC_NO_SUCH_SERVICE)
                || String::from_utf8_lossy(&out.stdout).contains("STOPPED")
            {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Err(SupervisorError::Launch(format!("service {name} did not stop")))
    }
}

fn sc_failure(action: &str, name: &str, out: &Output) -> SupervisorError {
    let text = String::from_utf8_lossy(&out.stdout);
    SupervisorError::Launch(format!(
        "sc {action} {name} failed ({}): {}",
        out.status,
        text.trim()
    ))
}

#[async_trait]
impl ServiceControl for ScServiceControl {
    async fn stop_and_delete(&self, name: &str) -> Result<()> {
        let out = Self::sc(&["stop", name]).await?;
        match out.status.code() {
            Some(SC_NO_SUCH_SERVICE) => return Ok(()),
            Some(0 | SC_NOT_ACTIVE) => {}
            _ => return Err(sc_failure("stop", name, &out)),
        }
        Self::wait_stopped(name).await?;

        let out = Self::sc(&["delete", name]).await?;
        match out.status.code() {
            Some(0 | SC_NO_SUCH_SERVICE) => {
                debug!(service = %name, "Service removed");
                Ok(())
            }
            _ => Err(sc_failure("delete", name, &out)),
        }
    }

    async fn install_and_start(&self, name: &str, binary: &Path) -> Result<()> {
        let bin_path = format!("\"{}\"", binary.display());
        let out = Self::sc(&["create", name, "binPath=", &bin_path, "start=", "demand"]).await?;
        if !out.status.success() {
            return Err(sc_failure("create", name, &out));
        }
        let out = Self::sc(&["start", name]).await?;
        if !out.status.success() {
            return Err(sc_failure("start", name, &out));
        }
        Ok(())
    }

    async fn service_pid(&self, name: &str) -> Result<Option<u32>> {
        let out = Self::sc(&["queryex", name]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(parse_queryex_pid(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// Reads `PID : 1234` from `sc queryex` output. Pid 0 means not running.
fn parse_queryex_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "PID")
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|pid| *pid != 0)
}

// ---------------------------------------------------------------------------
// tasklist
// ---------------------------------------------------------------------------

/// One row of `tasklist /FO CSV /NH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    /// Image name, e.g. `dnscrypt-proxy.exe`.
    pub image: String,
    /// Process id.
    pub pid: u32,
    /// Session number.
    pub session: u32,
}

/// [`ProcessLocator`] driving `tasklist`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TasklistLocator;

#[async_trait]
impl ProcessLocator for TasklistLocator {
    async fn find(&self, process_name: &str, session: u32) -> Result<Option<u32>> {
        let entries = tasklist(&["/FI", &format!("SESSION eq {session}")]).await?;
        Ok(first_match(&entries, process_name, session))
    }
}

/// Session id of the current process, if `tasklist` reports it.
pub(crate) async fn current_session_id() -> Result<Option<u32>> {
    let pid = std::process::id();
    let entries = tasklist(&["/FI", &format!("PID eq {pid}")]).await?;
    Ok(entries.iter().find(|e| e.pid == pid).map(|e| e.session))
}

async fn tasklist(filters: &[&str]) -> Result<Vec<TaskEntry>> {
    let out = Command::new("tasklist")
        .args(filters)
        .args(["/FO", "CSV", "/NH"])
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(parse_tasklist(&String::from_utf8_lossy(&out.stdout)))
}

/// Parses CSV rows like
/// `"dnscrypt-proxy.exe","4242","Services","0","12,345 K"`.
///
/// Lines that are not rows (such as the "no tasks" notice) are skipped.
fn parse_tasklist(output: &str) -> Vec<TaskEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix('"')?.strip_suffix('"')?;
            let cols: Vec<&str> = line.split("\",\"").collect();
            Some(TaskEntry {
                image: (*cols.first()?).to_string(),
                pid: cols.get(1)?.parse().ok()?,
                session: cols.get(3)?.parse().ok()?,
            })
        })
        .collect()
}

/// First entry whose image is `process_name` (with or without `.exe`,
/// case-insensitive) in `session`. Same-named processes in one session are
/// not told apart.
fn first_match(entries: &[TaskEntry], process_name: &str, session: u32) -> Option<u32> {
    entries
        .iter()
        .find(|e| {
            let image = e.image.to_ascii_lowercase();
            let stem = image.strip_suffix(".exe").unwrap_or(&image);
            e.session == session && stem.eq_ignore_ascii_case(process_name)
        })
        .map(|e| e.pid)
}
