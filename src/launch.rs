//! Launch strategies.
//!
//! A [`Launcher`] turns a [`ResolverLayout`] into a running process. The
//! strategy is picked once per start from the [`LaunchContext`]:
//! a Windows process running in the non-interactive system session (for
//! example a host application that itself runs as a service) registers the
//! resolver as a service; everything else spawns it as a child.

use crate::config::ResolverLayout;
use crate::error::{Result, SupervisorError};
use crate::service::{ManagedServiceLauncher, SYSTEM_SESSION};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// How the resolver was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Spawned as our own child process.
    ChildProcess,
    /// Registered and started through the OS service manager.
    ManagedService,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildProcess => f.write_str("child-process"),
            Self::ManagedService => f.write_str("managed-service"),
        }
    }
}

/// Session the calling process is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A user's interactive session.
    Interactive,
    /// The non-interactive system session (Windows session 0).
    System,
}

/// Platform and session classification for one start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchContext {
    /// Whether the platform has a service manager the resolver can use.
    pub service_capable: bool,
    /// Session of the calling process.
    pub session: SessionKind,
}

impl LaunchContext {
    /// Classifies the current process.
    ///
    /// Only Windows is service-capable. If the session id cannot be read
    /// the session is treated as interactive.
    pub async fn detect() -> Self {
        if !cfg!(windows) {
            return Self {
                service_capable: false,
                session: SessionKind::Interactive,
            };
        }
        let session = match crate::service::current_session_id().await {
            Ok(Some(SYSTEM_SESSION)) => SessionKind::System,
            Ok(_) => SessionKind::Interactive,
            Err(e) => {
                debug!(error = %e, "Could not read session id, assuming interactive");
                SessionKind::Interactive
            }
        };
        Self {
            service_capable: true,
            session,
        }
    }

    /// The strategy this context calls for.
    #[must_use]
    pub fn mode(&self) -> LaunchMode {
        if self.service_capable && self.session == SessionKind::System {
            LaunchMode::ManagedService
        } else {
            LaunchMode::ChildProcess
        }
    }
}

/// Returns the default launcher for `context`.
#[must_use]
pub fn select_launcher(context: &LaunchContext) -> Arc<dyn Launcher> {
    match context.mode() {
        LaunchMode::ChildProcess => Arc::new(ChildProcessLauncher::new()),
        LaunchMode::ManagedService => Arc::new(ManagedServiceLauncher::system()),
    }
}

/// A started resolver process.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Our own child; exit is observed through `wait()`.
    Child(Child),
    /// A process started by someone else (the service manager); exit is
    /// observed by polling.
    Foreign {
        /// OS process id.
        pid: u32,
    },
}

impl ProcessHandle {
    /// OS process id, if the process has not been reaped yet.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Child(child) => child.id(),
            Self::Foreign { pid } => Some(*pid),
        }
    }
}

/// Starts and tears down the resolver in one particular way.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Which strategy this is.
    fn mode(&self) -> LaunchMode;

    /// Starts the resolver and returns a handle to its process.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Launch`] if the process could not be
    /// started or found.
    async fn launch(&self, layout: &ResolverLayout) -> Result<ProcessHandle>;

    /// Releases anything besides the process itself, such as a service
    /// registration. Killing the process is not part of this.
    async fn teardown(&self, _layout: &ResolverLayout) -> Result<()> {
        Ok(())
    }
}

/// Spawns the resolver directly as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildProcessLauncher;

impl ChildProcessLauncher {
    /// Creates the launcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[async_trait]
impl Launcher for ChildProcessLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::ChildProcess
    }

    async fn launch(&self, layout: &ResolverLayout) -> Result<ProcessHandle> {
        // Resolve before `current_dir` so a relative binary path means the
        // same thing on every platform.
        let binary = std::path::absolute(&layout.binary_path)?;
        let workdir = std::path::absolute(layout.working_dir())?;

        let mut cmd = Command::new(&binary);
        cmd.current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|e| {
            SupervisorError::Launch(format!("failed to spawn {}: {e}", binary.display()))
        })?;
        info!(
            binary = %binary.display(),
            pid = ?child.id(),
            "Spawned resolver process"
        );
        Ok(ProcessHandle::Child(child))
    }
}
