//! Resolver lifecycle.
//!
//! [`Supervisor::start`] picks a port, patches the resolver config, launches
//! the resolver and publishes its endpoint; [`Supervisor::stop`] tears it
//! down. Neither returns an error: failures are logged and show up only as
//! an absent endpoint.

use crate::config::ResolverLayout;
use crate::endpoint::{EndpointReader, LiveEndpoint};
use crate::error::Result;
use crate::launch::{LaunchContext, Launcher, select_launcher};
use crate::patcher::{ConfigPatcher, TomlConfigPatcher};
use crate::port::{ListenerTable, SystemListeners, allocate};
use crate::watcher::ExitWatcher;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing running, no endpoint.
    Stopped,
    /// A start sequence is in progress.
    Starting,
    /// The resolver process is alive and its endpoint is published.
    Running,
    /// A stop sequence is in progress.
    Stopping,
}

/// The launch currently owned by the supervisor.
struct Running {
    launcher: Arc<dyn Launcher>,
    watcher: ExitWatcher,
}

/// Supervises one resolver instance.
///
/// `start` and `stop` take `&mut self`, so calls on one instance are
/// serialized by construction. The endpoint can be read concurrently through
/// [`endpoint_reader`](Self::endpoint_reader) clones.
///
/// # Example
///
/// ```rust,ignore
/// use resolver_supervisor::{ResolverLayout, Supervisor};
/// use tokio_util::sync::CancellationToken;
///
/// let mut supervisor = Supervisor::new(ResolverLayout::new("myapp"));
/// supervisor.start(&CancellationToken::new()).await;
///
/// if let Some(addr) = supervisor.local_endpoint() {
///     // send DNS queries to `addr`
/// }
///
/// supervisor.stop().await;
/// ```
pub struct Supervisor {
    layout: ResolverLayout,
    listeners: Arc<dyn ListenerTable>,
    patcher: Arc<dyn ConfigPatcher>,
    launcher: Option<Arc<dyn Launcher>>,
    endpoint: LiveEndpoint,
    state: SupervisorState,
    running: Option<Running>,
}

impl Supervisor {
    /// Creates a stopped supervisor using the system listener table, the
    /// TOML patcher and a launch strategy detected at each start.
    #[must_use]
    pub fn new(layout: ResolverLayout) -> Self {
        Self {
            layout,
            listeners: Arc::new(SystemListeners::new()),
            patcher: Arc::new(TomlConfigPatcher::new()),
            launcher: None,
            endpoint: LiveEndpoint::new(),
            state: SupervisorState::Stopped,
            running: None,
        }
    }

    /// Replaces the source of occupied ports.
    #[must_use]
    pub fn with_listeners(mut self, listeners: Arc<dyn ListenerTable>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Replaces the config patcher.
    #[must_use]
    pub fn with_patcher(mut self, patcher: Arc<dyn ConfigPatcher>) -> Self {
        self.patcher = patcher;
        self
    }

    /// Always uses `launcher` instead of detecting one per start.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// The layout this supervisor was built with.
    #[must_use]
    pub const fn layout(&self) -> &ResolverLayout {
        &self.layout
    }

    /// Address the resolver currently listens on, if it is running.
    #[must_use]
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.reader().get()
    }

    /// A cloneable, lock-free reader of the endpoint for other tasks.
    #[must_use]
    pub fn endpoint_reader(&self) -> EndpointReader {
        self.endpoint.reader()
    }

    /// Current lifecycle state. A resolver that exited on its own reports
    /// [`SupervisorState::Stopped`].
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        match (&self.state, &self.running) {
            (SupervisorState::Running, Some(running)) if running.watcher.has_exited() => {
                SupervisorState::Stopped
            }
            (SupervisorState::Running, _) if !self.endpoint.reader().is_live() => {
                SupervisorState::Stopped
            }
            (state, _) => *state,
        }
    }

    /// Pid of the supervised process, while it is being watched.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.running
            .as_ref()
            .filter(|r| !r.watcher.has_exited())
            .and_then(|r| r.watcher.pid())
    }

    /// Starts the resolver.
    ///
    /// Any previous launch is stopped first and the port is allocated
    /// afresh. Failures are logged; check [`local_endpoint`](Self::local_endpoint)
    /// to see whether the resolver came up. `cancel` aborts the config
    /// patching phase.
    pub async fn start(&mut self, cancel: &CancellationToken) {
        if self.running.is_some() {
            debug!(resolver = %self, "Stopping previous launch before restart");
            self.stop().await;
        }

        self.state = SupervisorState::Starting;
        match self.start_core(cancel).await {
            Ok(running) => {
                self.running = Some(running);
                self.state = SupervisorState::Running;
            }
            Err(e) => {
                warn!(resolver = %self, error = %e, "Failed to start resolver");
                self.endpoint.clear();
                self.state = SupervisorState::Stopped;
            }
        }
    }

    async fn start_core(&self, cancel: &CancellationToken) -> Result<Running> {
        let layout = &self.layout;
        let port = allocate(
            self.listeners.as_ref(),
            layout.listen_ip.into(),
            layout.port_floor,
        )
        .await?;
        let addr = SocketAddr::new(layout.listen_ip, port);

        let path = layout.config_path.as_path();
        self.patcher.set_listen_addresses(path, addr, cancel).await?;
        self.patcher
            .set_log_level(path, layout.log_level, cancel)
            .await?;
        self.patcher.set_edns_client_subnet(path, cancel).await?;

        let launcher = match &self.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => select_launcher(&LaunchContext::detect().await),
        };
        let handle = launcher.launch(layout).await?;

        let publication = self.endpoint.publish(addr);
        let watcher = ExitWatcher::spawn(
            handle,
            self.endpoint.clone(),
            publication,
            layout.poll_interval,
            self.to_string(),
        );
        info!(
            resolver = %self,
            endpoint = %addr,
            mode = %launcher.mode(),
            pid = ?watcher.pid(),
            "Resolver started"
        );
        Ok(Running { launcher, watcher })
    }

    /// Stops the resolver.
    ///
    /// Removes the service registration (service mode), then kills the
    /// process if it is still alive. Failures are logged; the endpoint is
    /// always absent afterwards. Stopping a stopped supervisor does nothing.
    pub async fn stop(&mut self) {
        let Some(Running { launcher, watcher }) = self.running.take() else {
            self.endpoint.clear();
            self.state = SupervisorState::Stopped;
            return;
        };
        self.state = SupervisorState::Stopping;

        if let Err(e) = launcher.teardown(&self.layout).await {
            warn!(resolver = %self, error = %e, "Failed to remove resolver service");
        }
        if let Err(e) = watcher.terminate().await {
            warn!(resolver = %self, error = %e, "Failed to kill resolver process");
        }

        self.endpoint.clear();
        self.state = SupervisorState::Stopped;
        info!(resolver = %self, "Resolver stopped");
    }
}

impl fmt::Display for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.layout.process_name)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("resolver", &self.layout.process_name)
            .field("state", &self.state())
            .field("endpoint", &self.local_endpoint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SupervisorError;
    use crate::launch::{LaunchMode, ProcessHandle};
    use crate::port::AddressFamily;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoListeners;

    #[async_trait]
    impl ListenerTable for NoListeners {
        async fn occupied_ports(&self, _family: AddressFamily) -> Result<HashSet<u16>> {
            Ok(HashSet::new())
        }
    }

    struct AllOccupied;

    #[async_trait]
    impl ListenerTable for AllOccupied {
        async fn occupied_ports(&self, _family: AddressFamily) -> Result<HashSet<u16>> {
            Ok((1..=u16::MAX).collect())
        }
    }

    struct NoopPatcher;

    #[async_trait]
    impl ConfigPatcher for NoopPatcher {
        async fn set_listen_addresses(
            &self,
            _path: &Path,
            _endpoint: SocketAddr,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn set_log_level(
            &self,
            _path: &Path,
            _level: u8,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn set_edns_client_subnet(
            &self,
            _path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Launcher that counts calls and always fails.
    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Launcher for CountingLauncher {
        fn mode(&self) -> LaunchMode {
            LaunchMode::ChildProcess
        }

        async fn launch(&self, _layout: &ResolverLayout) -> Result<ProcessHandle> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Err(SupervisorError::Launch("no binary".into()))
        }
    }

    fn supervisor(listeners: Arc<dyn ListenerTable>, launcher: Arc<dyn Launcher>) -> Supervisor {
        Supervisor::new(ResolverLayout::new("test"))
            .with_listeners(listeners)
            .with_patcher(Arc::new(NoopPatcher))
            .with_launcher(launcher)
    }

    #[tokio::test]
    async fn new_is_stopped() {
        let s = Supervisor::new(ResolverLayout::new("test"));
        assert_eq!(s.state(), SupervisorState::Stopped);
        assert_eq!(s.local_endpoint(), None);
        assert_eq!(s.pid(), None);
        assert_eq!(s.to_string(), "dnscrypt-proxy");
    }

    #[tokio::test]
    async fn port_exhaustion_skips_launch() {
        let launcher = Arc::new(CountingLauncher::default());
        let mut s = supervisor(Arc::new(AllOccupied), launcher.clone());

        s.start(&CancellationToken::new()).await;

        assert_eq!(s.state(), SupervisorState::Stopped);
        assert_eq!(s.local_endpoint(), None);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn launch_failure_leaves_supervisor_stopped() {
        let launcher = Arc::new(CountingLauncher::default());
        let mut s = supervisor(Arc::new(NoListeners), launcher.clone());

        s.start(&CancellationToken::new()).await;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(s.state(), SupervisorState::Stopped);
        assert_eq!(s.local_endpoint(), None);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let mut s = supervisor(Arc::new(NoListeners), Arc::new(CountingLauncher::default()));
        s.stop().await;
        s.stop().await;
        assert_eq!(s.state(), SupervisorState::Stopped);
        assert_eq!(s.local_endpoint(), None);
    }

    /// Service manager whose removal always fails. Each removal records
    /// whether the service process was still alive at that moment.
    #[cfg(unix)]
    struct FailingRemoval {
        pid: u32,
        installed: std::sync::atomic::AtomicBool,
        removals: std::sync::Mutex<Vec<bool>>,
    }

    #[cfg(unix)]
    #[async_trait]
    impl crate::service::ServiceControl for FailingRemoval {
        async fn stop_and_delete(&self, _name: &str) -> Result<()> {
            if !self.installed.load(Ordering::SeqCst) {
                // Leftover cleanup before install.
                return Ok(());
            }
            let alive = crate::util::is_process_alive(self.pid);
            self.removals.lock().unwrap().push(alive);
            Err(SupervisorError::Launch("access denied".into()))
        }

        async fn install_and_start(&self, _name: &str, _binary: &Path) -> Result<()> {
            self.installed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn service_pid(&self, _name: &str) -> Result<Option<u32>> {
            Ok(Some(self.pid))
        }
    }

    #[cfg(unix)]
    struct NoProcesses;

    #[cfg(unix)]
    #[async_trait]
    impl crate::service::ProcessLocator for NoProcesses {
        async fn find(&self, _process_name: &str, _session: u32) -> Result<Option<u32>> {
            Ok(None)
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_removes_service_before_kill_and_clears_on_failure() {
        use std::os::unix::process::ExitStatusExt;

        let mut service_process = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = service_process.id();
        let services = Arc::new(FailingRemoval {
            pid,
            installed: std::sync::atomic::AtomicBool::new(false),
            removals: std::sync::Mutex::new(Vec::new()),
        });
        let launcher = crate::service::ManagedServiceLauncher::new(
            services.clone(),
            Arc::new(NoProcesses),
        );
        let mut s = supervisor(Arc::new(NoListeners), Arc::new(launcher));
        let reader = s.endpoint_reader();

        s.start(&CancellationToken::new()).await;
        assert_eq!(s.pid(), Some(pid));
        assert!(reader.is_live());

        s.stop().await;

        assert_eq!(reader.get(), None);
        assert_eq!(s.state(), SupervisorState::Stopped);
        // Removed once, while the process was still running.
        assert_eq!(*services.removals.lock().unwrap(), vec![true]);
        let status = service_process.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_running_supervisor_withdraws_endpoint() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = ResolverLayout::new("test").with_dir(dir.path());
        std::fs::write(&layout.binary_path, "#!/bin/sh\nexec sleep 60\n").unwrap();
        std::fs::set_permissions(&layout.binary_path, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        let mut s = Supervisor::new(layout)
            .with_listeners(Arc::new(NoListeners))
            .with_patcher(Arc::new(NoopPatcher));
        let reader = s.endpoint_reader();

        s.start(&CancellationToken::new()).await;
        assert!(s.pid().is_some());
        assert!(reader.is_live());

        drop(s);

        assert_eq!(reader.get(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_old_watcher_keeps_newer_endpoint() {
        let live = LiveEndpoint::new();
        let old = live.publish(SocketAddr::from(([127, 0, 0, 1], 5533)));
        let watcher = ExitWatcher::spawn(
            ProcessHandle::Foreign { pid: 999_999_999 },
            live.clone(),
            old,
            std::time::Duration::from_secs(60),
            "test".to_string(),
        );
        let newer = SocketAddr::from(([127, 0, 0, 1], 5534));
        live.publish(newer);

        drop(watcher);
        assert_eq!(live.reader().get(), Some(newer));
    }
}
