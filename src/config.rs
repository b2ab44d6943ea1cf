//! Resolver installation layout.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Executable and directory name of the supervised resolver.
pub const RESOLVER_NAME: &str = "dnscrypt-proxy";

/// Lowest port handed to the resolver.
pub const DEFAULT_PORT_FLOOR: u16 = 5533;

/// dnscrypt-proxy log level `6`: fatal errors only.
pub const DEFAULT_LOG_LEVEL: u8 = 6;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the resolver lives and how it is started.
///
/// # Example
///
/// ```
/// use resolver_supervisor::ResolverLayout;
///
/// let layout = ResolverLayout::new("myapp").with_port_floor(6000);
///
/// assert_eq!(layout.service_name, "myapp.dnscrypt-proxy");
/// assert_eq!(layout.process_name, "dnscrypt-proxy");
/// assert_eq!(layout.port_floor, 6000);
/// ```
#[derive(Debug, Clone)]
pub struct ResolverLayout {
    /// OS process name used to find the resolver after a service start.
    pub process_name: String,

    /// Service registration name, namespaced by the host application.
    pub service_name: String,

    /// Path to the resolver executable.
    pub binary_path: PathBuf,

    /// Path to the resolver's TOML configuration file.
    pub config_path: PathBuf,

    /// Address the resolver is told to listen on. Its family also selects
    /// which listener table is scanned for free ports.
    pub listen_ip: IpAddr,

    /// Lowest candidate port.
    pub port_floor: u16,

    /// Log level written into the resolver config.
    pub log_level: u8,

    /// How often a process that is not our child is checked for exit.
    pub poll_interval: Duration,
}

impl ResolverLayout {
    /// Creates the default layout under `./dnscrypt-proxy/`, with the service
    /// name prefixed by `namespace`.
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        let dir = Path::new(RESOLVER_NAME);
        let exe = if cfg!(windows) {
            format!("{RESOLVER_NAME}.exe")
        } else {
            RESOLVER_NAME.to_string()
        };
        Self {
            process_name: RESOLVER_NAME.to_string(),
            service_name: format!("{namespace}.{RESOLVER_NAME}"),
            binary_path: dir.join(exe),
            config_path: dir.join(format!("{RESOLVER_NAME}.toml")),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_floor: DEFAULT_PORT_FLOOR,
            log_level: DEFAULT_LOG_LEVEL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Points the layout at a different resolver directory (useful for
    /// testing). The binary keeps its file name, the config becomes
    /// `<dir>/<process_name>.toml`.
    #[must_use]
    pub fn with_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        if let Some(exe) = self.binary_path.file_name() {
            self.binary_path = dir.join(exe);
        }
        self.config_path = dir.join(format!("{}.toml", self.process_name));
        self
    }

    /// Overrides the executable path.
    #[must_use]
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = path.into();
        self
    }

    /// Overrides the config file path.
    #[must_use]
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Overrides the listen address.
    #[must_use]
    pub const fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// Overrides the port floor.
    #[must_use]
    pub const fn with_port_floor(mut self, floor: u16) -> Self {
        self.port_floor = floor;
        self
    }

    /// Overrides the exit poll interval for foreign processes.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Directory the resolver is started from: the binary's own directory.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        match self.binary_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}
