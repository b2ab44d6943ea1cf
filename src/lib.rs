//! # resolver-supervisor
//!
//! Run a local `dnscrypt-proxy` resolver and always know where it listens.
//!
//! The [`Supervisor`] finds a free loopback port, rewrites the resolver's
//! TOML config to listen there, starts the resolver and publishes the
//! endpoint. When the resolver exits, or when [`Supervisor::stop`] is
//! called, the endpoint is withdrawn. Downstream code only ever asks "where
//! is the resolver right now?" and gets an address or `None`.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use resolver_supervisor::{ResolverLayout, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut supervisor = Supervisor::new(ResolverLayout::new("myapp"));
//! supervisor.start(&CancellationToken::new()).await;
//!
//! // Hand a reader to the query path.
//! let endpoint = supervisor.endpoint_reader();
//! match endpoint.get() {
//!     Some(addr) => println!("resolver at {addr}"),
//!     None => println!("resolver unavailable, falling back"),
//! }
//!
//! supervisor.stop().await;
//! ```
//!
//! ## Failure model
//!
//! `start` and `stop` never return errors. Port exhaustion, config write
//! failures, spawn or service failures are logged with `tracing` at `warn`
//! level, and the endpoint stays absent. The host application keeps working
//! without the resolver.
//!
//! ## Launch modes
//!
//! On Windows, a process running in the non-interactive system session
//! installs the resolver as an on-demand service (`<namespace>.dnscrypt-proxy`)
//! and then watches the service's process. Everywhere else the resolver is a
//! plain child process started from its own directory.
//!
//! ## Ports
//!
//! The lowest port at or above 5533 that no TCP listener or UDP socket of
//! the listen address's family holds is chosen on every start. The choice is
//! not a reservation; another process can still win the race for it.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod launch;
pub mod patcher;
pub mod port;
pub mod service;
pub mod supervisor;
pub mod util;
mod watcher;

pub use config::ResolverLayout;
pub use endpoint::EndpointReader;
pub use error::{Result, SupervisorError};
pub use launch::{
    ChildProcessLauncher, LaunchContext, LaunchMode, Launcher, ProcessHandle, SessionKind,
};
pub use patcher::{ConfigPatcher, TomlConfigPatcher};
pub use port::{AddressFamily, ListenerTable, SystemListeners, allocate, first_free_port};
pub use service::{ManagedServiceLauncher, ProcessLocator, ServiceControl};
pub use supervisor::{Supervisor, SupervisorState};
