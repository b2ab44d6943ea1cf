//! The published resolver endpoint.
//!
//! Readers load it lock-free from any thread. Only the supervisor publishes;
//! the supervisor and the exit watcher clear.

use arc_swap::ArcSwapOption;
use std::net::SocketAddr;
use std::sync::Arc;

/// Read-only view of the current resolver endpoint.
///
/// Cheap to clone; all clones observe the same value.
#[derive(Debug, Clone, Default)]
pub struct EndpointReader {
    slot: Arc<ArcSwapOption<SocketAddr>>,
}

impl EndpointReader {
    /// The address the resolver currently listens on, or `None` if it is not
    /// running.
    #[must_use]
    pub fn get(&self) -> Option<SocketAddr> {
        self.slot.load().as_deref().copied()
    }

    /// Returns `true` if an endpoint is published.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.slot.load().is_some()
    }
}

/// One publication of an endpoint. Identity, not value, is what matters:
/// republishing the same address yields a different publication.
#[derive(Debug, Clone)]
pub(crate) struct Publication(Arc<SocketAddr>);

/// Writable side of the endpoint slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveEndpoint {
    reader: EndpointReader,
}

impl LiveEndpoint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reader(&self) -> EndpointReader {
        self.reader.clone()
    }

    pub(crate) fn publish(&self, addr: SocketAddr) -> Publication {
        let publication = Arc::new(addr);
        self.reader.slot.store(Some(Arc::clone(&publication)));
        Publication(publication)
    }

    /// Clears the slot only if it still holds `publication`.
    ///
    /// Returns `true` if this call cleared it.
    pub(crate) fn clear_if(&self, publication: &Publication) -> bool {
        let current = Some(Arc::clone(&publication.0));
        let previous = self.reader.slot.compare_and_swap(&current, None::<Arc<SocketAddr>>);
        let previous: &Option<Arc<SocketAddr>> = &previous;
        previous
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &publication.0))
    }

    pub(crate) fn clear(&self) {
        self.reader.slot.store(None);
    }
}
