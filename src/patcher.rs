//! Pre-launch edits to the resolver's TOML configuration.
//!
//! Edits go through `toml_edit`, so comments, ordering and formatting of the
//! shipped config survive every rewrite. Each operation is idempotent.

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use toml_edit::{Array, DocumentMut, Item, Table, Value};
use tracing::debug;

/// Placeholder subnets sent instead of the client's real one.
const ANONYMOUS_SUBNETS: [&str; 2] = ["0.0.0.0/0", "2001:db8::/32"];

/// Writes the settings the supervisor needs into the resolver config.
///
/// Every call must be fully applied when it returns. Implementations should
/// give up with [`SupervisorError::Cancelled`] once `cancel` fires;
/// partially written changes are not rolled back.
#[async_trait]
pub trait ConfigPatcher: Send + Sync {
    /// Makes `endpoint` the only listen address.
    async fn set_listen_addresses(
        &self,
        path: &Path,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Sets the resolver's log verbosity.
    async fn set_log_level(&self, path: &Path, level: u8, cancel: &CancellationToken)
    -> Result<()>;

    /// Stops the resolver from forwarding the client subnet upstream.
    async fn set_edns_client_subnet(&self, path: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// [`ConfigPatcher`] for dnscrypt-proxy's `dnscrypt-proxy.toml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlConfigPatcher;

impl TomlConfigPatcher {
    /// Creates the patcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Sets a top-level `key` to `value` and writes the file back.
    async fn set_root_key(
        path: &Path,
        key: &str,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let content = cancellable(cancel, tokio::fs::read_to_string(path))
            .await?
            .map_err(|e| {
                SupervisorError::ConfigPatch(format!("failed to read {}: {e}", path.display()))
            })?;

        let mut doc = content.parse::<DocumentMut>().map_err(|e| {
            SupervisorError::ConfigPatch(format!("failed to parse {}: {e}", path.display()))
        })?;
        set_val(doc.as_table_mut(), key, value);

        cancellable(cancel, tokio::fs::write(path, doc.to_string()))
            .await?
            .map_err(|e| {
                SupervisorError::ConfigPatch(format!("failed to write {}: {e}", path.display()))
            })?;

        debug!(path = %path.display(), key, "Resolver config updated");
        Ok(())
    }
}

#[async_trait]
impl ConfigPatcher for TomlConfigPatcher {
    async fn set_listen_addresses(
        &self,
        path: &Path,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut listens = Array::new();
        listens.push(endpoint.to_string());
        Self::set_root_key(path, "listen_addresses", Value::Array(listens), cancel).await
    }

    async fn set_log_level(
        &self,
        path: &Path,
        level: u8,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::set_root_key(path, "log_level", Value::from(i64::from(level)), cancel).await
    }

    async fn set_edns_client_subnet(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let subnets: Array = ANONYMOUS_SUBNETS.iter().copied().collect();
        Self::set_root_key(path, "edns_client_subnet", Value::Array(subnets), cancel).await
    }
}

/// Runs `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    if cancel.is_cancelled() {
        return Err(SupervisorError::Cancelled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SupervisorError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Replaces `key` in place, keeping a trailing comment if there was one.
fn set_val(table: &mut Table, key: &str, new_val: Value) {
    match table.get_mut(key) {
        Some(item @ Item::Value(_)) => {
            let suffix = item.as_value().and_then(|v| v.decor().suffix()).cloned();
            *item = Item::Value(new_val);
            if let (Some(s), Some(v)) = (suffix, item.as_value_mut()) {
                v.decor_mut().set_suffix(s);
            }
        }
        Some(item) => *item = Item::Value(new_val),
        None => {
            table.insert(key, Item::Value(new_val));
        }
    }
}
