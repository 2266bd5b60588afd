//! Remote system access for the bridge reconciler
//!
//! The DirectRemoteCall phase talks to systems outside the cluster's
//! declarative reach. Every call is an upsert or an idempotent delete so a
//! repeated pass converges instead of duplicating records.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::Result;

/// Calls to systems with no in-cluster controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Create or update the record for `fqdn` in `zone` pointing at `target`
    async fn upsert_dns_record(&self, zone: &str, fqdn: &str, target: &str) -> Result<()>;

    /// Remove the record for `fqdn` from `zone`; absent records are success
    async fn delete_dns_record(&self, zone: &str, fqdn: &str) -> Result<()>;
}

/// A [`RemoteClient`] that records intent in the log and succeeds
///
/// Stands in where no DNS provider is configured, keeping the phase workflow
/// runnable end to end; a provider-backed client implements the same trait.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingRemote;

#[async_trait]
impl RemoteClient for LoggingRemote {
    async fn upsert_dns_record(&self, zone: &str, fqdn: &str, target: &str) -> Result<()> {
        info!(zone, fqdn, target, "dns upsert (no provider configured)");
        Ok(())
    }

    async fn delete_dns_record(&self, zone: &str, fqdn: &str) -> Result<()> {
        info!(zone, fqdn, "dns delete (no provider configured)");
        Ok(())
    }
}
