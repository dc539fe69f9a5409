//! Credential source and cache
//!
//! The cache owns the single `Credentials` value for the process. A refresh
//! validates the fetched payload and swaps the whole value; a failed refresh
//! leaves the previous value untouched. Refreshes run one at a time so a slow
//! fetch can never overwrite the result of a later one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tod_core::{CompanyDetails, Credentials};
use tod_rest::TodClient;
use tracing::{debug, info, warn};

use crate::error::RealtimeError;

/// Where credentials come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Identity of the source for logs
    fn name(&self) -> String;

    /// Fetch the current connection details
    async fn fetch(&self) -> Result<CompanyDetails, RealtimeError>;
}

#[async_trait]
impl CredentialSource for TodClient {
    fn name(&self) -> String {
        self.config().domain_url.to_string()
    }

    async fn fetch(&self) -> Result<CompanyDetails, RealtimeError> {
        self.company_details()
            .await
            .map_err(|e| RealtimeError::CredentialFetch(e.to_string()))
    }
}

/// Holds the latest validated credential set
#[derive(Debug, Default)]
pub struct CredentialCache {
    current: RwLock<Option<Arc<Credentials>>>,
    refreshes: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached credentials, if any
    pub fn get(&self) -> Option<Arc<Credentials>> {
        self.current.read().clone()
    }

    /// True when nothing is cached or the cached channel key is stale
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.current
            .read()
            .as_ref()
            .map_or(true, |creds| creds.is_expired(now))
    }

    /// Drop the cached value so the next use has to fetch
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            debug!("[TOD Credentials] Cached credentials invalidated");
        }
    }

    /// Number of successful refreshes
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Fetch, validate and atomically replace the cached credentials
    pub async fn refresh(
        &self,
        source: &dyn CredentialSource,
    ) -> Result<Arc<Credentials>, RealtimeError> {
        let _serialized = self.refresh_lock.lock().await;

        let details = source.fetch().await.map_err(|e| {
            warn!("[TOD Credentials] Fetch from {} failed: {}", source.name(), e);
            match e {
                RealtimeError::CredentialFetch(_) => e,
                other => RealtimeError::CredentialFetch(other.to_string()),
            }
        })?;

        let credentials = Credentials::try_from(details).map_err(|e| {
            warn!("[TOD Credentials] Rejected payload from {}: {}", source.name(), e);
            RealtimeError::CredentialFetch(e.to_string())
        })?;

        let credentials = Arc::new(credentials);
        *self.current.write() = Some(Arc::clone(&credentials));
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        info!(
            "[TOD Credentials] Refreshed from {} (connection: {}, name: {}, channel key expiry: {})",
            source.name(),
            credentials.connection_id,
            credentials.display_name,
            credentials.channel_key_expiry.as_deref().unwrap_or("none")
        );

        Ok(credentials)
    }
}
