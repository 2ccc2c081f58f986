use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Cache of service-name → endpoint URL, populated by polling the configured
/// naming services.
///
/// A single resolver instance is shared by every reporter and completion
/// callback in the agent. Entries never expire on their own; reporter
/// failures invalidate the whole cache so the next resolve re-fetches.
pub struct ServiceResolver {
    endpoints: Vec<String>,
    backoff_start: Duration,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, String>>,
}

impl ServiceResolver {
    pub fn new(endpoints: Vec<String>, backoff_start: Duration, client: reqwest::Client) -> Self {
        Self {
            endpoints,
            backoff_start,
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `service_name` to a URL, fetching on a cache miss.
    ///
    /// The fetch retries indefinitely with exponential backoff, so this only
    /// returns `Err` when the token is cancelled or no naming endpoint is
    /// configured. Callers that need bounded time cancel the token.
    pub async fn resolve(
        &self,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if let Some(hit) = self.cache.read().await.get(service_name) {
            return Ok(hit.clone());
        }

        // Double-checked under the write lock: a concurrent resolver may have
        // filled the entry while we waited.
        let mut cache = self.cache.write().await;
        if let Some(hit) = cache.get(service_name) {
            return Ok(hit.clone());
        }

        let location = self.fetch_location(service_name, cancel).await?;
        tracing::debug!(service = service_name, location = %location, "Resolved service location");
        cache.insert(service_name.to_string(), location.clone());
        Ok(location)
    }

    /// Drop every cached entry. The next resolve of any name re-fetches.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    /// Current cached location for `service_name`, if any. Does not fetch.
    pub async fn cached(&self, service_name: &str) -> Option<String> {
        self.cache.read().await.get(service_name).cloned()
    }

    async fn fetch_location(
        &self,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.endpoints.is_empty() {
            return Err(AgentError::Internal(
                "no naming endpoints configured".to_string(),
            ));
        }

        let mut selected = rand::thread_rng().gen_range(0..self.endpoints.len());
        let mut backoff = self.backoff_start;

        loop {
            let base = self.endpoints[selected % self.endpoints.len()].trim_end_matches('/');
            let uri = format!("{}/{}", base, service_name);
            selected += 1;

            match self.try_fetch(&uri, cancel).await {
                Ok(location) => return Ok(location),
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    tracing::warn!(uri = %uri, error = %e, "Naming service fetch failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn try_fetch(&self, uri: &str, cancel: &CancellationToken) -> Result<String> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.client.get(uri).send() => r?,
        };

        if !response.status().is_success() {
            return Err(AgentError::NonSuccess {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        // The naming service body is a JSON-encoded string.
        Ok(response.json::<String>().await?)
    }
}

/// Resolve a reporting target: full URLs pass through untouched, anything
/// else is treated as a service name for the resolver.
pub async fn resolve_uri_ref(
    resolver: &ServiceResolver,
    raw: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with("udp://") {
        Ok(raw.to_string())
    } else {
        resolver.resolve(raw, cancel).await
    }
}
