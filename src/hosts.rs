//! Periodic hosts-file synchronization.
//!
//! Downloads the cluster hosts document from a resolver-supplied URI and
//! rewrites the local hosts file atomically. Fetch failures are logged and
//! retried on the next tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::naming::{resolve_uri_ref, ServiceResolver};

pub const MIN_HOSTS_FETCH_INTERVAL: Duration = Duration::from_secs(10);

/// Clamp a configured fetch interval to the supported minimum.
pub fn effective_interval(configured: Duration) -> Duration {
    if configured < MIN_HOSTS_FETCH_INTERVAL {
        tracing::info!(
            configured_secs = configured.as_secs(),
            minimum_secs = MIN_HOSTS_FETCH_INTERVAL.as_secs(),
            "Hosts fetch interval below minimum, using the minimum"
        );
        MIN_HOSTS_FETCH_INTERVAL
    } else {
        configured
    }
}

pub struct HostsManager {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl HostsManager {
    pub fn start(
        resolver: Arc<ServiceResolver>,
        hosts_uri: String,
        configured_interval: Duration,
        hosts_path: PathBuf,
        client: reqwest::Client,
        parent: &CancellationToken,
    ) -> Self {
        let interval = effective_interval(configured_interval);
        let cancel = parent.child_token();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let uri = match resolve_uri_ref(&resolver, &hosts_uri, &token).await {
                    Ok(uri) => uri,
                    Err(e) => {
                        tracing::warn!(error = %e, "Hosts file URI resolution failed");
                        String::new()
                    }
                };
                if !uri.is_empty() {
                    if let Err(e) = fetch_and_write(&client, &uri, &hosts_path).await {
                        tracing::warn!(uri = %uri, error = %e, "Hosts file fetch failed");
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        tracing::info!(interval_secs = interval.as_secs(), "Hosts manager started");
        Self {
            cancel,
            worker: Some(worker),
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for HostsManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}

/// Download the hosts document and replace `hosts_path` atomically.
pub async fn fetch_and_write(client: &reqwest::Client, uri: &str, hosts_path: &Path) -> Result<()> {
    let body = client
        .get(uri)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let tmp = hosts_path.with_extension("hpcagent.tmp");
    tokio::fs::write(&tmp, body.as_bytes()).await?;
    tokio::fs::rename(&tmp, hosts_path).await?;
    tracing::debug!(path = %hosts_path.display(), bytes = body.len(), "Hosts file updated");
    Ok(())
}
