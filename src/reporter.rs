//! Periodic outbound publishers.
//!
//! A [`Reporter`] pairs a [`ReportSource`] (dynamic endpoint + payload
//! producer + failure hook) with a [`Transport`] and drives them on a fixed
//! interval: resolve, fetch, send, and on any failure invoke the hook. Ticks
//! of one reporter never overlap; distinct reporters run independently.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Producer side of a reporter.
#[async_trait]
pub trait ReportSource: Send + Sync + 'static {
    type Payload: Send + 'static;

    /// Resolve the target URI. Called before every send so endpoints can
    /// move. `None` skips the tick.
    async fn resolve_uri(&self, cancel: &CancellationToken) -> Option<String>;

    /// Produce the payload for one tick. `None` skips the tick.
    async fn fetch(&self) -> Option<Self::Payload>;

    /// Invoked after a non-2xx response or transport error.
    async fn on_failure(&self);
}

/// Delivery side of a reporter.
#[async_trait]
pub trait Transport<P: Send + 'static>: Send + Sync + 'static {
    async fn send(&self, uri: &str, payload: P, cancel: &CancellationToken) -> Result<()>;
}

/// POSTs a JSON document; non-2xx counts as failure.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport<serde_json::Value> for HttpTransport {
    async fn send(
        &self,
        uri: &str,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.client.post(uri).json(&payload).send() => r?,
        };
        if !response.status().is_success() {
            return Err(AgentError::NonSuccess {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Sends a raw datagram to the `host:port` of a `udp://` URI. Never retries
/// the same datagram.
pub struct UdpTransport;

#[async_trait]
impl Transport<Vec<u8>> for UdpTransport {
    async fn send(&self, uri: &str, payload: Vec<u8>, _cancel: &CancellationToken) -> Result<()> {
        let target = udp_target(uri)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&payload, target.as_str()).await?;
        Ok(())
    }
}

/// Extract `host:port` from a URI such as `udp://host:port/api/...`.
pub fn udp_target(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("udp://")
        .or_else(|| uri.strip_prefix("UDP://"))
        .unwrap_or(uri);
    let host_port = rest.split('/').next().unwrap_or_default();
    if host_port.is_empty() || !host_port.contains(':') {
        return Err(AgentError::Internal(format!(
            "malformed udp target in {}",
            uri
        )));
    }
    Ok(host_port.to_string())
}

/// Handle to a running periodic publisher.
pub struct Reporter {
    name: &'static str,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Spawn the worker: wait `hold`, then loop resolve → fetch → send on
    /// `interval`, invoking the source's failure hook on any failed send.
    pub fn start<S, T>(
        name: &'static str,
        hold: Duration,
        interval: Duration,
        source: S,
        transport: T,
        parent: &CancellationToken,
    ) -> Self
    where
        S: ReportSource,
        T: Transport<S::Payload>,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(hold) => {}
            }
            loop {
                Self::tick(name, &source, &transport, &token).await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        tracing::info!(reporter = name, "Reporter started");
        Self {
            name,
            cancel,
            worker: Some(worker),
        }
    }

    async fn tick<S, T>(name: &'static str, source: &S, transport: &T, token: &CancellationToken)
    where
        S: ReportSource,
        T: Transport<S::Payload>,
    {
        let Some(uri) = source.resolve_uri(token).await else {
            return;
        };
        let Some(payload) = source.fetch().await else {
            return;
        };
        match transport.send(&uri, payload, token).await {
            Ok(()) => {
                tracing::trace!(reporter = name, uri = %uri, "Report sent");
            }
            Err(AgentError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(reporter = name, uri = %uri, error = %e, "Report failed");
                source.on_failure().await;
            }
        }
    }

    /// Signal cancellation and join the worker.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        tracing::info!(reporter = self.name, "Reporter stopped");
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}
