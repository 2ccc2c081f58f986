use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` when SIGTERM or SIGINT arrives.
///
/// Reporters, grace-period timers and in-flight HTTP requests all derive
/// child tokens from the agent root token and wind down cooperatively once
/// it is cancelled.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    "SIGTERM"
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending().await
                }
            }
        };
        let interrupt = async {
            match signal(SignalKind::interrupt()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    "SIGINT"
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGINT handler");
                    std::future::pending().await
                }
            }
        };

        let received = tokio::select! {
            name = terminate => name,
            name = interrupt => name,
        };
        tracing::info!(signal = received, "Shutting down the agent");
        token.cancel();
    });
}

/// Create the agent's root token with the signal handler attached.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    cancel_on_signal(token.clone());
    token
}
