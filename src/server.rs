//! HTTP server with graceful shutdown

use axum::{error_handling::HandleErrorLayer, http::StatusCode, BoxError, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::Result,
    middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer},
};

/// Upper bound on request body size the proxy will buffer (torrent file
/// uploads via `/torrents/add` can be larger than the 128 KiB the dispatcher
/// parses for classification purposes, spec §4.1).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Per-request timeout enforced at the HTTP layer (spec §5: "15 s
/// read/write"). A fan-out that outlives this is abandoned and the client
/// sees a 408-equivalent failure rather than hanging indefinitely.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Server instance wrapping an Axum router with the multiplexer's middleware stack.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router until a shutdown signal arrives,
    /// then drain in-flight requests for up to `shutdown_timeout`.
    pub async fn serve(self, app: Router) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.multiplexer.address, self.config.multiplexer.port
        )
        .parse()
        .map_err(|e| crate::error::Error::Config(format!("invalid listen address: {e}")))?;

        tracing::info!("starting torrent-mux on {}", addr);
        self.log_middleware_config();

        let app = app
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new())
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
            )
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(false))
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(sensitive_headers_layer())
            .layer(request_id_propagation_layer())
            .layer(request_id_layer())
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("listening on {}", addr);

        let shutdown_timeout = self.config.multiplexer.shutdown_timeout();

        // `shutdown_rx` flips to `true` once when the OS asks us to stop;
        // `with_graceful_shutdown` and the drain deadline below each watch
        // their own clone, so the deadline only starts counting once the
        // signal actually fires rather than from process start (spec §6:
        // "begin graceful shutdown bounded by ShutdownTimeout").
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        let mut graceful_rx = shutdown_rx.clone();
        let serve_future = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = graceful_rx.changed().await;
        });

        let mut deadline_rx = shutdown_rx.clone();
        let deadline_future = async move {
            let _ = deadline_rx.changed().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = serve_future => {
                result?;
                tracing::info!("server shutdown complete");
            }
            _ = deadline_future => {
                tracing::warn!(
                    "shutdown_timeout ({:?}) elapsed before all connections drained, forcing shutdown",
                    shutdown_timeout
                );
            }
        }

        Ok(())
    }

    fn log_middleware_config(&self) {
        tracing::info!("middleware configuration:");
        tracing::info!("  - panic recovery: enabled");
        tracing::info!("  - request id tracking: enabled");
        tracing::info!("  - sensitive header masking: enabled");
        tracing::info!("  - body limit: {} bytes", MAX_BODY_BYTES);
        tracing::info!("  - compression: enabled");
        tracing::info!("  - request timeout: {:?}", REQUEST_TIMEOUT);
        tracing::info!(
            "  - shutdown timeout: {:?}",
            self.config.multiplexer.shutdown_timeout()
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Converts a layer-level error (currently only `TimeoutLayer`'s elapsed
/// error) into a response, since axum requires every layered service to be
/// infallible (spec §5: per-server 15 s read/write timeout).
async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled middleware error: {err}"))
    }
}

/// Waits for SIGINT or SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
