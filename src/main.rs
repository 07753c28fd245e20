//! torrent-mux entry point: load configuration, build the Engine, prime
//! the Hash Index, and serve.

mod config;
mod dispatcher;
mod engine;
mod error;
mod executor;
mod hash_index;
mod ids;
mod instance;
mod json_tree;
mod maindata;
mod merge;
mod middleware;
mod observability;
mod registry;
mod server;
mod writer;

use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;

use crate::config::Config;
use crate::engine::Engine;
use crate::server::Server;

#[tokio::main]
async fn main() -> ExitCode {
    observability::init_tracing();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let violations = config.validate();
    if !violations.is_empty() {
        for violation in &violations {
            tracing::error!("invalid configuration: {violation}");
        }
        return ExitCode::FAILURE;
    }

    let engine = match Engine::from_config(config.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize backend instances");
            return ExitCode::FAILURE;
        }
    };

    engine.prime().await;

    let app = Router::new()
        .fallback(dispatcher::handle)
        .with_state(engine);

    let server = Server::new(config);
    if let Err(e) = server.serve(app).await {
        tracing::error!(error = %e, "server exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
