//! Simple upload server binary.
//!
//! Clients upload files with `POST /upload` or `PUT /files/<path>` and read
//! them back with `GET /files/<path>`. The main entry point parses the
//! configuration, builds the Axum router and starts an HTTP or HTTPS listener.

mod atomic;
mod auth;
mod config;
mod error;
mod files;
mod form;
mod http;
mod logging;
mod routes;
mod server;
mod storage;
mod tls;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::config::{Args, ServerConfig};
use crate::storage::Storage;

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let config = Arc::new(ServerConfig::from_args(&args).await?);
    let storage = Arc::new(Storage::new(config.document_root.clone()));
    info!(
        document_root = ?config.document_root,
        max_upload_size = config.max_upload_size,
        enable_cors = config.enable_cors,
        protected_methods = ?config.protected_methods,
        "server configured"
    );

    let app = server::build_router(config, storage);

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match tls_config {
        Some(tls_config) => {
            info!("🔒 Starting HTTPS server at {}", addr);
            let server = axum_server::bind_rustls(addr, tls_config)
                .handle(handle.clone())
                .serve(service);
            tokio::select! {
                result = server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            info!("🚀 Starting HTTP server at {}", addr);
            let server = axum_server::bind(addr)
                .handle(handle.clone())
                .serve(service);
            tokio::select! {
                result = server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
