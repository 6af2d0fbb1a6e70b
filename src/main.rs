//! Project Shelf server binary.
//!
//! Serves the project/category file catalogue: JSON metadata documents, a
//! local upload directory, admin sessions and per-category passwords. The
//! main entry point builds the Axum router and starts the HTTP listener plus
//! an optional HTTPS listener.

mod atomic;
mod auth;
mod background;
mod category;
mod config;
mod error;
mod etag;
mod files;
mod frontend;
mod gate;
mod http;
mod locking;
mod logging;
mod projects;
mod router;
mod storage;
mod store;
mod tls;
mod upload;
mod version;

use axum::extract::Extension;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::auth::{AuthConfig, LoginLimiter};
use crate::background::spawn_background_tasks;
use crate::config::{Args, DEFAULT_ADMIN_PASSWORD};
use crate::gate::CategoryGate;
use crate::http::{RequestScheme, build_cors_layer};
use crate::router::{AppContext, build_router};
use crate::storage::{Storage, StorageError};
use crate::store::MetaStore;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    let store = Arc::new(MetaStore::new(PathBuf::from(&args.data_dir)));
    let auth = Arc::new(
        AuthConfig::new(
            &args.admin_password,
            Duration::from_secs(args.session_ttl_secs),
            args.read_only,
            LoginLimiter::new(
                args.login_max_attempts,
                Duration::from_secs(args.login_window_secs),
                Duration::from_secs(args.login_lockout_secs),
            ),
        )
        .with_trust_proxy(args.trust_proxy),
    );
    let gate = Arc::new(CategoryGate::new(Duration::from_secs(args.unlock_ttl_secs)));

    storage.ensure_root().await?;
    store.ensure_documents().await.map_err(|err| match err {
        StorageError::Io(err) => err,
        other => std::io::Error::other(format!("{other:?}")),
    })?;
    info!(
        data_dir = ?store.data_dir(),
        storage_dir = ?storage.root_path(),
        "metadata and uploads ready"
    );
    if args.admin_password.trim() == DEFAULT_ADMIN_PASSWORD {
        warn!("using the default admin password; set SHELF_ADMIN_PASSWORD");
    }
    if args.read_only {
        info!("read-only mode: all modifications are rejected");
    }
    if args.trust_proxy {
        info!("trusting x-forwarded-for for client addresses");
    }

    let ctx = AppContext {
        storage,
        store,
        auth: auth.clone(),
        gate: gate.clone(),
        upload_max_size: args.upload_max_size,
    };
    let mut app = build_router(&ctx);
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .layer(Extension(RequestScheme::Http))
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config = tls::build_rustls_config(&args, host).await?;
            info!("Starting HTTPS server at {}", https_addr);
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(
                        app.layer(Extension(RequestScheme::Https))
                            .into_make_service_with_connect_info::<SocketAddr>(),
                    ),
            )
        }
        None => None,
    };
    let https_server = async move {
        match https_server {
            Some(server) => server.await,
            None => std::future::pending().await,
        }
    };

    spawn_background_tasks(auth, gate);
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
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
