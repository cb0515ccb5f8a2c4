//! txgate HTTP entrypoint.
//!
//! The gateway accepts authenticated requests to deploy or invoke services,
//! signs the resulting transactions with server-held keys, submits them over
//! a pooled WebSocket RPC connection, and exposes the asynchronous results
//! through an offset-polled per-session mailbox.
//!
//! Two listeners come up:
//! - public: `/v0/api/service/{deploy,execute,poll}` behind the configured
//!   auth plugin
//! - private: `/v0/api/service/getPublicKey` and `/health` for operators
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `TXGATE_*` variables configure binds, backend, mailbox, auth, callbacks
//! - `OTEL_*` variables enable OTLP trace/metric export

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::Method;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use dotenvy::dotenv;
use tower_http::cors;
use tower_http::timeout::TimeoutLayer;

use crate::backend::Client;
use crate::backend::eth::{EthClient, EthClientProps};
use crate::callback::CallbackClient;
use crate::config::{BindConfig, Config};
use crate::handlers::AppState;
use crate::sig_down::SigDown;
use crate::stats::StatsSource;
use crate::telemetry::Telemetry;
use crate::tx::Executor;

mod auth;
mod backend;
mod callback;
mod config;
mod handlers;
mod mailbox;
mod pool;
mod sig_down;
mod stats;
mod telemetry;
mod tx;
mod types;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        public = ?config.bind_public,
        private = ?config.bind_private,
        backend = ?config.backend,
        mailbox = ?config.mailbox,
        auth = ?config.auth,
        "configuration parsed"
    );

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();

    let eth_client = match EthClient::dial(EthClientProps {
        url: config.backend.url.clone(),
        conns: config.backend.conns,
    })
    .await
    {
        Ok(client) => Arc::new(client),
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to the backend");
            std::process::exit(1);
        }
    };
    let client: Arc<dyn Client> = eth_client.clone();

    let callbacks = CallbackClient::new(&config.callback);
    let (mailbox, mailbox_stats) = match mailbox::from_config(&config.mailbox).await {
        Ok(mailbox) => mailbox,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize the mailbox");
            std::process::exit(1);
        }
    };

    let backend_stats: Arc<dyn StatsSource> = eth_client.clone();
    let mut stats_sources = vec![backend_stats];
    if let Some(source) = mailbox_stats {
        stats_sources.push(source);
    }

    let executor = match Executor::start(
        &config.backend,
        client,
        callbacks,
        mailbox,
        cancel.clone(),
    )
    .await
    {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            tracing::error!(error = %err, "failed to start the executor");
            std::process::exit(1);
        }
    };

    let state = AppState {
        executor,
        auth: auth::from_config(&config.auth),
        stats_sources: Arc::new(stats_sources),
    };

    let public_router = handlers::public_routes(state.clone())
        .layer(telemetry.http_tracing())
        .layer(TimeoutLayer::new(config.bind_public.read_timeout))
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );
    let private_router = handlers::private_routes(state)
        .layer(telemetry.http_tracing())
        .layer(TimeoutLayer::new(config.bind_private.read_timeout));

    let handle = Handle::new();
    {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }

    let public = serve(config.bind_public, public_router, handle.clone());
    let private = serve(config.bind_private, private_router, handle);
    tokio::try_join!(public, private)?;

    eth_client.shutdown();
    Ok(())
}

/// Runs one listener to completion, with TLS when the bind asks for it.
async fn serve(cfg: BindConfig, router: Router, handle: Handle) -> std::io::Result<()> {
    let ip: IpAddr = cfg
        .interface
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{err}")))?;
    let addr = SocketAddr::new(ip, cfg.port);
    tracing::info!(%addr, tls = cfg.tls_enabled, "listening");

    if cfg.tls_enabled {
        let cert = cfg.tls_certificate_path.expect("validated at config parse");
        let key = cfg.tls_private_key_path.expect("validated at config parse");
        let tls = RustlsConfig::from_pem_file(cert, key).await?;
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await
    } else {
        axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .await
    }
}
