use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use srs_proxy::api::{api_router, stream_router, system_router, ApiState};
use srs_proxy::config::{ProxyConfig, DEFAULT_BACKEND_KEEPALIVE};
use srs_proxy::error::{Result, ResultExt};
use srs_proxy::logging::init_logging;
use srs_proxy::registry::BackendRegistry;
use srs_proxy::rtc::RtcServer;
use srs_proxy::server::RtmpServer;
use srs_proxy::srt::SrtServer;

#[tokio::main]
async fn main() -> ExitCode {
    let config = ProxyConfig::parse();
    if let Err(e) = init_logging(&config.log_level, &config.log_format) {
        eprintln!("srs-proxy: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Proxy failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig) -> Result<()> {
    config.validate()?;
    tracing::info!(
        version = srs_proxy::VERSION,
        signature = %srs_proxy::signature(),
        "SRS proxy starting"
    );

    let registry = Arc::new(BackendRegistry::with_config(config.registry_config()));
    let mut background = vec![registry.spawn_cleanup_task()];
    if let Some(server) = config.default_backend() {
        tracing::info!(backend = %server, "Default backend enabled");
        background.push(registry.spawn_keepalive(server, DEFAULT_BACKEND_KEEPALIVE));
    }

    let cancel = CancellationToken::new();
    let mut servers: JoinSet<Result<()>> = JoinSet::new();

    let rtmp = RtmpServer::bind(config.rtmp_config()?, Arc::clone(&registry), cancel.clone()).await?;
    servers.spawn(async move { rtmp.run().await });

    let srt = Arc::new(
        SrtServer::bind(
            config.srt_addr()?,
            Arc::clone(&registry),
            config.srt_config(),
            cancel.clone(),
        )
        .await?,
    );
    servers.spawn(async move { srt.run().await });

    let webrtc_addr = config.webrtc_addr()?;
    let rtc = Arc::new(
        RtcServer::bind(
            webrtc_addr,
            Arc::clone(&registry),
            config.session_idle_timeout,
            cancel.clone(),
        )
        .await?,
    );
    let rtc_loop = Arc::clone(&rtc);
    servers.spawn(async move { rtc_loop.run().await });

    let state = ApiState::new(Arc::clone(&registry), rtc, webrtc_addr.port());
    background.push(state.hls.spawn_cleanup_task());
    serve_http(
        "http api",
        config.http_api_addr()?,
        api_router(state.clone()),
        &cancel,
        &mut servers,
    )
    .await?;
    serve_http(
        "http stream",
        config.http_server_addr()?,
        stream_router(state.clone()),
        &cancel,
        &mut servers,
    )
    .await?;
    serve_http(
        "system api",
        config.system_api_addr()?,
        system_router(state),
        &cancel,
        &mut servers,
    )
    .await?;

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Quit signal received"),
        Some(joined) = servers.join_next() => {
            tracing::error!(result = ?joined, "Server exited unexpectedly");
        }
    }
    cancel.cancel();

    let force_quit = config.force_quit_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(force_quit).await;
        tracing::error!(timeout = ?force_quit, "Force quit");
        std::process::exit(1);
    });

    let drained = tokio::time::timeout(config.grace_quit_timeout, async {
        while let Some(joined) = servers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Server stopped with error"),
                Err(e) => tracing::warn!(error = %e, "Server task failed"),
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(timeout = ?config.grace_quit_timeout, "Servers still running after grace period");
        servers.abort_all();
    }

    for handle in background {
        handle.abort();
    }
    tracing::info!("SRS proxy stopped");
    Ok(())
}

async fn serve_http(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    cancel: &CancellationToken,
    servers: &mut JoinSet<Result<()>>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .stage(format!("listen {name} {addr}"))?;
    tracing::info!(server = name, addr = %listener.local_addr()?, "HTTP server listening");

    let cancel = cancel.clone();
    servers.spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::info!(server = name, "HTTP server stopped");
        Ok(())
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
