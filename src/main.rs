use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use tracing::info;

use uirelay::config::{Config, LaunchMode};
use uirelay::server;
use uirelay::session::InMemorySession;
use uirelay::stream::proxy::{ProxyConfig, StreamProxy};
use uirelay::util::{self, AppState};
use uirelay::worker;

/// How long startup waits for the stream proxy's READY signal before giving
/// up and exiting non-zero.
const PROXY_READY_TIMEOUT: Duration = Duration::from_secs(15);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    util::init_tracing();
    let config = Config::from_env();
    config.validate()?;
    info!(
        "starting uirelay (mode={:?}, bind={}, stream_port={})",
        config.launch_mode, config.bind_addr, config.stream_port
    );

    // The UI session attaches behind the `UiSession` seam. The loopback
    // session serves direct-debug deployments and doubles as the default
    // until a browser integration is wired in.
    let session = Arc::new(InMemorySession::new(&config.default_model));
    if config.launch_mode != LaunchMode::DirectDebugNoBrowser {
        info!(
            "launch mode {:?}: expecting an external UiSession integration; \
             running against the loopback session",
            config.launch_mode
        );
    }

    let state = AppState::new(config, session);

    // Start the stream proxy first; the browser must not come up before the
    // proxy is accepting connections.
    if state.config.stream_proxy_enabled() {
        let proxy = Arc::new(
            StreamProxy::new(
                ProxyConfig {
                    port: state.config.stream_port,
                    intercept_domains: state.config.intercept_domain_list(),
                    upstream_proxy: state.config.upstream_proxy_url.clone(),
                    cert_dir: state.config.cert_dir.clone(),
                    debug_logs: state.config.debug_logs,
                },
                state.bus.publisher(),
            )
            .context("initializing stream proxy")?,
        );
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(proxy.run(ready_tx));
        let port = tokio::time::timeout(PROXY_READY_TIMEOUT, ready_rx)
            .await
            .context("stream proxy readiness signal never arrived")?
            .context("stream proxy exited during startup")?;
        info!("stream proxy ready on port {port}");
    } else {
        info!("stream proxy disabled (STREAM_PORT=0); DOM-scrape harvesting only");
    }

    {
        let worker_state = Arc::clone(&state);
        tokio::spawn(async move {
            worker::run_queue_worker(worker_state).await;
        });
    }

    state.mark_initialized();

    let bind_addr = state.config.bind_addr.clone();
    let data = web::Data::from(Arc::clone(&state));
    info!("listening on {bind_addr}");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(actix_web::middleware::from_fn(uirelay::auth::bearer_guard))
            .wrap(util::cors_config_from_env())
            .configure(server::config_routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("binding {bind_addr}"))?
    .run()
    .await?;

    Ok(())
}
