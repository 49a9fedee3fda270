//! Gateway process: transport, router, pool, pipeline, and the optional webhook server.

use crate::channels::{ChannelCapability, ChannelPool, ConsoleTransport, TelegramTransport};
use crate::config::{resolve_telegram_token, resolve_webhook_key, Config};
use crate::events::InboundEvent;
use crate::gateway::webhook::{serve_webhook, WebhookState};
use crate::handlers;
use crate::kv::KvStore;
use crate::pipeline::Pipeline;
use crate::router::CommandRouter;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const INBOUND_BUFFER: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run until SIGINT or SIGTERM. Uses Telegram when a bot token resolves, otherwise the console.
pub async fn run_gateway(config: Config) -> Result<()> {
    config.pool.validate()?;
    let kv = Arc::new(KvStore::new());

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundEvent>(INBOUND_BUFFER);
    let (capability, inbound_task): (Arc<dyn ChannelCapability>, JoinHandle<()>) =
        match resolve_telegram_token(&config) {
            Some(token) => {
                let transport = Arc::new(TelegramTransport::new(token));
                let task = transport.clone().start_inbound(inbound_tx);
                (transport, task)
            }
            None => {
                log::info!("no telegram bot token configured, using console transport");
                let transport = Arc::new(ConsoleTransport::new());
                let task = transport.clone().start_inbound(inbound_tx);
                (transport, task)
            }
        };
    log::info!("transport: {}", capability.id());

    let mut router = CommandRouter::new(config.router.prefix);
    router.set_kv(kv.clone());
    router.set_capability(capability.clone());
    handlers::register_builtin(&mut router, &config.handlers);
    let router = Arc::new(router);

    let pool = Arc::new(ChannelPool::new(capability.clone(), &config.pool));
    let reclaimer = pool.spawn_reclaimer();
    let pipeline = Pipeline::new(router, pool.clone());

    let forwarder = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                pipeline.ingest(event);
            }
            log::debug!("ingestion: inbound stream closed");
        })
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let webhook = match resolve_webhook_key(&config) {
        Some(api_key) => {
            let addr = format!("{}:{}", config.webhook.bind, config.webhook.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding webhook server to {}", addr))?;
            let state = WebhookState {
                kv: kv.clone(),
                output: pipeline.output().clone(),
                api_key: Arc::from(api_key),
            };
            let mut stop_rx = stop_rx.clone();
            Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = serve_webhook(listener, state, shutdown).await {
                    log::error!("webhook: {:#}", e);
                }
            }))
        }
        None => {
            log::info!("webhook: no api key configured, server disabled");
            None
        }
    };

    shutdown_signal().await;
    log::info!("shutdown signal received, stopping transport and draining queues");

    capability.stop();
    inbound_task.abort();
    forwarder.abort();
    let _ = stop_tx.send(true);
    if let Some(handle) = webhook {
        let _ = handle.await;
    }
    if let Some(handle) = reclaimer {
        handle.abort();
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, pipeline.wait_idle())
        .await
        .is_err()
    {
        log::warn!("queues did not drain within {:?}", DRAIN_TIMEOUT);
    }
    pool.close_all().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
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
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
