//! Long-running service: dispatcher, maintenance loops and the ops server

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use mawaqit::resolver::TimesLookup;
use mawaqit::scheduler::{
    DeliveryChannel, EventDispatcher, LogDelivery, MaintenanceTrigger, TriggerConfig,
    WebhookDelivery,
};
use mawaqit::server::{AppState, OpsServer};

use super::Services;

pub async fn run(services: Services) -> Result<()> {
    let Services {
        config,
        health,
        cache,
        resolver,
        groups,
        computer,
        ..
    } = services;

    if let Err(e) = mawaqit::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed; continuing without metrics");
    }

    let channel: Arc<dyn DeliveryChannel> = match &config.scheduler.delivery_webhook {
        Some(webhook) => Arc::new(
            WebhookDelivery::new(webhook.clone()).context("Invalid delivery webhook")?,
        ),
        None => Arc::new(LogDelivery),
    };

    let lookup: Arc<dyn TimesLookup> = resolver;
    let dispatcher = EventDispatcher::new(computer, lookup.clone(), groups.clone(), health.clone(), channel)
        .with_config(&config.scheduler);

    let trigger = Arc::new(MaintenanceTrigger::new(
        TriggerConfig::from_config(&config),
        cache.clone(),
        lookup,
        health.clone(),
        groups.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = trigger.spawn(shutdown_rx.clone());

    let dispatcher_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        dispatcher.run(dispatcher_rx).await;
    }));

    if config.server.enabled {
        let server = OpsServer::new(&config.server, AppState::new(health, cache.clone(), groups))?;
        let mut server_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let signal = async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = server.start_with_shutdown(signal).await {
                tracing::error!(error = %e, "Operational server failed");
            }
        }));
    }

    tracing::info!("mawaqit running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Task ended abnormally");
        }
    }

    if let Some(path) = &config.cache.snapshot_path {
        match cache.export_snapshot(path).await {
            Ok(count) => tracing::info!(path = %path.display(), count, "Cache snapshot written"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to write cache snapshot"),
        }
    }

    Ok(())
}
