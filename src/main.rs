use anyhow::Context;
use gym_webhooks::api::{self, ApiState};
use gym_webhooks::config::Config;
use gym_webhooks::delivery::{
    requeue_unfinished, spawn_runner, DeliveryQueue, DeliveryWorker, HttpTransport,
};
use gym_webhooks::publisher::EventPublisher;
use gym_webhooks::receiver::{
    self, EmailChannel, EventLoggerState, NotificationChannel, NotifierState, TelegramChannel,
};
use gym_webhooks::rpc::{AmqpConnector, RpcEndpoint};
use gym_webhooks::store::{DeliveryLog, NotificationLedger, ProcessedEvents, SubscriptionRegistry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let data_dir = Some(config.data_dir.as_path());

    let subscriptions = Arc::new(SubscriptionRegistry::open(data_dir)?);
    let deliveries =
        Arc::new(DeliveryLog::open(data_dir)?.with_retention(config.delivery_retention));
    // Future-skewed timestamps stay fresh for up to twice the window.
    let events =
        Arc::new(ProcessedEvents::open(data_dir)?.with_retention(config.replay_window * 2));
    let ledger = Arc::new(
        NotificationLedger::open(data_dir)?.with_retention(config.notification_retention),
    );

    for url in &config.endpoints {
        let (sub, created) = subscriptions
            .register_if_absent(url, vec!["*".to_string()], &config.webhook_secret)
            .await?;
        if created {
            info!(subscription_id = %sub.id, url = %sub.url, "Registered webhook endpoint");
        }
    }

    let transport = Arc::new(HttpTransport::new(config.http_timeout)?);
    let worker =
        Arc::new(DeliveryWorker::new(deliveries.clone(), transport).with_policy(config.retry));
    let (queue, jobs) = DeliveryQueue::channel();
    let runner = spawn_runner(worker, queue.clone(), jobs, config.worker_concurrency);
    requeue_unfinished(&deliveries, &subscriptions, &queue).await?;

    let publisher = EventPublisher::new(
        subscriptions.clone(),
        deliveries.clone(),
        queue,
        config.publisher.clone(),
    );

    let rpc = Arc::new(
        RpcEndpoint::start(&config.broker, Arc::new(AmqpConnector::new(&config.broker.url)))
            .await,
    );

    let app = api::router(ApiState {
        subscriptions,
        deliveries,
        publisher,
    })
    .merge(api::rpc_router(rpc.clone()))
    .merge(receiver::router(
        EventLoggerState::new(&config.event_logger_secret, config.replay_window, events),
        NotifierState::new(&config.notifier_secret, ledger, notification_channels(&config)?),
    ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        environment = %config.publisher.environment,
        "gym-webhooks listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Unfinished deliveries keep their PENDING/RETRYING rows and are
    // requeued on the next start.
    runner.abort();
    rpc.shutdown().await;
    info!("gym-webhooks stopped");
    Ok(())
}

fn notification_channels(config: &Config) -> anyhow::Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(tg) = &config.telegram {
        channels.push(Arc::new(TelegramChannel::new(
            tg.api_base.clone(),
            &tg.bot_token,
            &tg.chat_id,
            config.http_timeout,
        )?));
    }
    if let Some(email) = &config.email {
        channels.push(Arc::new(EmailChannel::new(
            &email.api_url,
            &email.api_key,
            &email.from,
            email.to.clone(),
            config.http_timeout,
        )?));
    }
    if channels.is_empty() {
        warn!("No notification channels configured; notifier endpoint will answer 500");
    }
    Ok(channels)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
