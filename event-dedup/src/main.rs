use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use event_dedup::config::Config;
use event_dedup::health::HealthRegistry;
use event_dedup::kafka::KafkaSource;
use event_dedup::server::{router, serve, setup_metrics_recorder};
use event_dedup::{EventHandler, IngestionConsumer, PgEventSink, RedisDuplicateCache};

fn setup_tracing() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing()?;
    info!("starting event dedup consumer");

    let config = Config::init_from_env().context("failed to load configuration from environment")?;

    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let bind = config.bind();
    let app = router(liveness.clone(), recorder);
    let server = tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!(error = %e, "health server stopped");
        }
    });

    let (response_timeout, connection_timeout) = config.redis_timeouts();
    let cache = RedisDuplicateCache::connect(
        &config.redis_url,
        config.dedup_key_prefix.clone(),
        response_timeout,
        connection_timeout,
    )
    .await
    .context("failed to connect to redis")?;
    info!("connected to redis");

    let sink = PgEventSink::connect(
        &config.database_url,
        config.max_pg_connections,
        config.pg_acquire_timeout_ms.0,
    )
    .await
    .context("failed to connect to postgres")?;
    info!("connected to postgres");

    let kafka_liveness = liveness.register("rdkafka", Duration::from_secs(30));
    let source = KafkaSource::connect(&config.kafka_source_config(), kafka_liveness)
        .context("failed to connect to kafka")?;

    let handler = EventHandler::new(Arc::new(cache), Arc::new(sink), config.handler_config());
    let consumer_liveness = liveness.register("consumer_loop", Duration::from_secs(30));
    let consumer = IngestionConsumer::new(source, handler, config.consumer_config())
        .context("invalid consumer configuration")?
        .with_liveness(consumer_liveness);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = ?e, "signal handling failed, shutting down");
        }
        // The receiver is gone once the consumer has stopped on its own.
        if shutdown_tx.send(true).is_err() {
            info!("consumer already stopped");
        }
    });

    consumer.run(shutdown_rx).await.context("consumer loop failed")?;

    server.abort();
    info!("event dedup consumer stopped");
    Ok(())
}
