use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::handler::EventHandler;
use crate::health::HealthHandle;
use crate::metrics_consts::{ABORTED_ON_SHUTDOWN_TOTAL, IN_FLIGHT_MESSAGES, RECEIVE_ERRORS_TOTAL};
use crate::transport::{Delivery, MessageSource, TransportError};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries being handled at once. A new message is only received
    /// after a permit frees up.
    pub max_in_flight: usize,
    /// Upper bound on a single wait for a permit or a message, so that
    /// liveness keeps being reported on an idle or saturated consumer.
    pub poll_timeout: Duration,
    /// How long in-flight deliveries get to settle once shutdown starts.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            poll_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("max in-flight messages must be at least 1")]
    InvalidConcurrency,
    #[error("failed to close message source: {0}")]
    Close(#[source] TransportError),
}

/// Pulls deliveries from a source and handles each one on its own task.
pub struct IngestionConsumer<S: MessageSource> {
    source: S,
    handler: EventHandler,
    config: ConsumerConfig,
    liveness: Option<HealthHandle>,
}

impl<S: MessageSource> IngestionConsumer<S> {
    pub fn new(
        source: S,
        handler: EventHandler,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        if config.max_in_flight == 0 {
            return Err(ConsumerError::InvalidConcurrency);
        }

        Ok(Self {
            source,
            handler,
            config,
            liveness: None,
        })
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), or
    /// until the source is exhausted. In-flight deliveries are then given
    /// `shutdown_timeout` to settle before the source is closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let Self {
            mut source,
            handler,
            config,
            liveness,
        } = self;

        let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let report_in_flight = |semaphore: &Semaphore| {
            metrics::gauge!(IN_FLIGHT_MESSAGES)
                .set((config.max_in_flight - semaphore.available_permits()) as f64);
        };

        info!(max_in_flight = config.max_in_flight, "starting consumer loop");

        loop {
            if let Some(liveness) = &liveness {
                liveness.report_healthy();
            }
            report_in_flight(&semaphore);
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                acquired = timeout(config.poll_timeout, semaphore.clone().acquire_owned()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        // Saturated; loop around to report liveness.
                        Err(_) => continue,
                        Ok(Err(_)) => {
                            error!("handler semaphore closed unexpectedly");
                            break;
                        }
                    }
                }
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = timeout(config.poll_timeout, source.recv()) => {
                    match received {
                        Ok(Ok(Some(delivery))) => delivery,
                        Ok(Ok(None)) => {
                            info!("message source exhausted");
                            break;
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "failed to receive message");
                            metrics::counter!(RECEIVE_ERRORS_TOTAL).increment(1);
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                            }
                        }
                        Err(_) => continue,
                    }
                }
            };

            let handler = handler.clone();
            let span = tracing::info_span!("message", message = %delivery.describe());
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let outcome = handler.handle(delivery.payload()).await;
                    let disposition = outcome.disposition();
                    match delivery.settle(disposition).await {
                        Ok(()) => debug!(disposition = disposition.as_str(), "settled message"),
                        Err(e) => error!(
                            disposition = disposition.as_str(),
                            error = %e,
                            "failed to settle message, it will be redelivered"
                        ),
                    }
                }
                .instrument(span),
            );
            report_in_flight(&semaphore);
        }

        info!(in_flight = tasks.len(), "consumer loop stopped, draining in-flight messages");
        drain(&mut tasks, config.shutdown_timeout).await;
        report_in_flight(&semaphore);

        source.close().await.map_err(ConsumerError::Close)?;
        info!("message source closed");
        Ok(())
    }
}

async fn drain(tasks: &mut JoinSet<()>, shutdown_timeout: Duration) {
    let deadline = Instant::now() + shutdown_timeout;
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(result)) => log_task_result(result),
            Ok(None) => return,
            Err(_) => {
                let remaining = tasks.len();
                warn!(
                    remaining,
                    "shutdown timeout reached, aborting in-flight messages"
                );
                metrics::counter!(ABORTED_ON_SHUTDOWN_TOTAL).increment(remaining as u64);
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return;
            }
        }
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "message handler panicked");
        }
    }
}
