use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::{CacheError, Claim, DuplicateCache, DEFAULT_CLAIM_LEASE, DEFAULT_DEDUP_TTL};
use crate::error::FailureClass;
use crate::event::{EventEnvelope, EventError, ProfileFallback};
use crate::fingerprint::Fingerprint;
use crate::metrics_consts::{
    CLAIM_CONFIRM_FAILURES_TOTAL, CLAIM_RELEASE_FAILURES_TOTAL, HANDLE_DURATION_SECONDS,
    MESSAGES_TOTAL,
};
use crate::sink::{EventSink, NewEvent, SinkError};
use crate::transport::Disposition;

/// How far a message got before its outcome was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    FingerprintComputed,
    DuplicateChecked,
    Persisting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::FingerprintComputed => "fingerprint_computed",
            Stage::DuplicateChecked => "duplicate_checked",
            Stage::Persisting => "persisting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The conditional set found an existing entry.
    CacheHit,
    /// The store already holds a row with this fingerprint.
    StoreConflict,
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl HandlerError {
    pub fn reason(&self) -> &'static str {
        match self {
            HandlerError::Event(e) => e.reason(),
            HandlerError::Cache(_) => "cache",
            HandlerError::Sink(_) => "sink",
        }
    }
}

/// The terminal state of one delivery.
#[derive(Debug)]
pub enum Outcome {
    Persisted {
        fingerprint: Fingerprint,
    },
    Skipped {
        fingerprint: Fingerprint,
        reason: SkipReason,
    },
    Discarded {
        stage: Stage,
        error: HandlerError,
    },
    Requeued {
        stage: Stage,
        error: HandlerError,
        class: FailureClass,
    },
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Persisted { .. } | Outcome::Skipped { .. } => Disposition::Ack,
            Outcome::Discarded { .. } => Disposition::Discard,
            Outcome::Requeued { .. } => Disposition::Requeue,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Persisted { .. } => "persisted",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Discarded { .. } => "discarded",
            Outcome::Requeued { .. } => "requeued",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Outcome::Persisted { .. } => "none",
            Outcome::Skipped {
                reason: SkipReason::CacheHit,
                ..
            } => "cache_hit",
            Outcome::Skipped {
                reason: SkipReason::StoreConflict,
                ..
            } => "store_conflict",
            Outcome::Discarded { error, .. } => error.reason(),
            Outcome::Requeued { class, .. } => class.as_str(),
        }
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            Outcome::Persisted { fingerprint } | Outcome::Skipped { fingerprint, .. } => {
                Some(fingerprint)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub dedup_ttl: Duration,
    /// How long an unconfirmed claim lives.
    pub claim_lease: Duration,
    pub profile_fallback: ProfileFallback,
    /// Attempts at releasing a claim after a failed insert.
    pub release_attempts: u32,
    pub release_backoff: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: DEFAULT_DEDUP_TTL,
            claim_lease: DEFAULT_CLAIM_LEASE,
            profile_fallback: ProfileFallback::None,
            release_attempts: 3,
            release_backoff: Duration::from_millis(50),
        }
    }
}

/// Runs one delivery through decode, fingerprint, claim and insert.
///
/// The handler never returns an error: every failure is folded into an
/// `Outcome`, which maps to exactly one `Disposition`.
#[derive(Clone)]
pub struct EventHandler {
    cache: Arc<dyn DuplicateCache>,
    sink: Arc<dyn EventSink>,
    config: HandlerConfig,
}

impl EventHandler {
    pub fn new(
        cache: Arc<dyn DuplicateCache>,
        sink: Arc<dyn EventSink>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            cache,
            sink,
            config,
        }
    }

    pub async fn handle(&self, payload: Option<&[u8]>) -> Outcome {
        let started = Instant::now();
        let outcome = self.process(payload).await;
        report(&outcome, started.elapsed());
        outcome
    }

    async fn process(&self, payload: Option<&[u8]>) -> Outcome {
        let envelope = match EventEnvelope::decode(payload.unwrap_or_default()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Outcome::Discarded {
                    stage: Stage::Received,
                    error: e.into(),
                }
            }
        };

        let fingerprint = match Fingerprint::of_envelope(&envelope) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                return Outcome::Discarded {
                    stage: Stage::Decoded,
                    error: e.into(),
                }
            }
        };

        let claimed = match self.cache.claim(&fingerprint, self.config.claim_lease).await {
            Ok(Claim::Claimed) => {
                debug!(%fingerprint, stage = Stage::DuplicateChecked.as_str(), "claimed fingerprint");
                true
            }
            Ok(Claim::Pending) => {
                // The claim holder may be gone, so the unique constraint decides.
                debug!(%fingerprint, stage = Stage::DuplicateChecked.as_str(), "fingerprint has an unconfirmed claim");
                false
            }
            Ok(Claim::AlreadySeen) => {
                return Outcome::Skipped {
                    fingerprint,
                    reason: SkipReason::CacheHit,
                }
            }
            Err(e) => {
                return Outcome::Requeued {
                    stage: Stage::FingerprintComputed,
                    class: e.failure_class(),
                    error: e.into(),
                }
            }
        };

        let row = NewEvent::from_envelope(&envelope, fingerprint.clone(), self.config.profile_fallback);
        match self.sink.insert(&row).await {
            Ok(()) => {
                self.confirm_claim(&fingerprint).await;
                Outcome::Persisted { fingerprint }
            }
            Err(SinkError::DuplicateFingerprint(_)) => {
                self.confirm_claim(&fingerprint).await;
                Outcome::Skipped {
                    fingerprint,
                    reason: SkipReason::StoreConflict,
                }
            }
            Err(e) => {
                if claimed {
                    self.release_claim(&fingerprint).await;
                }
                Outcome::Requeued {
                    stage: Stage::Persisting,
                    class: e.failure_class().unwrap_or(FailureClass::Unexpected),
                    error: e.into(),
                }
            }
        }
    }

    /// The event is stored either way, so a failure here only costs a trip
    /// to the store for later copies until the claim expires.
    async fn confirm_claim(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.cache.confirm(fingerprint, self.config.dedup_ttl).await {
            warn!(%fingerprint, error = %e, "failed to confirm claim");
            metrics::counter!(CLAIM_CONFIRM_FAILURES_TOTAL).increment(1);
        }
    }

    /// Undo our claim so the redelivery does not have to go through the
    /// store to find out the event was never stored.
    async fn release_claim(&self, fingerprint: &Fingerprint) {
        let attempts = self.config.release_attempts.max(1);
        for attempt in 1..=attempts {
            match self.cache.release(fingerprint).await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    debug!(%fingerprint, attempt, error = %e, "retrying claim release");
                    tokio::time::sleep(self.config.release_backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        %fingerprint,
                        attempts,
                        error = %e,
                        "failed to release claim, it stays pending until the lease expires"
                    );
                    metrics::counter!(CLAIM_RELEASE_FAILURES_TOTAL).increment(1);
                }
            }
        }
    }
}

fn report(outcome: &Outcome, elapsed: Duration) {
    match outcome {
        Outcome::Persisted { fingerprint } => {
            debug!(%fingerprint, "persisted event");
        }
        Outcome::Skipped {
            fingerprint,
            reason,
        } => {
            debug!(%fingerprint, ?reason, "skipped duplicate event");
        }
        Outcome::Discarded { stage, error } => {
            warn!(stage = stage.as_str(), error = %error, "discarding malformed message");
        }
        Outcome::Requeued {
            stage,
            error,
            class: FailureClass::Unexpected,
        } => {
            error!(stage = stage.as_str(), error = ?error, "unexpected failure, requeueing message");
        }
        Outcome::Requeued { stage, error, class } => {
            warn!(stage = stage.as_str(), %class, error = %error, "dependency failure, requeueing message");
        }
    }

    let label = outcome.label();
    metrics::counter!(MESSAGES_TOTAL, "outcome" => label, "reason" => outcome.reason()).increment(1);
    metrics::histogram!(HANDLE_DURATION_SECONDS, "outcome" => label).record(elapsed.as_secs_f64());
}
