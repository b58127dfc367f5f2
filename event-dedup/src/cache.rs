use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, RedisError};
use thiserror::Error;

use crate::error::FailureClass;
use crate::fingerprint::Fingerprint;

/// Default lifetime of a cache entry: seven days.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default lifetime of an unconfirmed claim.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(5 * 60);

/// Value of an entry whose event is known to be stored.
const SEEN_MARKER: &str = "done";
/// Value of an entry claimed by a delivery that has not stored it yet.
const PENDING_MARKER: &str = "pending";

/// Result of the atomic conditional set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The entry did not exist and now belongs to the caller.
    Claimed,
    /// Another delivery claimed the fingerprint but never confirmed it. It
    /// may still be running, or it may have died before storing the event.
    Pending,
    /// The event behind this fingerprint is stored.
    AlreadySeen,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("timed out waiting for the duplicate cache")]
    Timeout,
    #[error("duplicate cache is unreachable: {0}")]
    Unavailable(#[source] RedisError),
    #[error("duplicate cache command failed: {0}")]
    Command(#[source] RedisError),
    #[error("invalid duplicate cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            CacheError::Unavailable(err)
        } else {
            CacheError::Command(err)
        }
    }
}

impl CacheError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            CacheError::Timeout | CacheError::Unavailable(_) => FailureClass::Transient,
            CacheError::Command(_) | CacheError::InvalidConfiguration(_) => {
                FailureClass::Unexpected
            }
        }
    }
}

/// Records which fingerprints have been seen recently.
///
/// The consumer never checks with `exists` and then writes, that would let
/// two handlers both observe "absent". On the hot path it takes a short
/// `claim`, and `confirm`s it once the event is stored. Only confirmed
/// entries short-circuit a delivery, so a handler that dies between claim
/// and insert cannot cause its event to be skipped.
#[async_trait]
pub trait DuplicateCache: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

    /// Atomically record a stored event. Any existing entry, confirmed or
    /// not, is reported as `AlreadySeen` and left untouched.
    async fn record_if_absent(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Claim, CacheError>;

    /// Idempotent. An existing entry keeps its original expiry.
    async fn record_seen(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<(), CacheError> {
        self.record_if_absent(fingerprint, ttl).await.map(|_| ())
    }

    /// Atomically take an unconfirmed claim that expires after `lease`.
    async fn claim(&self, fingerprint: &Fingerprint, lease: Duration) -> Result<Claim, CacheError>;

    /// Mark the event as stored, replacing any claim, for `ttl`.
    async fn confirm(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<(), CacheError>;

    /// Drop an entry the caller claimed but could not persist.
    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), CacheError>;
}

pub struct RedisDuplicateCache {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisDuplicateCache {
    /// Open a multiplexed connection and check it with a PING.
    ///
    /// A zero timeout is rejected; pass `None` to wait indefinitely.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<Self, CacheError> {
        if response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CacheError::InvalidConfiguration(
                "response timeout cannot be zero".to_string(),
            ));
        }
        if connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CacheError::InvalidConfiguration(
                "connection timeout cannot be zero".to_string(),
            ));
        }

        let client = redis::Client::open(url)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        let cache = Self {
            connection,
            key_prefix: key_prefix.into(),
        };
        cache.ping().await?;

        Ok(cache)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Seconds remaining on an entry, `None` if there is no entry.
    pub async fn ttl_of(&self, fingerprint: &Fingerprint) -> Result<Option<u64>, CacheError> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(self.key(fingerprint)).await?;
        Ok(u64::try_from(ttl).ok())
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.key_prefix, fingerprint)
    }

    /// `SET key value EX ttl NX`, true when the key was written.
    async fn set_nx_ex(
        &self,
        fingerprint: &Fingerprint,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(self.key(fingerprint))
            .arg(value)
            .arg("EX")
            .arg(expiry_seconds(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }
}

/// EX rejects zero.
fn expiry_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl DuplicateCache for RedisDuplicateCache {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let found: bool = conn.exists(self.key(fingerprint)).await?;
        Ok(found)
    }

    async fn record_if_absent(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Claim, CacheError> {
        Ok(match self.set_nx_ex(fingerprint, SEEN_MARKER, ttl).await? {
            true => Claim::Claimed,
            false => Claim::AlreadySeen,
        })
    }

    async fn claim(&self, fingerprint: &Fingerprint, lease: Duration) -> Result<Claim, CacheError> {
        if self.set_nx_ex(fingerprint, PENDING_MARKER, lease).await? {
            return Ok(Claim::Claimed);
        }

        // Lost the race; only a confirmed entry counts as seen. An entry that
        // expired in between is treated like a pending one.
        let mut conn = self.connection.clone();
        let marker: Option<String> = conn.get(self.key(fingerprint)).await?;
        Ok(match marker.as_deref() {
            Some(SEEN_MARKER) => Claim::AlreadySeen,
            _ => Claim::Pending,
        })
    }

    async fn confirm(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(self.key(fingerprint), SEEN_MARKER, expiry_seconds(ttl))
            .await?;
        Ok(())
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.key(fingerprint)).await?;
        Ok(())
    }
}
