use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::error::FailureClass;
use crate::event::{EventEnvelope, ProfileFallback};
use crate::fingerprint::Fingerprint;

/// Name of the unique constraint on `events.event_hash`.
pub const EVENT_HASH_CONSTRAINT: &str = "events_event_hash_key";

const INSERT_EVENT: &str = r#"
INSERT INTO events (event_hash, event_name, event_datetime, profile_id, device_ip, raw_data)
VALUES ($1, $2, $3, $4, $5, $6)
"#;

/// A row ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub fingerprint: Fingerprint,
    pub event_name: String,
    pub event_datetime: DateTime<Utc>,
    pub profile_id: Option<String>,
    pub device_ip: Option<String>,
    /// The full decoded document.
    pub raw_data: Value,
}

impl NewEvent {
    pub fn from_envelope(
        envelope: &EventEnvelope,
        fingerprint: Fingerprint,
        profile_fallback: ProfileFallback,
    ) -> Self {
        Self {
            fingerprint,
            event_name: envelope.event_name.clone(),
            event_datetime: envelope.event_datetime,
            profile_id: profile_fallback.resolve(envelope),
            device_ip: envelope.device_ip.clone(),
            raw_data: envelope.document().clone(),
        }
    }
}

/// A stored row, as read back from `events`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PersistedEvent {
    pub id: i64,
    pub event_hash: String,
    pub event_name: String,
    pub event_datetime: DateTime<Utc>,
    pub profile_id: Option<String>,
    pub device_ip: Option<String>,
    pub raw_data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("an event with fingerprint {0} is already stored")]
    DuplicateFingerprint(Fingerprint),
    #[error("event store is unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("event store rejected the insert: {0}")]
    Query(#[source] sqlx::Error),
}

impl SinkError {
    pub fn from_sqlx(error: sqlx::Error, fingerprint: &Fingerprint) -> Self {
        if is_fingerprint_conflict(&error) {
            SinkError::DuplicateFingerprint(fingerprint.clone())
        } else if is_transient_error(&error) {
            SinkError::Unavailable(error)
        } else {
            SinkError::Query(error)
        }
    }

    /// Duplicates are not failures and have no class.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            SinkError::DuplicateFingerprint(_) => None,
            SinkError::Unavailable(_) => Some(FailureClass::Transient),
            SinkError::Query(_) => Some(FailureClass::Unexpected),
        }
    }
}

/// Append-only store of unique events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Insert one event. A second insert with the same fingerprint fails
    /// with `SinkError::DuplicateFingerprint` and leaves the first row as is.
    async fn insert(&self, event: &NewEvent) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PersistedEvent>, sqlx::Error> {
        sqlx::query_as::<_, PersistedEvent>(
            r#"
SELECT id, event_hash, event_name, event_datetime, profile_id, device_ip, raw_data, created_at
FROM events
WHERE event_hash = $1
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn insert(&self, event: &NewEvent) -> Result<(), SinkError> {
        sqlx::query(INSERT_EVENT)
            .bind(event.fingerprint.as_str())
            .bind(&event.event_name)
            .bind(event.event_datetime)
            .bind(event.profile_id.as_deref())
            .bind(event.device_ip.as_deref())
            .bind(&event.raw_data)
            .execute(&self.pool)
            .await
            .map_err(|e| SinkError::from_sqlx(e, &event.fingerprint))?;

        Ok(())
    }
}

/// True for a unique violation on the fingerprint column. A violation that
/// names some other constraint is not a duplicate event.
pub fn is_fingerprint_conflict(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = error else {
        return false;
    };

    let unique = db_error.is_unique_violation() || db_error.code().as_deref() == Some("23505");
    unique && !matches!(db_error.constraint(), Some(name) if name != EVENT_HASH_CONSTRAINT)
}

/// Connection, pool and resource failures that are worth retrying.
pub fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => true,

        sqlx::Error::Protocol(msg) => msg.to_lowercase().contains("timeout"),

        sqlx::Error::Database(db_error) => match db_error.code() {
            // 08 connection exception, 53 insufficient resources,
            // 57 operator intervention, 58 system error,
            // 40001 serialization failure, 40P01 deadlock.
            Some(code) => {
                let code = code.as_ref();
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40P01"
            }
            None => {
                let msg = db_error.message().to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("deadlock")
                    || msg.contains("terminating connection due to")
            }
        },

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    use serde_json::json;
    use sqlx::error::{DatabaseError, ErrorKind};
    use test_case::test_case;

    use super::*;

    #[derive(Debug)]
    struct MockDbError {
        msg: &'static str,
        code: Option<&'static str>,
        constraint: Option<&'static str>,
        unique: bool,
    }

    impl fmt::Display for MockDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl StdError for MockDbError {}

    impl DatabaseError for MockDbError {
        fn message(&self) -> &str {
            self.msg
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::from)
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn kind(&self) -> ErrorKind {
            if self.unique {
                ErrorKind::UniqueViolation
            } else {
                ErrorKind::Other
            }
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }
    }

    fn db_err(msg: &'static str, code: Option<&'static str>) -> sqlx::Error {
        sqlx::Error::from(MockDbError {
            msg,
            code,
            constraint: None,
            unique: false,
        })
    }

    fn unique_err(constraint: Option<&'static str>) -> sqlx::Error {
        sqlx::Error::from(MockDbError {
            msg: "duplicate key value violates unique constraint",
            code: Some("23505"),
            constraint,
            unique: true,
        })
    }

    #[test]
    fn test_fingerprint_conflicts() {
        assert!(is_fingerprint_conflict(&unique_err(Some(EVENT_HASH_CONSTRAINT))));
        assert!(is_fingerprint_conflict(&unique_err(None)));
        assert!(!is_fingerprint_conflict(&unique_err(Some("events_pkey"))));
        assert!(!is_fingerprint_conflict(&db_err("boom", Some("XX000"))));
        assert!(!is_fingerprint_conflict(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_sink_error_from_unique_violation() {
        let fp = Fingerprint::of(b"dup");
        let err = SinkError::from_sqlx(unique_err(Some(EVENT_HASH_CONSTRAINT)), &fp);
        assert!(matches!(err, SinkError::DuplicateFingerprint(ref f) if *f == fp));
        assert_eq!(err.failure_class(), None);
    }

    #[test_case(Some("08006"), "connection failure", true ; "connection exception")]
    #[test_case(Some("53300"), "too many connections", true ; "insufficient resources")]
    #[test_case(Some("57P01"), "terminating connection due to administrator command", true ; "admin shutdown")]
    #[test_case(Some("40P01"), "deadlock detected", true ; "deadlock")]
    #[test_case(Some("22001"), "value too long for type character varying(100)", false ; "string too long")]
    #[test_case(Some("42P01"), "relation \"events\" does not exist", false ; "missing table")]
    #[test_case(None, "connection reset by peer", true ; "message heuristic")]
    #[test_case(None, "something odd", false ; "unknown without code")]
    fn test_database_errors_are_classified(
        code: Option<&'static str>,
        msg: &'static str,
        transient: bool,
    ) {
        let fp = Fingerprint::of(b"x");
        let err = SinkError::from_sqlx(db_err(msg, code), &fp);
        let expected = if transient {
            FailureClass::Transient
        } else {
            FailureClass::Unexpected
        };
        assert_eq!(err.failure_class(), Some(expected));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(is_transient_error(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_new_event_from_envelope() {
        let envelope = EventEnvelope::from_document(json!({
            "event_name": "video_play",
            "event_datetime": "2024-01-01T00:00:00Z",
            "device_ip": "10.0.0.1",
            "source": "web",
        }))
        .unwrap();
        let fp = Fingerprint::of_envelope(&envelope).unwrap();

        let row = NewEvent::from_envelope(&envelope, fp.clone(), ProfileFallback::None);
        assert_eq!(row.fingerprint, fp);
        assert_eq!(row.profile_id, None);
        assert_eq!(row.device_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(row.raw_data, *envelope.document());
        assert_eq!(row.raw_data["raw_data"], json!({}));

        let row = NewEvent::from_envelope(&envelope, fp.clone(), ProfileFallback::DeviceIp);
        assert_eq!(row.profile_id.as_deref(), Some("10.0.0.1"));
        assert_eq!(row.fingerprint, fp);
    }
}
