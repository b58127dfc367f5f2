// ==== Handler ====
/// Counter of handled messages, labelled by `outcome` and `reason`
pub const MESSAGES_TOTAL: &str = "event_dedup_messages_total";

/// Histogram of time spent handling one message, labelled by `outcome`
pub const HANDLE_DURATION_SECONDS: &str = "event_dedup_handle_duration_seconds";

/// Counter of cache claims that could not be released after a failed insert
pub const CLAIM_RELEASE_FAILURES_TOTAL: &str = "event_dedup_claim_release_failures_total";

/// Counter of stored events whose cache claim could not be confirmed
pub const CLAIM_CONFIRM_FAILURES_TOTAL: &str = "event_dedup_claim_confirm_failures_total";

// ==== Consumer loop ====
/// Gauge of handler tasks currently holding a permit
pub const IN_FLIGHT_MESSAGES: &str = "event_dedup_in_flight_messages";

/// Counter of receive errors reported by the message source
pub const RECEIVE_ERRORS_TOTAL: &str = "event_dedup_receive_errors_total";

/// Counter of handler tasks aborted at the shutdown deadline
pub const ABORTED_ON_SHUTDOWN_TOTAL: &str = "event_dedup_aborted_on_shutdown_total";

// ==== Kafka ====
/// Counter of messages republished to the source topic
pub const REQUEUE_PUBLISHED_TOTAL: &str = "event_dedup_requeue_published_total";

/// Counter of messages written to the dead-letter topic, labelled by `reason`
pub const DEAD_LETTERED_TOTAL: &str = "event_dedup_dead_lettered_total";

/// Counter of discarded messages dropped because no dead-letter topic is set
pub const DISCARDED_WITHOUT_DEAD_LETTER_TOTAL: &str = "event_dedup_discarded_without_dlq_total";

/// Counter of failed produce attempts, labelled by `topic`
pub const PRODUCE_FAILURES_TOTAL: &str = "event_dedup_produce_failures_total";

/// Counter of failed offset commits
pub const OFFSET_COMMIT_FAILURES_TOTAL: &str = "event_dedup_offset_commit_failures_total";

/// Gauge of received but unsettled messages across all partitions
pub const PENDING_OFFSETS: &str = "event_dedup_pending_offsets";
