use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health::HealthHandle;
use crate::kafka::offsets::{CommittableOffset, OffsetTracker, Partition};
use crate::metrics_consts::{
    DEAD_LETTERED_TOTAL, DISCARDED_WITHOUT_DEAD_LETTER_TOTAL, OFFSET_COMMIT_FAILURES_TOTAL,
    PENDING_OFFSETS, PRODUCE_FAILURES_TOTAL, REQUEUE_PUBLISHED_TOTAL,
};
use crate::retry::{RequeuePolicy, RequeueStep};
use crate::transport::{Delivery, Disposition, MessageSource, TransportError};

/// Delivery count of a message, starting at 1. Absent means first delivery.
pub const ATTEMPT_HEADER: &str = "event-dedup-attempt";
/// Why a message ended up on the dead-letter topic.
pub const DISCARD_REASON_HEADER: &str = "event-dedup-discard-reason";

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_RETRY_INITIAL: Duration = Duration::from_millis(100);
const PUBLISH_RETRY_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub hosts: String,
    pub tls: bool,
    pub consumer_group: String,
    pub topic: String,
    pub offset_reset: String,
    pub producer_linger_ms: u32,
    pub message_timeout_ms: u32,
    pub dead_letter_topic: Option<String>,
    pub commit_interval: Duration,
    pub requeue: RequeuePolicy,
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Stats only arrive while the librdkafka main loop is running.
        self.liveness.report_healthy();
    }
}

/// Consumer context that keeps the offset tracker in step with the
/// partitions this member owns.
pub struct SourceContext {
    client: KafkaContext,
    offsets: Arc<OffsetTracker>,
}

impl SourceContext {
    pub fn new(liveness: HealthHandle, offsets: Arc<OffsetTracker>) -> Self {
        Self {
            client: KafkaContext::from(liveness),
            offsets,
        }
    }
}

impl ClientContext for SourceContext {
    fn stats(&self, statistics: rdkafka::Statistics) {
        self.client.stats(statistics);
    }
}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        self.offsets.set_rebalancing(true);

        match rebalance {
            Rebalance::Revoke(list) => {
                let revoked = partitions_of(list);
                if revoked.is_empty() {
                    return;
                }
                info!(partitions = revoked.len(), "partitions revoked");

                // Last chance to commit while the partitions are still ours.
                let final_offsets = self.offsets.revoke(&revoked);
                if final_offsets.is_empty() {
                    return;
                }
                let committed = to_partition_list(&final_offsets)
                    .and_then(|list| consumer.commit(&list, CommitMode::Sync));
                match committed {
                    Ok(()) => debug!(
                        partitions = final_offsets.len(),
                        "committed offsets of revoked partitions"
                    ),
                    Err(e) => {
                        metrics::counter!(OFFSET_COMMIT_FAILURES_TOTAL).increment(1);
                        warn!(error = %e, "failed to commit offsets of revoked partitions");
                    }
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!(error = %e, "rebalance error"),
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(list) = rebalance {
            let assigned = partitions_of(list);
            if !assigned.is_empty() {
                info!(partitions = assigned.len(), "partitions assigned");
                self.offsets.assign(&assigned);
            }
        }
        self.offsets.set_rebalancing(false);
    }
}

type KafkaConsumer = StreamConsumer<SourceContext>;

struct Shared {
    producer: FutureProducer<KafkaContext>,
    offsets: Arc<OffsetTracker>,
    topic: String,
    dead_letter_topic: Option<String>,
    requeue: RequeuePolicy,
}

/// Consumer group member on the source topic, with a producer for requeues
/// and dead letters. Offsets are committed by a background task, and only
/// past messages whose delivery has been settled.
pub struct KafkaSource {
    consumer: Arc<KafkaConsumer>,
    shared: Arc<Shared>,
    commit_task: JoinHandle<()>,
}

impl KafkaSource {
    pub fn connect(config: &KafkaSourceConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.hosts)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("statistics.interval.ms", "10000");

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.producer_linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string());

        if config.tls {
            for client_config in [&mut consumer_config, &mut producer_config] {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
        }

        debug!("rdkafka consumer configuration: {:?}", consumer_config);
        let offsets = Arc::new(OffsetTracker::new());
        let consumer: KafkaConsumer = consumer_config
            .create_with_context(SourceContext::new(liveness.clone(), offsets.clone()))?;
        let producer: FutureProducer<KafkaContext> =
            producer_config.create_with_context(KafkaContext::from(liveness))?;

        // "Ping" the brokers before joining the group.
        match consumer
            .client()
            .fetch_metadata(Some(config.topic.as_str()), METADATA_TIMEOUT)
        {
            Ok(metadata) => info!(
                topic = config.topic,
                partitions = metadata
                    .topics()
                    .first()
                    .map(|t| t.partitions().len())
                    .unwrap_or_default(),
                "connected to Kafka brokers"
            ),
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        consumer.subscribe(&[&config.topic])?;
        info!(
            topic = config.topic,
            group_id = config.consumer_group,
            dead_letter_topic = config.dead_letter_topic.as_deref(),
            "Kafka consumer subscribed"
        );

        let consumer = Arc::new(consumer);
        let shared = Arc::new(Shared {
            producer,
            offsets,
            topic: config.topic.clone(),
            dead_letter_topic: config.dead_letter_topic.clone(),
            requeue: config.requeue.clone(),
        });
        let commit_task = tokio::spawn(commit_loop(
            consumer.clone(),
            shared.clone(),
            config.commit_interval,
        ));

        Ok(Self {
            consumer,
            shared,
            commit_task,
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    type Message = KafkaDelivery;

    async fn recv(&mut self) -> Result<Option<KafkaDelivery>, TransportError> {
        let message = self.consumer.recv().await?.detach();
        let partition = Partition::new(message.topic(), message.partition());
        self.shared.offsets.received(&partition, message.offset());

        Ok(Some(KafkaDelivery {
            message,
            partition,
            shared: self.shared.clone(),
        }))
    }

    async fn close(self) -> Result<(), TransportError> {
        self.commit_task.abort();

        let pending = self.shared.offsets.pending();
        if pending > 0 {
            warn!(pending, "closing with unsettled messages, they will be redelivered");
        }
        commit_offsets(&self.consumer, &self.shared.offsets, CommitMode::Sync)?;
        self.shared.producer.flush(Timeout::After(FLUSH_TIMEOUT))?;
        self.consumer.unsubscribe();

        Ok(())
    }
}

async fn commit_loop(consumer: Arc<KafkaConsumer>, shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        metrics::gauge!(PENDING_OFFSETS).set(shared.offsets.pending() as f64);
        if let Err(e) = commit_offsets(&consumer, &shared.offsets, CommitMode::Async) {
            warn!(error = %e, "failed to commit offsets");
        }
    }
}

fn commit_offsets(
    consumer: &KafkaConsumer,
    offsets: &OffsetTracker,
    mode: CommitMode,
) -> Result<usize, KafkaError> {
    let committable = match offsets.committable() {
        Ok(committable) => committable,
        Err(e) => {
            debug!(error = %e, "skipping offset commit");
            return Ok(0);
        }
    };
    if committable.is_empty() {
        return Ok(0);
    }

    let list = to_partition_list(&committable)?;
    if let Err(e) = consumer.commit(&list, mode) {
        metrics::counter!(OFFSET_COMMIT_FAILURES_TOTAL).increment(1);
        return Err(e);
    }
    offsets.mark_committed(&committable);
    debug!(partitions = committable.len(), "committed offsets");

    Ok(committable.len())
}

fn to_partition_list(offsets: &[CommittableOffset]) -> Result<TopicPartitionList, KafkaError> {
    let mut list = TopicPartitionList::new();
    for entry in offsets {
        list.add_partition_offset(
            &entry.partition.topic,
            entry.partition.partition,
            Offset::Offset(entry.offset),
        )?;
    }
    Ok(list)
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements()
        .iter()
        .map(|element| Partition::new(element.topic(), element.partition()))
        .collect()
}

pub struct KafkaDelivery {
    message: OwnedMessage,
    partition: Partition,
    shared: Arc<Shared>,
}

impl KafkaDelivery {
    async fn dead_letter(&self, reason: &str) {
        let Some(topic) = &self.shared.dead_letter_topic else {
            warn!(
                topic = self.partition.topic,
                partition = self.partition.partition,
                offset = self.message.offset(),
                reason,
                "dropping message, no dead-letter topic configured"
            );
            metrics::counter!(DISCARDED_WITHOUT_DEAD_LETTER_TOTAL).increment(1);
            return;
        };

        let headers = with_header(self.message.headers(), DISCARD_REASON_HEADER, reason);
        self.publish(topic, headers).await;
        metrics::counter!(DEAD_LETTERED_TOTAL, "reason" => reason.to_owned()).increment(1);
    }

    async fn requeue(&self) {
        let attempt = attempt_of(&self.message);
        let has_dead_letter = self.shared.dead_letter_topic.is_some();

        match self.shared.requeue.next_step(attempt, has_dead_letter) {
            RequeueStep::Retry { delay, attempt } => {
                tokio::time::sleep(delay).await;
                let headers =
                    with_header(self.message.headers(), ATTEMPT_HEADER, &attempt.to_string());
                self.publish(&self.shared.topic, headers).await;
                metrics::counter!(REQUEUE_PUBLISHED_TOTAL).increment(1);
            }
            RequeueStep::DeadLetter => self.dead_letter("max_attempts_exceeded").await,
        }
    }

    /// Republish the original key and payload. Retries until the broker
    /// accepts it: settling without a copy would lose the message.
    async fn publish(&self, topic: &str, headers: OwnedHeaders) {
        let mut backoff = PUBLISH_RETRY_INITIAL;
        loop {
            let record = FutureRecord {
                topic,
                partition: None,
                key: self.message.key(),
                payload: self.message.payload(),
                timestamp: None,
                headers: Some(headers.clone()),
            };

            match self.shared.producer.send(record, Timeout::Never).await {
                Ok(_) => return,
                Err((e, _)) => {
                    warn!(topic, error = %e, "failed to publish message, retrying");
                    metrics::counter!(PRODUCE_FAILURES_TOTAL, "topic" => topic.to_owned())
                        .increment(1);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(PUBLISH_RETRY_MAX);
                }
            }
        }
    }
}

#[async_trait]
impl Delivery for KafkaDelivery {
    fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }

    fn describe(&self) -> String {
        format!(
            "{}/{}@{}",
            self.partition.topic,
            self.partition.partition,
            self.message.offset()
        )
    }

    async fn settle(self, disposition: Disposition) -> Result<(), TransportError> {
        match disposition {
            Disposition::Ack => {}
            Disposition::Discard => self.dead_letter("malformed").await,
            Disposition::Requeue => self.requeue().await,
        }
        self.shared
            .offsets
            .settled(&self.partition, self.message.offset());

        Ok(())
    }
}

fn attempt_of(message: &OwnedMessage) -> u32 {
    message
        .headers()
        .and_then(|headers| headers.iter().find(|h| h.key == ATTEMPT_HEADER))
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(1)
}

/// Copy `existing` headers, replacing any header named `key`.
fn with_header(existing: Option<&OwnedHeaders>, key: &str, value: &str) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    if let Some(existing) = existing {
        for header in existing.iter().filter(|h| h.key != key) {
            headers = headers.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
    }
    headers.insert(Header {
        key,
        value: Some(value),
    })
}

#[cfg(test)]
mod tests {
    use rdkafka::message::Timestamp;

    use super::*;
    use crate::health::HealthRegistry;

    fn consumer_with(offsets: &Arc<OffsetTracker>) -> BaseConsumer<SourceContext> {
        let liveness = HealthRegistry::new("liveness").register("rdkafka", Duration::from_secs(30));
        ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", "event-dedup-test")
            .create_with_context(SourceContext::new(liveness, offsets.clone()))
            .unwrap()
    }

    fn partition_list(partitions: &[(&str, i32)]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for (topic, partition) in partitions {
            list.add_partition(topic, *partition);
        }
        list
    }

    #[test]
    fn test_revoked_partitions_stop_being_tracked() {
        let offsets = Arc::new(OffsetTracker::new());
        let consumer = consumer_with(&offsets);
        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);
        // Nothing settled yet, so the revocation has nothing to commit.
        offsets.received(&p0, 0);
        offsets.received(&p1, 0);

        let revoked = partition_list(&[("events", 0)]);
        consumer
            .context()
            .pre_rebalance(&consumer, &Rebalance::Revoke(&revoked));
        assert!(offsets.is_rebalancing());
        assert_eq!(offsets.partition_count(), 1);

        consumer
            .context()
            .post_rebalance(&consumer, &Rebalance::Revoke(&revoked));
        assert!(!offsets.is_rebalancing());

        // A handler of the old owner finishing late changes nothing.
        offsets.settled(&p0, 0);
        offsets.settled(&p1, 0);
        let committable = offsets.committable().unwrap();
        assert_eq!(
            committable,
            vec![CommittableOffset {
                partition: p1,
                offset: 1
            }]
        );
    }

    #[test]
    fn test_assigned_partitions_start_clean() {
        let offsets = Arc::new(OffsetTracker::new());
        let consumer = consumer_with(&offsets);
        let p0 = Partition::new("events", 0);
        offsets.received(&p0, 50);
        offsets.settled(&p0, 50);
        offsets.mark_committed(&offsets.committable().unwrap());

        let assigned = partition_list(&[("events", 0)]);
        consumer
            .context()
            .pre_rebalance(&consumer, &Rebalance::Assign(&assigned));
        consumer
            .context()
            .post_rebalance(&consumer, &Rebalance::Assign(&assigned));

        assert!(!offsets.is_rebalancing());
        assert_eq!(offsets.partition_count(), 0);
        offsets.received(&p0, 10);
        offsets.settled(&p0, 10);
        assert_eq!(offsets.committable().unwrap()[0].offset, 11);
    }

    #[test]
    fn test_partition_lists_convert() {
        let list = partition_list(&[("events", 0), ("events", 3)]);
        assert_eq!(
            partitions_of(&list),
            vec![Partition::new("events", 0), Partition::new("events", 3)]
        );

        let list = to_partition_list(&[CommittableOffset {
            partition: Partition::new("events", 2),
            offset: 17,
        }])
        .unwrap();
        let element = list.find_partition("events", 2).unwrap();
        assert_eq!(element.offset(), Offset::Offset(17));
    }

    fn message(headers: Option<OwnedHeaders>) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::NotAvailable,
            0,
            42,
            headers,
        )
    }

    fn header_value(headers: &OwnedHeaders, key: &str) -> Option<String> {
        headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    #[test]
    fn test_attempt_defaults_to_first_delivery() {
        assert_eq!(attempt_of(&message(None)), 1);
        assert_eq!(attempt_of(&message(Some(OwnedHeaders::new()))), 1);
    }

    #[test]
    fn test_attempt_is_read_from_header() {
        let headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("4"),
        });
        assert_eq!(attempt_of(&message(Some(headers))), 4);

        let garbage = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("four"),
        });
        assert_eq!(attempt_of(&message(Some(garbage))), 1);
    }

    #[test]
    fn test_with_header_replaces_and_preserves() {
        let existing = OwnedHeaders::new()
            .insert(Header {
                key: "trace_id",
                value: Some("abc"),
            })
            .insert(Header {
                key: ATTEMPT_HEADER,
                value: Some("2"),
            });

        let headers = with_header(Some(&existing), ATTEMPT_HEADER, "3");
        assert_eq!(headers.count(), 2);
        assert_eq!(header_value(&headers, "trace_id").as_deref(), Some("abc"));
        assert_eq!(header_value(&headers, ATTEMPT_HEADER).as_deref(), Some("3"));

        let headers = with_header(None, DISCARD_REASON_HEADER, "malformed");
        assert_eq!(
            header_value(&headers, DISCARD_REASON_HEADER).as_deref(),
            Some("malformed")
        );
    }
}
