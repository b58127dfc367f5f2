//! The seam between the consumer loop and a concrete queue.
use async_trait::async_trait;
use thiserror::Error;

/// How a delivery is settled with the queue once the handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processed or confirmed duplicate; never deliver again.
    Ack,
    /// Poison message; drop it (or dead-letter it) without redelivery.
    Discard,
    /// Failed on a dependency; deliver again later.
    Requeue,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Discard => "discard",
            Disposition::Requeue => "requeue",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("message source is closed")]
    Closed,
}

/// One message handed out by a `MessageSource`.
#[async_trait]
pub trait Delivery: Send + 'static {
    /// `None` for messages without a body.
    fn payload(&self) -> Option<&[u8]>;

    /// Human readable position of the message, used in logs.
    fn describe(&self) -> String;

    /// Consume the delivery and report the disposition to the queue.
    async fn settle(self, disposition: Disposition) -> Result<(), TransportError>;
}

#[async_trait]
pub trait MessageSource: Send {
    type Message: Delivery;

    /// Wait for the next message. `Ok(None)` means the source is exhausted
    /// and will never yield again.
    async fn recv(&mut self) -> Result<Option<Self::Message>, TransportError>;

    /// Flush whatever settlement state the source keeps, then release it.
    async fn close(self) -> Result<(), TransportError>;
}
