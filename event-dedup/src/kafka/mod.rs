pub mod offsets;
pub mod source;

pub use source::{KafkaDelivery, KafkaSource, KafkaSourceConfig, ATTEMPT_HEADER, DISCARD_REASON_HEADER};
