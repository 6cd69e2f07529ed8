//! Source/Publisher abstraction over the external brokers a `Flow` talks to.
//!
//! Mirrors the teacher's message-bus split (a connection-level trait plus a
//! per-subscription consumer trait) but generalized from a single hardcoded
//! event schema to the generic `Message`, and from a push/pull-both-ways bus
//! to two narrower traits: a `Flow` either consumes from a `Source` or
//! publishes to a `Publisher`, never both through the same handle.

mod mock;
mod redis_streams;

pub use mock::{MockPublisher, MockSource};
pub use redis_streams::{RedisStreamsPublisher, RedisStreamsSource};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ErrorSeverity, FlowError, Result};
use crate::message::Message;
use crate::metrics::PublishTimer;

/// A consumer handle bound to one or more topics under a consumer group.
#[async_trait]
pub trait SourceConsumer: Send + Sync {
    /// Reads up to `count` messages, waiting at most `timeout` for the
    /// first one. An empty result on timeout is normal, not an error.
    async fn consume(&mut self, count: usize, timeout: Duration) -> Result<Vec<Message>>;

    /// Acknowledges successful processing of a message previously returned
    /// by `consume`.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Signals that processing failed and the message should be redelivered
    /// or otherwise handled by the broker's retry policy.
    async fn nack(&self, message: &Message) -> Result<()>;
}

/// A connection to an upstream broker capable of producing consumers.
#[async_trait]
pub trait Source: Send + Sync {
    async fn subscribe(&self, consumer_group: &str, consumer_name: &str) -> Result<Box<dyn SourceConsumer>>;

    fn adapter_type(&self) -> &'static str;

    async fn is_healthy(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A connection to a downstream broker capable of publishing messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &Message) -> Result<()>;

    async fn publish_batch(&self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.publish(message).await?;
        }
        Ok(())
    }

    fn adapter_type(&self) -> &'static str;

    async fn is_healthy(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Builds a `Source` from its configured adapter name.
pub async fn create_source(adapter: &str, connection_url: &str, topics: Vec<String>) -> Result<Box<dyn Source>> {
    match adapter {
        "mock" => Ok(Box::new(MockSource::new(connection_url, topics))),
        "redis_streams" => {
            let source = RedisStreamsSource::connect(connection_url, topics).await?;
            Ok(Box::new(source))
        }
        other => Err(FlowError::UnknownAdapter(other.to_string())),
    }
}

/// Builds a `Publisher` from its configured adapter name.
pub async fn create_publisher(adapter: &str, connection_url: &str) -> Result<Box<dyn Publisher>> {
    match adapter {
        "mock" => Ok(Box::new(MockPublisher::new(connection_url))),
        "redis_streams" => {
            let publisher = RedisStreamsPublisher::connect(connection_url).await?;
            Ok(Box::new(publisher))
        }
        other => Err(FlowError::UnknownAdapter(other.to_string())),
    }
}

/// Wraps a `Publisher` with bounded retry and publish-latency metrics, the
/// same shape as the teacher's `ResilientPublisher`.
pub struct ResilientPublisher {
    inner: Box<dyn Publisher>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ResilientPublisher {
    pub fn new(inner: Box<dyn Publisher>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            retry_delay,
        }
    }

    pub async fn publish(&self, message: &Message) -> Result<()> {
        let topic = message.destination_topic.clone().unwrap_or_else(|| message.source_topic.clone());
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let _timer = PublishTimer::new(topic.clone());
            match self.inner.publish(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // A fatal error means the adapter has declared the
                    // session unrecoverable; retrying it is pointless, so
                    // surface it immediately instead of exhausting retries.
                    let fatal = e.severity() == ErrorSeverity::Fatal;
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| FlowError::RoutingFailed {
            topic,
            reason: "publish failed with no recorded error".to_string(),
        }))
    }

    pub async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
