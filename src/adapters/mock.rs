//! In-process mock adapter, backed by the same `BoundedQueue` the engine
//! itself uses. Topics are named channels inside a process-wide registry
//! keyed by `connection_url` so a `MockPublisher` and a `MockSource`
//! constructed independently (as the engine does: one per endpoint) still
//! rendezvous on the same queue. Exists for integration tests and for
//! running a flow with no external broker at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::{Publisher, Source, SourceConsumer};
use crate::error::Result;
use crate::message::Message;
use crate::queue::BoundedQueue;

const MOCK_TOPIC_CAPACITY: usize = 10_000;

type TopicRegistry = Mutex<HashMap<String, Arc<BoundedQueue<Message>>>>;

static REGISTRY: Lazy<TopicRegistry> = Lazy::new(|| Mutex::new(HashMap::new()));

fn queue_for(connection_url: &str, topic: &str) -> Arc<BoundedQueue<Message>> {
    let key = format!("{connection_url}#{topic}");
    let mut registry = REGISTRY.lock();
    registry
        .entry(key)
        .or_insert_with(|| Arc::new(BoundedQueue::new(MOCK_TOPIC_CAPACITY)))
        .clone()
}

/// Removes every topic registered under `connection_url`. Used by tests to
/// get a clean slate between scenarios sharing a `mock://` URL.
pub fn reset(connection_url: &str) {
    let prefix = format!("{connection_url}#");
    REGISTRY.lock().retain(|key, _| !key.starts_with(&prefix));
}

/// Publishes a message directly into the registry, bypassing a `Publisher`
/// handle. Lets integration tests seed a source topic without constructing
/// a whole flow.
pub async fn seed(connection_url: &str, topic: &str, message: Message) {
    let queue = queue_for(connection_url, topic);
    let _ = queue.put(message, Duration::from_secs(1)).await;
}

/// Drains and returns every message currently queued on `topic`. Used by
/// integration tests to assert what a flow published downstream.
pub async fn drain(connection_url: &str, topic: &str) -> Vec<Message> {
    let queue = queue_for(connection_url, topic);
    let mut out = Vec::new();
    while let Ok(Some(message)) = queue.get(Duration::from_millis(10)).await {
        out.push(message);
    }
    out
}

pub struct MockSource {
    connection_url: String,
    topics: Vec<String>,
}

impl MockSource {
    pub fn new(connection_url: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            connection_url: connection_url.into(),
            topics,
        }
    }
}

#[async_trait]
impl Source for MockSource {
    async fn subscribe(&self, _consumer_group: &str, _consumer_name: &str) -> Result<Box<dyn SourceConsumer>> {
        let queues = self
            .topics
            .iter()
            .map(|topic| queue_for(&self.connection_url, topic))
            .collect();
        Ok(Box::new(MockSourceConsumer { queues, next: 0 }))
    }

    fn adapter_type(&self) -> &'static str {
        "mock"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockSourceConsumer {
    queues: Vec<Arc<BoundedQueue<Message>>>,
    next: usize,
}

#[async_trait]
impl SourceConsumer for MockSourceConsumer {
    async fn consume(&mut self, count: usize, timeout: Duration) -> Result<Vec<Message>> {
        if self.queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::new();
        let n = self.queues.len();

        while out.len() < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let mut got_one = false;
            for i in 0..n {
                let idx = (self.next + i) % n;
                if let Ok(Some(message)) = self.queues[idx].get(Duration::from_millis(0)).await {
                    out.push(message);
                    self.next = (idx + 1) % n;
                    got_one = true;
                    break;
                }
            }

            if !got_one {
                let per_poll = Duration::from_millis(20).min(remaining);
                tokio::time::sleep(per_poll).await;
            }
        }

        Ok(out)
    }

    async fn ack(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _message: &Message) -> Result<()> {
        Ok(())
    }
}

pub struct MockPublisher {
    connection_url: String,
}

impl MockPublisher {
    pub fn new(connection_url: impl Into<String>) -> Self {
        Self {
            connection_url: connection_url.into(),
        }
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, message: &Message) -> Result<()> {
        let topic = message
            .destination_topic
            .clone()
            .unwrap_or_else(|| message.source_topic.clone());
        let queue = queue_for(&self.connection_url, &topic);
        let _ = queue.put(message.clone(), Duration::from_secs(5)).await;
        Ok(())
    }

    fn adapter_type(&self) -> &'static str {
        "mock"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_and_source_rendezvous_on_the_same_topic() {
        let url = "mock://test-rendezvous";
        reset(url);

        let publisher = MockPublisher::new(url);
        let message = Message::new("in", b"hello".to_vec()).with_destination_topic("out");
        publisher.publish(&message).await.unwrap();

        let source = MockSource::new(url, vec!["out".to_string()]);
        let mut consumer = source.subscribe("group", "consumer-1").await.unwrap();
        let received = consumer.consume(1, Duration::from_millis(100)).await.unwrap();

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload_as_str(), Some("hello"));
    }

    #[tokio::test]
    async fn consume_times_out_with_empty_result_when_no_messages() {
        let url = "mock://test-empty";
        reset(url);

        let source = MockSource::new(url, vec!["quiet".to_string()]);
        let mut consumer = source.subscribe("group", "consumer-1").await.unwrap();
        let received = consumer.consume(5, Duration::from_millis(50)).await.unwrap();

        assert!(received.is_empty());
    }
}
