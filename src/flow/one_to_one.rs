//! One-to-one: each source topic maps to exactly one destination topic.
//! Ordering across a given source topic's messages is opt-in
//! (`one_to_one.ordered`); when enabled `Flow` partitions its intermediate
//! queues by a hash of `source_topic` instead of sharing one queue, so all
//! messages from the same source topic are handled by the same single
//! -concurrency lane and therefore published in the order they were read.

use std::collections::HashMap;

use crate::adapters::{create_publisher, create_source, ResilientPublisher};
use crate::config::{Config, OneToOneConfig};
use crate::error::Result;
use crate::message::Message;
use crate::processor::create_processor;

use super::{Flow, RouteOutcome, SourceBinding, Topology};

pub struct OneToOneTopology {
    mappings: HashMap<String, String>,
}

impl Topology for OneToOneTopology {
    fn route(&self, message: &Message) -> RouteOutcome {
        match self.mappings.get(&message.source_topic) {
            Some(destination) => RouteOutcome::Forward(destination.clone()),
            None => RouteOutcome::RoutingFailed,
        }
    }

    fn mode_name(&self) -> &'static str {
        "one_to_one"
    }
}

pub async fn build(config: &Config, one_to_one: &OneToOneConfig) -> Result<Flow> {
    let topics: Vec<String> = one_to_one.mappings.iter().map(|m| m.source_topic.clone()).collect();
    let source = create_source(&one_to_one.source.adapter, &one_to_one.source.connection_url, topics.clone()).await?;
    let sources = vec![SourceBinding { source, topics }];

    let raw_publisher = create_publisher(&one_to_one.publisher.adapter, &one_to_one.publisher.connection_url).await?;
    let publisher = ResilientPublisher::new(raw_publisher, 3, std::time::Duration::from_millis(100));

    let mappings = one_to_one
        .mappings
        .iter()
        .map(|m| (m.source_topic.clone(), m.destination_topic.clone()))
        .collect();

    let topology = Box::new(OneToOneTopology { mappings });
    let processor = create_processor(config.processor_class.as_deref())?;

    Ok(Flow::new(
        "one_to_one",
        sources,
        publisher,
        topology,
        processor,
        config.thread_pool.clone(),
        config.back_pressure.clone(),
        std::time::Duration::from_secs(config.shutdown_timeout_seconds),
        one_to_one.ordered,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_messages_by_source_topic() {
        let mut mappings = HashMap::new();
        mappings.insert("orders".to_string(), "orders-processed".to_string());
        let topology = OneToOneTopology { mappings };

        let message = Message::new("orders", b"x".to_vec());
        assert_eq!(topology.route(&message), RouteOutcome::Forward("orders-processed".to_string()));

        let unmapped = Message::new("unknown", b"x".to_vec());
        assert_eq!(topology.route(&unmapped), RouteOutcome::RoutingFailed);
    }
}
