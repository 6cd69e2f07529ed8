//! Fan: one source topic fans out to destinations picked per-message by a
//! `DestinationResolver`. Destinations are never pre-declared — the first
//! message routed to a given topic is what causes metrics bookkeeping (in
//! `MetricsCollector`) to start tracking it; the underlying publisher reads
//! `message.destination_topic` at call time and needs no prior knowledge of
//! which topics exist.

use crate::adapters::{create_publisher, create_source, ResilientPublisher};
use crate::config::{Config, FanConfig, ResolverType};
use crate::error::Result;
use crate::message::Message;
use crate::processor::create_processor;

use super::{Flow, RouteOutcome, SourceBinding, Topology};

pub struct DestinationResolver {
    resolver_type: ResolverType,
    key: String,
}

impl DestinationResolver {
    pub fn new(resolver_type: ResolverType, key: impl Into<String>) -> Self {
        Self {
            resolver_type,
            key: key.into(),
        }
    }

    pub fn resolve(&self, message: &Message) -> Option<String> {
        match self.resolver_type {
            ResolverType::Header => message.headers.get(&self.key).cloned(),
            ResolverType::PayloadKey => message.payload_json_field(&self.key),
        }
    }
}

pub struct FanTopology {
    resolver: DestinationResolver,
}

impl Topology for FanTopology {
    fn route(&self, message: &Message) -> RouteOutcome {
        match self.resolver.resolve(message) {
            Some(destination) => RouteOutcome::Forward(destination),
            None => RouteOutcome::RoutingFailed,
        }
    }

    fn mode_name(&self) -> &'static str {
        "fan"
    }
}

pub async fn build(config: &Config, fan: &FanConfig) -> Result<Flow> {
    let topics = fan.source.topic.clone().into_iter().collect::<Vec<_>>();
    let source = create_source(&fan.source.adapter, &fan.source.connection_url, topics.clone()).await?;
    let sources = vec![SourceBinding { source, topics }];

    let raw_publisher = create_publisher(&fan.publisher.adapter, &fan.publisher.connection_url).await?;
    let publisher = ResilientPublisher::new(raw_publisher, 3, std::time::Duration::from_millis(100));

    let topology = Box::new(FanTopology {
        resolver: DestinationResolver::new(fan.resolver.resolver_type, fan.resolver.key.clone()),
    });

    let processor = create_processor(config.processor_class.as_deref())?;

    Ok(Flow::new(
        "fan",
        sources,
        publisher,
        topology,
        processor,
        config.thread_pool.clone(),
        config.back_pressure.clone(),
        std::time::Duration::from_secs(config.shutdown_timeout_seconds),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverType;

    #[test]
    fn resolves_destination_from_header() {
        let resolver = DestinationResolver::new(ResolverType::Header, "destination_topic");
        let message = Message::new("events", b"{}".to_vec()).with_header("destination_topic", "alerts");
        assert_eq!(resolver.resolve(&message), Some("alerts".to_string()));
    }

    #[test]
    fn resolves_destination_from_payload_key() {
        let resolver = DestinationResolver::new(ResolverType::PayloadKey, "routing_key");
        let message = Message::new("events", br#"{"routing_key":"alerts"}"#.to_vec());
        assert_eq!(resolver.resolve(&message), Some("alerts".to_string()));
    }

    #[test]
    fn returns_none_when_key_is_absent() {
        let resolver = DestinationResolver::new(ResolverType::Header, "missing");
        let message = Message::new("events", b"{}".to_vec());
        assert_eq!(resolver.resolve(&message), None);
    }
}
