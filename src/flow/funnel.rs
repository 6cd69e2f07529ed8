//! Funnel: many source topics (possibly across several source connections)
//! converge onto a single destination topic.

use crate::adapters::{create_publisher, create_source, ResilientPublisher};
use crate::config::{Config, FunnelConfig};
use crate::error::{FlowError, Result};
use crate::message::Message;
use crate::processor::create_processor;

use super::{Flow, RouteOutcome, SourceBinding, Topology};

pub struct FunnelTopology {
    destination_topic: String,
}

impl Topology for FunnelTopology {
    fn route(&self, _message: &Message) -> RouteOutcome {
        RouteOutcome::Forward(self.destination_topic.clone())
    }

    fn mode_name(&self) -> &'static str {
        "funnel"
    }
}

pub async fn build(config: &Config, funnel: &FunnelConfig) -> Result<Flow> {
    let mut sources = Vec::with_capacity(funnel.sources.len());
    for endpoint in &funnel.sources {
        if endpoint.topics.is_empty() {
            return Err(FlowError::Config("funnel source endpoints require at least one topic".to_string()));
        }
        let source = create_source(&endpoint.adapter, &endpoint.connection_url, endpoint.topics.clone()).await?;
        sources.push(SourceBinding {
            source,
            topics: endpoint.topics.clone(),
        });
    }

    let raw_publisher = create_publisher(&funnel.publisher.adapter, &funnel.publisher.connection_url).await?;
    let publisher = ResilientPublisher::new(raw_publisher, 3, std::time::Duration::from_millis(100));

    let topology = Box::new(FunnelTopology {
        destination_topic: funnel.destination_topic.clone(),
    });

    let processor = create_processor(config.processor_class.as_deref())?;

    Ok(Flow::new(
        "funnel",
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
