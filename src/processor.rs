//! `MessageProcessor`: the pluggable transformation a `Flow` applies to each
//! message between consuming it and routing it to a destination.
//!
//! Selected by name (`processor_class` in config) through a small registry,
//! the same "construct by string key" shape the adapter factory uses.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Transforms a message in place, or drops it by returning `Ok(None)`.
    async fn process(&self, message: Message) -> Result<Option<Message>>;

    fn name(&self) -> &str;
}

/// Passes every message through unchanged. The default when no
/// `processor_class` is configured.
pub struct IdentityProcessor;

#[async_trait]
impl MessageProcessor for IdentityProcessor {
    async fn process(&self, message: Message) -> Result<Option<Message>> {
        Ok(Some(message))
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Tags every header key with an uppercase mirror, e.g. `content-type` ->
/// also sets `CONTENT-TYPE`. Exists mainly as a worked example of a
/// processor that mutates rather than passing through, and is exercised by
/// the integration tests.
pub struct UppercaseHeaderProcessor;

#[async_trait]
impl MessageProcessor for UppercaseHeaderProcessor {
    async fn process(&self, mut message: Message) -> Result<Option<Message>> {
        let upper: Vec<(String, String)> = message
            .headers
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.clone()))
            .collect();
        for (k, v) in upper {
            message.headers.entry(k).or_insert(v);
        }
        Ok(Some(message))
    }

    fn name(&self) -> &str {
        "uppercase_header"
    }
}

/// Drops messages whose payload is empty, passes everything else through.
/// A worked example of a filtering processor.
pub struct DropEmptyProcessor;

#[async_trait]
impl MessageProcessor for DropEmptyProcessor {
    async fn process(&self, message: Message) -> Result<Option<Message>> {
        if message.payload.is_empty() {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    }

    fn name(&self) -> &str {
        "drop_empty"
    }
}

type ProcessorFactory = fn() -> Box<dyn MessageProcessor>;

/// Builds a processor by its configured name.
pub fn create_processor(name: Option<&str>) -> Result<Box<dyn MessageProcessor>> {
    let name = name.unwrap_or("identity");
    let registry: HashMap<&str, ProcessorFactory> = HashMap::from([
        ("identity", (|| Box::new(IdentityProcessor) as Box<dyn MessageProcessor>) as ProcessorFactory),
        (
            "uppercase_header",
            (|| Box::new(UppercaseHeaderProcessor) as Box<dyn MessageProcessor>) as ProcessorFactory,
        ),
        (
            "drop_empty",
            (|| Box::new(DropEmptyProcessor) as Box<dyn MessageProcessor>) as ProcessorFactory,
        ),
    ]);

    registry
        .get(name)
        .map(|factory| factory())
        .ok_or_else(|| crate::error::FlowError::UnknownProcessor(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn identity_passes_message_through() {
        let processor = create_processor(None).unwrap();
        let msg = Message::new("topic", b"payload".to_vec());
        let out = processor.process(msg).await.unwrap();
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn uppercase_header_adds_uppercase_mirror() {
        let processor = create_processor(Some("uppercase_header")).unwrap();
        let msg = Message::new("topic", b"payload".to_vec()).with_header("content-type", "text/plain");
        let out = processor.process(msg).await.unwrap().unwrap();
        assert_eq!(out.headers.get("CONTENT-TYPE").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn drop_empty_filters_blank_payloads() {
        let processor = create_processor(Some("drop_empty")).unwrap();
        let msg = Message::new("topic", Vec::<u8>::new());
        let out = processor.process(msg).await.unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn unknown_processor_name_errors() {
        assert!(create_processor(Some("does-not-exist")).is_err());
    }
}
