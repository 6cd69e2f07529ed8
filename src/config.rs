//! Configuration for the flow engine
//!
//! Loaded the way the teacher loads it: a `.env` file (optional) followed by
//! environment variables with a `__`-separated path (`FLOWBRIDGE_MODE`,
//! `FLOWBRIDGE_THREAD_POOL__MAX_WORKERS`, ...), deserialized through the
//! `config` crate into this typed struct. Every field that has a sane default
//! uses `#[serde(default = "...")]` so a minimal environment still produces a
//! valid configuration for the chosen `mode`.

use std::path::Path;

use serde::Deserialize;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Funnel,
    Fan,
    OneToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadPoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_max_workers() -> usize {
    20
}

fn default_queue_size() -> usize {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackPressureConfig {
    #[serde(default = "default_bp_enabled")]
    pub enabled: bool,
    #[serde(default = "default_high_watermark")]
    pub queue_high_watermark: f64,
    #[serde(default = "default_low_watermark")]
    pub queue_low_watermark: f64,
}

impl Default for BackPressureConfig {
    fn default() -> Self {
        Self {
            enabled: default_bp_enabled(),
            queue_high_watermark: default_high_watermark(),
            queue_low_watermark: default_low_watermark(),
        }
    }
}

fn default_bp_enabled() -> bool {
    true
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_low_watermark() -> f64 {
    0.5
}

/// A source or publisher endpoint: which adapter to construct, and where it
/// connects. `topics` is populated for sources that subscribe to more than
/// one topic (Funnel); `topic` for the single-topic case (Fan, One-to-one).
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub adapter: String,
    pub connection_url: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunnelConfig {
    pub sources: Vec<EndpointConfig>,
    pub publisher: EndpointConfig,
    pub destination_topic: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolverType {
    Header,
    PayloadKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(rename = "type")]
    pub resolver_type: ResolverType,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanConfig {
    pub source: EndpointConfig,
    pub publisher: EndpointConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicMapping {
    pub source_topic: String,
    pub destination_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OneToOneConfig {
    pub source: EndpointConfig,
    pub publisher: EndpointConfig,
    pub mappings: Vec<TopicMapping>,
    #[serde(default)]
    pub ordered: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,

    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    #[serde(default)]
    pub back_pressure: BackPressureConfig,

    pub processor_class: Option<String>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    pub funnel: Option<FunnelConfig>,
    pub fan: Option<FanConfig>,
    pub one_to_one: Option<OneToOneConfig>,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from an optional `.env`-style file followed by
    /// environment variables (`FLOWBRIDGE__...`).
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = env_file {
            dotenvy::from_path(path).map_err(|e| FlowError::Config(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok();
        }

        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FLOWBRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build().map_err(|e| FlowError::Config(e.to_string()))?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| FlowError::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates cross-field invariants the `config` crate cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.back_pressure.queue_low_watermark <= 0.0
            || self.back_pressure.queue_high_watermark <= 0.0
            || self.back_pressure.queue_high_watermark > 1.0
            || self.back_pressure.queue_low_watermark > 1.0
        {
            return Err(FlowError::Config(
                "back_pressure watermarks must be in (0, 1]".to_string(),
            ));
        }
        if self.back_pressure.queue_low_watermark > self.back_pressure.queue_high_watermark {
            return Err(FlowError::Config(
                "back_pressure.queue_low_watermark must be <= queue_high_watermark".to_string(),
            ));
        }
        if self.thread_pool.max_workers == 0 {
            return Err(FlowError::Config("thread_pool.max_workers must be >= 1".to_string()));
        }
        if self.thread_pool.queue_size == 0 {
            return Err(FlowError::Config("thread_pool.queue_size must be >= 1".to_string()));
        }

        match self.mode {
            Mode::Funnel => {
                let funnel = self
                    .funnel
                    .as_ref()
                    .ok_or_else(|| FlowError::Config("mode=funnel requires a [funnel] section".to_string()))?;
                if funnel.sources.is_empty() {
                    return Err(FlowError::Config("funnel.sources must not be empty".to_string()));
                }
            }
            Mode::Fan => {
                self.fan
                    .as_ref()
                    .ok_or_else(|| FlowError::Config("mode=fan requires a [fan] section".to_string()))?;
            }
            Mode::OneToOne => {
                let one_to_one = self.one_to_one.as_ref().ok_or_else(|| {
                    FlowError::Config("mode=one_to_one requires a [one_to_one] section".to_string())
                })?;
                if one_to_one.mappings.is_empty() {
                    return Err(FlowError::Config("one_to_one.mappings must not be empty".to_string()));
                }
                let mut seen = std::collections::HashSet::new();
                for mapping in &one_to_one.mappings {
                    if !seen.insert(mapping.source_topic.as_str()) {
                        return Err(FlowError::Config(format!(
                            "one_to_one.mappings has a duplicate source_topic: {}",
                            mapping.source_topic
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Convenience constructor used by tests and by callers assembling a config
/// entirely in-process (no environment/`.env` involved).
pub fn funnel_endpoint(adapter: &str, connection_url: &str, topics: Vec<String>) -> EndpointConfig {
    EndpointConfig {
        adapter: adapter.to_string(),
        connection_url: connection_url.to_string(),
        topics,
        topic: None,
    }
}

pub fn single_topic_endpoint(adapter: &str, connection_url: &str, topic: &str) -> EndpointConfig {
    EndpointConfig {
        adapter: adapter.to_string(),
        connection_url: connection_url.to_string(),
        topics: vec![],
        topic: Some(topic.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: Mode) -> Config {
        Config {
            mode,
            thread_pool: ThreadPoolConfig::default(),
            back_pressure: BackPressureConfig::default(),
            processor_class: None,
            shutdown_timeout_seconds: default_shutdown_timeout(),
            funnel: None,
            fan: None,
            one_to_one: None,
            metrics_port: default_metrics_port(),
            metrics_enabled: default_metrics_enabled(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut cfg = base_config(Mode::Fan);
        cfg.fan = Some(FanConfig {
            source: single_topic_endpoint("mock", "mock://", "in"),
            publisher: single_topic_endpoint("mock", "mock://", "out"),
            resolver: ResolverConfig {
                resolver_type: ResolverType::Header,
                key: "destination_topic".to_string(),
            },
        });
        cfg.back_pressure.queue_high_watermark = 0.4;
        cfg.back_pressure.queue_low_watermark = 0.8;

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_mode_section() {
        let cfg = base_config(Mode::Funnel);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_one_to_one_source_topics() {
        let mut cfg = base_config(Mode::OneToOne);
        cfg.one_to_one = Some(OneToOneConfig {
            source: funnel_endpoint("mock", "mock://", vec!["orders".to_string()]),
            publisher: single_topic_endpoint("mock", "mock://", "orders-processed"),
            mappings: vec![
                TopicMapping {
                    source_topic: "orders".to_string(),
                    destination_topic: "orders-processed".to_string(),
                },
                TopicMapping {
                    source_topic: "orders".to_string(),
                    destination_topic: "orders-processed-2".to_string(),
                },
            ],
            ordered: false,
        });

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_funnel_config() {
        let mut cfg = base_config(Mode::Funnel);
        cfg.funnel = Some(FunnelConfig {
            sources: vec![funnel_endpoint("mock", "mock://", vec!["t1".to_string(), "t2".to_string()])],
            publisher: single_topic_endpoint("mock", "mock://", "out"),
            destination_topic: "out".to_string(),
        });
        assert!(cfg.validate().is_ok());
    }
}
