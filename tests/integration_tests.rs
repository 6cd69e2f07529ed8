//! End-to-end scenarios against the `mock` adapter: a flow is built from an
//! in-process config, started, fed messages through the mock broker
//! registry, and asserted against what comes out the other side.

use std::time::Duration;

use flowbridge::adapters::mock;
use flowbridge::config::{
    BackPressureConfig, Config, EndpointConfig, FanConfig, FunnelConfig, Mode, OneToOneConfig,
    ResolverConfig, ResolverType, ThreadPoolConfig, TopicMapping,
};
use flowbridge::engine::Engine;
use flowbridge::message::Message;

fn base_config(mode: Mode) -> Config {
    Config {
        mode,
        thread_pool: ThreadPoolConfig {
            max_workers: 4,
            queue_size: 64,
        },
        back_pressure: BackPressureConfig {
            enabled: true,
            queue_high_watermark: 0.8,
            queue_low_watermark: 0.5,
        },
        processor_class: None,
        shutdown_timeout_seconds: 5,
        funnel: None,
        fan: None,
        one_to_one: None,
        metrics_port: 0,
        metrics_enabled: false,
        log_level: "info".to_string(),
        json_logs: false,
    }
}

fn endpoint(url: &str, topics: Vec<&str>) -> EndpointConfig {
    EndpointConfig {
        adapter: "mock".to_string(),
        connection_url: url.to_string(),
        topics: topics.into_iter().map(String::from).collect(),
        topic: None,
    }
}

fn single_topic(url: &str, topic: &str) -> EndpointConfig {
    EndpointConfig {
        adapter: "mock".to_string(),
        connection_url: url.to_string(),
        topics: vec![],
        topic: Some(topic.to_string()),
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn e1_funnel_merges_multiple_source_topics() {
    let url = "mock://e1";
    mock::reset(url);

    let mut config = base_config(Mode::Funnel);
    config.funnel = Some(FunnelConfig {
        sources: vec![endpoint(url, vec!["t1", "t2"])],
        publisher: single_topic(url, "out"),
        destination_topic: "out".to_string(),
    });

    for payload in ["a", "b"] {
        mock::seed(url, "t1", Message::new("t1", payload.as_bytes().to_vec())).await;
    }
    mock::seed(url, "t2", Message::new("t2", b"c".to_vec())).await;

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();

    wait_until(
        || {
            let snapshot = engine.flow().metrics().snapshot();
            snapshot
                .iter()
                .find(|s| s.topic == "out" && s.side == flowbridge::metrics::Side::Destination)
                .map(|s| s.message_count)
                .unwrap_or(0)
                == 3
        },
        Duration::from_secs(3),
    )
    .await;

    engine.flow_mut().stop().await.unwrap();

    let received = mock::drain(url, "out").await;
    let mut payloads: Vec<String> = received.iter().filter_map(|m| m.payload_as_str().map(str::to_string)).collect();
    payloads.sort();
    assert_eq!(payloads, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn e2_fan_routes_by_header() {
    let url = "mock://e2";
    mock::reset(url);

    let mut config = base_config(Mode::Fan);
    config.fan = Some(FanConfig {
        source: single_topic(url, "events"),
        publisher: single_topic(url, "unused"),
        resolver: ResolverConfig {
            resolver_type: ResolverType::Header,
            key: "destination_topic".to_string(),
        },
    });

    mock::seed(
        url,
        "events",
        Message::new("events", b"X".to_vec()).with_header("destination_topic", "orders"),
    )
    .await;
    mock::seed(
        url,
        "events",
        Message::new("events", b"Y".to_vec()).with_header("destination_topic", "payments"),
    )
    .await;

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.flow_mut().stop().await.unwrap();

    let orders = mock::drain(url, "orders").await;
    let payments = mock::drain(url, "payments").await;

    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].payload_as_str(), Some("X"));
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].payload_as_str(), Some("Y"));
}

#[tokio::test]
async fn e3_fan_routes_by_payload_key() {
    let url = "mock://e3";
    mock::reset(url);

    let mut config = base_config(Mode::Fan);
    config.fan = Some(FanConfig {
        source: single_topic(url, "events"),
        publisher: single_topic(url, "unused"),
        resolver: ResolverConfig {
            resolver_type: ResolverType::PayloadKey,
            key: "routing_key".to_string(),
        },
    });

    let payload = br#"{"routing_key":"metrics","data":"cpu"}"#.to_vec();
    mock::seed(url, "events", Message::new("events", payload.clone())).await;

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.flow_mut().stop().await.unwrap();

    let metrics_topic = mock::drain(url, "metrics").await;
    assert_eq!(metrics_topic.len(), 1);
    assert_eq!(metrics_topic[0].payload, payload);
}

#[tokio::test]
async fn e4_one_to_one_keeps_destinations_isolated() {
    let url = "mock://e4";
    mock::reset(url);

    let mut config = base_config(Mode::OneToOne);
    config.one_to_one = Some(OneToOneConfig {
        source: endpoint(url, vec!["orders", "payments"]),
        publisher: single_topic(url, "unused"),
        mappings: vec![
            TopicMapping {
                source_topic: "orders".to_string(),
                destination_topic: "orders-processed".to_string(),
            },
            TopicMapping {
                source_topic: "payments".to_string(),
                destination_topic: "payments-processed".to_string(),
            },
        ],
        ordered: false,
    });

    mock::seed(url, "orders", Message::new("orders", b"order-123".to_vec())).await;
    mock::seed(url, "payments", Message::new("payments", b"payment-456".to_vec())).await;

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.flow_mut().stop().await.unwrap();

    let orders_out = mock::drain(url, "orders-processed").await;
    let payments_out = mock::drain(url, "payments-processed").await;

    assert_eq!(orders_out.len(), 1);
    assert_eq!(orders_out[0].payload_as_str(), Some("order-123"));
    assert_eq!(payments_out.len(), 1);
    assert_eq!(payments_out[0].payload_as_str(), Some("payment-456"));
}

#[tokio::test]
async fn e5_backpressure_slows_a_saturated_destination() {
    let url = "mock://e5";
    mock::reset(url);

    let mut config = base_config(Mode::Funnel);
    // One worker, small queue: the lane queue fills up fast enough to
    // observe the gate engage while the destination is still catching up.
    config.thread_pool.max_workers = 1;
    config.thread_pool.queue_size = 10;
    config.funnel = Some(FunnelConfig {
        sources: vec![endpoint(url, vec!["fast"])],
        publisher: single_topic(url, "slow-out"),
        destination_topic: "slow-out".to_string(),
    });

    for i in 0..40 {
        mock::seed(url, "fast", Message::new("fast", format!("m{i}").into_bytes())).await;
    }

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();

    // Give the source loop time to run well past the high watermark at
    // least once; the queue/backpressure unit tests already pin down the
    // exact engage/release thresholds, this just checks the flow doesn't
    // stall or drop anything while under pressure.
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.flow_mut().stop().await.unwrap();

    let delivered = mock::drain(url, "slow-out").await.len();
    assert_eq!(delivered, 40);
}

#[tokio::test]
async fn e6_graceful_shutdown_accounts_for_every_message() {
    let url = "mock://e6";
    mock::reset(url);

    let mut config = base_config(Mode::Funnel);
    config.thread_pool.queue_size = 256;
    config.funnel = Some(FunnelConfig {
        sources: vec![endpoint(url, vec!["bulk"])],
        publisher: single_topic(url, "out"),
        destination_topic: "out".to_string(),
    });

    const TOTAL: usize = 2_000;
    for i in 0..TOTAL {
        mock::seed(url, "bulk", Message::new("bulk", format!("msg-{i}").into_bytes())).await;
    }

    let mut engine = Engine::build(&config).await.unwrap();
    engine.flow_mut().start().await.unwrap();

    // Stop almost immediately: some messages will still be mid-flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.flow_mut().stop().await.unwrap();

    let delivered = mock::drain(url, "out").await.len();
    let snapshot = engine.flow().metrics().snapshot();
    let source_count = snapshot
        .iter()
        .find(|s| s.topic == "bulk" && s.side == flowbridge::metrics::Side::Source)
        .map(|s| s.message_count)
        .unwrap_or(0) as usize;

    // Drain mode means every message the source loop admitted is either
    // published or still sitting in the queue/registry; nothing vanishes.
    assert!(delivered <= source_count);
    assert!(source_count <= TOTAL);
}
