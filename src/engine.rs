//! Engine/Runner: picks the `Flow` matching the configured `mode`, starts
//! it, and owns the shutdown-signal plumbing the teacher's `run_daemon`
//! used (ctrl_c + SIGTERM via `tokio::select!`, a broadcast channel fanned
//! out to every task).

use std::net::SocketAddr;

use tokio::signal;
use tracing::{error, info};

use crate::config::{Config, Mode};
use crate::error::Result;
use crate::flow::{fan, funnel, one_to_one, Flow, FlowState};
use crate::metrics::start_metrics_server;

pub struct Engine {
    flow: Flow,
    metrics_port: u16,
    metrics_enabled: bool,
}

impl Engine {
    pub async fn build(config: &Config) -> Result<Self> {
        let flow = match config.mode {
            Mode::Funnel => {
                let funnel_config = config.funnel.as_ref().expect("validated by Config::validate");
                funnel::build(config, funnel_config).await?
            }
            Mode::Fan => {
                let fan_config = config.fan.as_ref().expect("validated by Config::validate");
                fan::build(config, fan_config).await?
            }
            Mode::OneToOne => {
                let one_to_one_config = config.one_to_one.as_ref().expect("validated by Config::validate");
                one_to_one::build(config, one_to_one_config).await?
            }
        };

        Ok(Self {
            flow,
            metrics_port: config.metrics_port,
            metrics_enabled: config.metrics_enabled,
        })
    }

    /// Starts the flow and the metrics server (if enabled), then blocks
    /// until a shutdown signal arrives. Returns the flow's final state so
    /// the CLI can choose an exit code.
    pub async fn run(&mut self) -> Result<FlowState> {
        self.flow.start().await?;

        if self.metrics_enabled {
            let addr: SocketAddr = format!("0.0.0.0:{}", self.metrics_port)
                .parse()
                .expect("metrics_port is a valid u16");
            tokio::spawn(async move {
                if let Err(e) = start_metrics_server(addr).await {
                    error!(error = %e, "metrics server exited");
                }
            });
            info!(port = self.metrics_port, "metrics available at /metrics");
        }

        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                info!("shutdown signal received, stopping flow");
            }
            _ = wait_for_flow_failure(&self.flow) => {
                error!("flow reported a fatal error, stopping");
            }
        }

        self.flow.stop().await?;
        Ok(self.flow.state())
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Direct access to the underlying flow, for callers that want to drive
    /// `start`/`stop` themselves instead of going through `run`'s
    /// signal-driven lifecycle (integration tests, mainly).
    pub fn flow_mut(&mut self) -> &mut Flow {
        &mut self.flow
    }
}

/// Polls the flow's state so a self-triggered `Failed` transition (a fatal
/// adapter error) is noticed promptly by the runner, not just recorded.
async fn wait_for_flow_failure(flow: &Flow) {
    loop {
        if flow.state() == FlowState::Failed {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }
}
