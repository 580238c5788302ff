//! Demo firmware entry point: wires up the agent subsystems with a fixed
//! `AgentConfig::development()` the way a device image would, with no
//! command-line surface. Real devices embed the library directly and supply
//! their own [`soap::SoapCommandHandler`]/[`server_session::ServerSessionCallbacks`]
//! implementations; this binary's no-op versions exist only to make the crate
//! runnable standalone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axeda_agent::config::AgentConfig;
use axeda_agent::domain_types::{DeviceId, PingIntervalMs, RetryDelayMs, ServerConfigId};
use axeda_agent::error::AxedaError;
use axeda_agent::queue::MessageQueue;
use axeda_agent::server_session::{ServerSession, ServerSessionCallbacks, ServerSessionConfig};
use axeda_agent::soap::{CommandResult, SoapCommandHandler, SoapDispatcher};
use axeda_agent::observability;
use axeda_agent::user_agent::UserAgent;
use tracing::{info, warn};

struct NoopSoapHandler;

#[async_trait]
impl SoapCommandHandler for NoopSoapHandler {
    async fn set_tag(&self, name: &str, value: &str) -> CommandResult {
        info!(name, value, "SetTag (no-op demo handler)");
        CommandResult::ok()
    }

    async fn set_time(&self, timestamp: &str) -> CommandResult {
        info!(timestamp, "SetTime (no-op demo handler)");
        CommandResult::ok()
    }

    async fn restart(&self, hard: bool) -> CommandResult {
        warn!(hard, "Restart requested but ignored by the demo binary");
        CommandResult::ok()
    }

    async fn file_transfer_start(&self, attrs: &HashMap<String, String>) -> CommandResult {
        info!(?attrs, "FileTransferStart (no-op demo handler)");
        CommandResult::ok()
    }

    async fn file_transfer_stop(&self, attrs: &HashMap<String, String>) -> CommandResult {
        info!(?attrs, "FileTransferStop (no-op demo handler)");
        CommandResult::ok()
    }

    async fn file_transfer_pause(&self, attrs: &HashMap<String, String>) -> CommandResult {
        info!(?attrs, "FileTransferPause (no-op demo handler)");
        CommandResult::ok()
    }

    async fn remote_session_start(&self, attrs: &HashMap<String, String>) -> CommandResult {
        info!(?attrs, "RemoteSessionStart (no-op demo handler)");
        CommandResult::ok()
    }

    async fn catch_all(&self, method: &str, attrs: &HashMap<String, String>) -> CommandResult {
        warn!(method, ?attrs, "unrecognized SOAP method");
        CommandResult::failed(1, format!("unsupported method: {method}"))
    }
}

struct LoggingCallbacks;

#[async_trait]
impl ServerSessionCallbacks for LoggingCallbacks {
    async fn on_ping_rate_update(&self, new_interval: PingIntervalMs) {
        info!(?new_interval, "server updated the ping rate");
    }

    async fn on_web_error(&self, error: AxedaError) {
        warn!(%error, "server session reported a delivery error");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::development();
    observability::init(config.log_level);
    info!("starting axeda agent");

    let queue = MessageQueue::new(config.queue_byte_budget);
    let user_agent = Arc::new(UserAgent::from_config(
        Duration::from_millis(config.http.timeout_ms),
        &config.tls,
        &config.proxy,
    )?);
    let soap = Arc::new(SoapDispatcher::new(Arc::new(NoopSoapHandler), queue.clone()));

    let session_config = ServerSessionConfig {
        device_id: DeviceId::new(1),
        server_config_id: ServerConfigId::new(1),
        device_model_number: "demo-device".to_string(),
        device_serial_number: "0000-0000".to_string(),
        device_owner: String::new(),
        post_host: "localhost".to_string(),
        post_port: 443,
        post_path: "/eMessage".to_string(),
        post_tls: true,
        content_type: "text/xml".to_string(),
        emessage_budget: config.emessage_byte_budget,
        ping_interval: config.ping_interval,
        min_retry_delay: RetryDelayMs::new(config.retry_period_ms),
        max_retry_delay: RetryDelayMs::new(config.retry_period_ms * 10),
    };
    let session = Arc::new(ServerSession::new(
        session_config,
        queue.clone(),
        user_agent,
        soap,
        Arc::new(LoggingCallbacks),
    ));

    let mut ticker = tokio::time::interval(config.ping_interval.as_duration());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let urgent_pending = !queue.is_empty().await;
                session.tick(urgent_pending).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
