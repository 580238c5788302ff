//! C7: `ServerSession` — per-(server-config, device) controller owning ping
//! timing, message-size budget, delivery result handling, and re-queueing
//! (§4.7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::domain_types::{DeviceId, EMessageByteBudget, PingIntervalMs, RetryDelayMs, ServerConfigId};
use crate::emessage::{format_timestamp, EMessageBuilder, EMessageKind};
use crate::error::AxedaError;
use crate::http::request::{Request, RequestHandler};
use crate::queue::MessageQueue;
use crate::soap::SoapDispatcher;
use crate::user_agent::UserAgent;

/// Static identity and endpoint for one `ServerSession` (§4.7).
#[derive(Debug, Clone)]
pub struct ServerSessionConfig {
    pub device_id: DeviceId,
    pub server_config_id: ServerConfigId,
    pub device_model_number: String,
    pub device_serial_number: String,
    pub device_owner: String,
    pub post_host: String,
    pub post_port: u16,
    pub post_path: String,
    pub post_tls: bool,
    pub content_type: String,
    pub emessage_budget: EMessageByteBudget,
    pub ping_interval: PingIntervalMs,
    pub min_retry_delay: RetryDelayMs,
    pub max_retry_delay: RetryDelayMs,
}

/// Application hooks invoked on registration/delivery outcomes (§4.7 "the
/// registered web-error callback", "the configured ping-rate-update
/// callback").
#[async_trait]
pub trait ServerSessionCallbacks: Send + Sync {
    /// The server returned a new ping rate on successful registration.
    async fn on_ping_rate_update(&self, new_interval: PingIntervalMs);
    /// A delivery attempt failed at the transport/HTTP layer.
    async fn on_web_error(&self, error: AxedaError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationState {
    Unregistered,
    Registered,
}

struct SessionState {
    registration: RegistrationState,
    last_ping_at: Option<Instant>,
    last_registration_attempt: Option<Instant>,
    backoff: Duration,
}

/// One (server-config, device) controller driving the tick loop described in
/// §4.7: registration retry, ping/urgent-triggered delivery, response
/// dispatch, and failure back-off.
pub struct ServerSession {
    config: Mutex<ServerSessionConfig>,
    queue: MessageQueue,
    user_agent: Arc<UserAgent>,
    soap: Arc<SoapDispatcher>,
    callbacks: Arc<dyn ServerSessionCallbacks>,
    state: Mutex<SessionState>,
    message_counter: AtomicU64,
}

impl ServerSession {
    #[must_use]
    pub fn new(
        config: ServerSessionConfig,
        queue: MessageQueue,
        user_agent: Arc<UserAgent>,
        soap: Arc<SoapDispatcher>,
        callbacks: Arc<dyn ServerSessionCallbacks>,
    ) -> Self {
        let min_delay = config.min_retry_delay.as_duration();
        Self {
            config: Mutex::new(config),
            queue,
            user_agent,
            soap,
            callbacks,
            state: Mutex::new(SessionState {
                registration: RegistrationState::Unregistered,
                last_ping_at: None,
                last_registration_attempt: None,
                backoff: min_delay,
            }),
            message_counter: AtomicU64::new(1),
        }
    }

    /// Runs one tick of the session's control loop (§4.7, numbered steps).
    #[instrument(skip(self))]
    pub async fn tick(&self, urgent_pending: bool) {
        let is_registered = {
            let state = self.state.lock().await;
            state.registration == RegistrationState::Registered
        };

        if !is_registered {
            if self.retry_period_elapsed().await {
                self.attempt_registration().await;
            }
            return;
        }

        if urgent_pending || self.ping_interval_elapsed().await {
            self.deliver_pending().await;
        }
    }

    async fn retry_period_elapsed(&self) -> bool {
        let state = self.state.lock().await;
        match state.last_registration_attempt {
            None => true,
            Some(at) => at.elapsed() >= state.backoff,
        }
    }

    async fn ping_interval_elapsed(&self) -> bool {
        let interval = self.config.lock().await.ping_interval.as_duration();
        let state = self.state.lock().await;
        match state.last_ping_at {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }

    async fn attempt_registration(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            state.last_registration_attempt = Some(Instant::now());
        }
        let config = self.config.lock().await.clone();
        let mut builder = EMessageBuilder::new(EMessageKind::Standard, self.next_message_id(), config.emessage_budget);
        builder.set_device_identity(config.device_id, &config.device_model_number, &config.device_serial_number, &config.device_owner);
        let timestamp = format_timestamp(std::time::SystemTime::now(), crate::config::ServerTimestampMode::Device);
        builder.add_registration(config.device_id, config.ping_interval.as_duration().as_secs() as u32, &timestamp, 0);
        builder.add_managed_devices(config.device_id, &[]);
        let body = builder.finish();

        match self.post(&config, Bytes::from(body)).await {
            Ok(response_body) => {
                self.mark_registered().await;
                self.soap.dispatch_bundle(&response_body, config.device_id, config.server_config_id).await.ok();
                self.apply_ping_rate_update(&response_body).await;
                true
            }
            Err(err) => {
                self.backoff_after_failure().await;
                self.callbacks.on_web_error(err).await;
                false
            }
        }
    }

    /// Adopts a server-supplied ping rate and notifies callbacks, if the
    /// response carries one (§4.7 "the server returned a new ping rate,
    /// invoke the configured ping-rate-update callback and adopt the new
    /// rate").
    async fn apply_ping_rate_update(&self, response_body: &[u8]) {
        let Some(new_rate_secs) = crate::soap::parse_ping_rate_update(response_body) else {
            return;
        };
        let new_interval = PingIntervalMs::new(new_rate_secs.saturating_mul(1000));
        let changed = {
            let mut config = self.config.lock().await;
            if config.ping_interval == new_interval {
                false
            } else {
                config.ping_interval = new_interval;
                true
            }
        };
        if changed {
            self.callbacks.on_ping_rate_update(new_interval).await;
        }
    }

    async fn mark_registered(&self) {
        let mut state = self.state.lock().await;
        state.registration = RegistrationState::Registered;
        state.backoff = self.config.lock().await.min_retry_delay.as_duration();
    }

    async fn backoff_after_failure(&self) {
        let max = self.config.lock().await.max_retry_delay.as_duration();
        let mut state = self.state.lock().await;
        state.backoff = (state.backoff.saturating_mul(2)).min(max);
    }

    async fn deliver_pending(&self) {
        let config = self.config.lock().await.clone();
        let message_id = MessageQueue::new_message_id();
        let items = self
            .queue
            .fetch_for_delivery(config.server_config_id, usize::MAX, message_id)
            .await;

        let mut builder = EMessageBuilder::new(EMessageKind::Standard, self.next_message_id(), config.emessage_budget);
        builder.set_device_identity(config.device_id, &config.device_model_number, &config.device_serial_number, &config.device_owner);
        let timestamp = format_timestamp(std::time::SystemTime::now(), crate::config::ServerTimestampMode::Device);
        builder.add_ping(config.device_id, &timestamp);
        for item in &items {
            builder.add_raw_content(config.device_id, &item.content);
        }
        {
            let mut state = self.state.lock().await;
            state.last_ping_at = Some(Instant::now());
        }
        let body = builder.finish();

        match self.post(&config, Bytes::from(body)).await {
            Ok(response_body) => {
                self.queue.delete_by_message_id(message_id, config.device_id).await;
                self.soap.dispatch_bundle(&response_body, config.device_id, config.server_config_id).await.ok();
                self.apply_ping_rate_update(&response_body).await;
                self.mark_registered().await;
            }
            Err(err) => {
                self.queue.requeue_by_message_id(message_id).await;
                self.backoff_after_failure().await;
                self.callbacks.on_web_error(err).await;
            }
        }
    }

    fn next_message_id(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn post(&self, config: &ServerSessionConfig, body: Bytes) -> Result<Bytes, AxedaError> {
        let handler = Arc::new(CapturingHandler::default());
        let req = Request::post(config.post_host.clone(), config.post_port, config.post_path.clone(), body, config.content_type.clone())
            .with_tls(config.post_tls);
        self.user_agent.submit(req, handler.clone()).await;
        handler.into_result()
    }
}

/// Accumulates a response body and final error for one synchronous-feeling
/// POST issued through the otherwise callback-driven [`UserAgent`].
#[derive(Default)]
struct CapturingHandler {
    body: Mutex<Vec<u8>>,
    status: Mutex<Option<u16>>,
    error: Mutex<Option<AxedaError>>,
}

impl CapturingHandler {
    fn into_result(self: Arc<Self>) -> Result<Bytes, AxedaError> {
        if let Some(err) = self.error.try_lock().ok().and_then(|mut e| e.take()) {
            return Err(err);
        }
        let status = self.status.try_lock().ok().and_then(|s| *s).unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(AxedaError::Http(crate::error::HttpError::BadResponse(format!(
                "server returned status {status}"
            ))));
        }
        let body = self.body.try_lock().map(|b| Bytes::from(b.clone())).unwrap_or_default();
        Ok(body)
    }
}

#[async_trait]
impl RequestHandler for CapturingHandler {
    async fn on_entity(&self, _offset: u64, chunk: Bytes) -> bool {
        self.body.lock().await.extend_from_slice(&chunk);
        true
    }

    async fn on_completed(&self, status: u16, _headers: Vec<(String, String)>) {
        *self.status.lock().await = Some(status);
    }

    async fn on_error(&self, error: AxedaError) {
        warn!(error = %error, "server session delivery failed");
        *self.error.lock().await = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::QueueByteBudget;

    fn sample_config() -> ServerSessionConfig {
        ServerSessionConfig {
            device_id: DeviceId::new(0),
            server_config_id: ServerConfigId::new(0),
            device_model_number: "model".into(),
            device_serial_number: "serial".into(),
            device_owner: "owner".into(),
            post_host: "example.invalid".into(),
            post_port: 80,
            post_path: "/eMessage".into(),
            post_tls: false,
            content_type: "application/octet-stream".into(),
            emessage_budget: EMessageByteBudget::try_new(4096).unwrap(),
            ping_interval: PingIntervalMs::default(),
            min_retry_delay: RetryDelayMs::default(),
            max_retry_delay: RetryDelayMs::new(60_000),
        }
    }

    struct NoopCallbacks;

    #[async_trait]
    impl ServerSessionCallbacks for NoopCallbacks {
        async fn on_ping_rate_update(&self, _new_interval: PingIntervalMs) {}
        async fn on_web_error(&self, _error: AxedaError) {}
    }

    #[tokio::test]
    async fn starts_unregistered_and_retries_registration_first_tick() {
        let queue = MessageQueue::new(QueueByteBudget::try_new(4096).unwrap());
        let ua = Arc::new(UserAgent::new(Duration::from_secs(1)));
        let soap = Arc::new(SoapDispatcher::new(Arc::new(NoopSoap), queue.clone()));
        let session = ServerSession::new(sample_config(), queue, ua, soap, Arc::new(NoopCallbacks));
        assert!(session.retry_period_elapsed().await);
    }

    struct NoopSoap;
    #[async_trait]
    impl crate::soap::SoapCommandHandler for NoopSoap {
        async fn set_tag(&self, _n: &str, _v: &str) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn set_time(&self, _t: &str) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn restart(&self, _h: bool) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn file_transfer_start(&self, _a: &std::collections::HashMap<String, String>) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn file_transfer_stop(&self, _a: &std::collections::HashMap<String, String>) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn file_transfer_pause(&self, _a: &std::collections::HashMap<String, String>) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn remote_session_start(&self, _a: &std::collections::HashMap<String, String>) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
        async fn catch_all(&self, _m: &str, _a: &std::collections::HashMap<String, String>) -> crate::soap::CommandResult {
            crate::soap::CommandResult::ok()
        }
    }
}
