//! Message source clients: an HTTP bridge client and a scripted in-memory
//! source.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psac_core::{FetchStrategy, FetchedMessage};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::{MessageSource, SourceError};

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_capacity: u32,
    pub rate_refill_every: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            rate_capacity: 5,
            rate_refill_every: Duration::from_millis(500),
        }
    }
}

/// Token bucket shared by every request a client makes.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    session: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(default)]
    text: Option<String>,
    date: DateTime<Utc>,
}

/// Client for a message-bridge HTTP API exposing channel history.
#[derive(Debug)]
pub struct HttpMessageSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    session: Mutex<Option<String>>,
    limiter: Arc<RateLimiter>,
}

fn classify_status(status: StatusCode, url: &str) -> SourceError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SourceError::Auth(format!("{status} from {url}"))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SourceError::Transient(format!("{status} from {url}"))
    } else {
        SourceError::Rejected {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::Decode(err.to_string())
    } else {
        SourceError::Transient(err.to_string())
    }
}

fn strategy_query(strategy: FetchStrategy) -> [(&'static str, String); 2] {
    match strategy {
        FetchStrategy::LastMessages(n) => [("mode", "last".to_string()), ("value", n.to_string())],
        FetchStrategy::SinceMessage(id) => [("mode", "since_id".to_string()), ("value", id.to_string())],
        FetchStrategy::SinceHours(h) => [("mode", "since_hours".to_string()), ("value", h.to_string())],
    }
}

impl HttpMessageSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| SourceError::Transient(format!("building http client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            session: Mutex::new(None),
            limiter: Arc::new(RateLimiter::new(config.rate_capacity, config.rate_refill_every)),
        })
    }
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn authenticate(&self) -> Result<(), SourceError> {
        self.limiter.take().await;
        let url = format!("{}/auth", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&AuthRequest {
                token: self.token.as_deref(),
            })
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(match classify_status(status, &url) {
                SourceError::Rejected { status, url } => SourceError::Auth(format!("{status} from {url}")),
                other => other,
            });
        }
        let body: AuthResponse = resp.json().await.map_err(classify_reqwest_error)?;
        *self.session.lock().await = Some(body.session);
        debug!(url, "message source session established");
        Ok(())
    }

    async fn fetch_messages(
        &self,
        channel_handle: &str,
        strategy: FetchStrategy,
    ) -> Result<Vec<FetchedMessage>, SourceError> {
        let session = self.session.lock().await.clone().ok_or(SourceError::NotAuthenticated)?;
        let url = format!("{}/channels/{}/messages", self.base_url, channel_handle);
        let span = info_span!("source_fetch", channel = channel_handle, ?strategy);

        async {
            self.limiter.take().await;
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&session)
                .query(&strategy_query(strategy))
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(status, &url));
            }
            let body: MessagesResponse = resp.json().await.map_err(classify_reqwest_error)?;
            let mut messages = body
                .messages
                .into_iter()
                .map(|m| FetchedMessage {
                    external_id: m.id,
                    text: m.text.unwrap_or_default(),
                    received_at: m.date,
                })
                .collect::<Vec<_>>();
            messages.sort_by_key(|m| m.external_id);
            debug!(count = messages.len(), "fetched messages");
            Ok(messages)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    messages: HashMap<String, Vec<FetchedMessage>>,
    failures: HashMap<String, VecDeque<SourceError>>,
    attempts: HashMap<String, u32>,
    strategies: Vec<(String, FetchStrategy)>,
    auth_failure: Option<SourceError>,
    authenticated: bool,
}

/// Scripted source for tests and offline runs. Applies fetch strategies to
/// the configured messages and can be told to fail the next N calls.
#[derive(Debug, Default)]
pub struct MemoryMessageSource {
    state: Mutex<ScriptState>,
}

impl MemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_messages(&self, channel_handle: &str, messages: Vec<FetchedMessage>) {
        self.state
            .lock()
            .await
            .messages
            .insert(channel_handle.to_string(), messages);
    }

    pub async fn fail_next(&self, channel_handle: &str, times: usize, error: SourceError) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(channel_handle.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub async fn fail_auth(&self, error: SourceError) {
        self.state.lock().await.auth_failure = Some(error);
    }

    /// Fetch calls made for a channel, failed ones included.
    pub async fn attempts(&self, channel_handle: &str) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(channel_handle)
            .copied()
            .unwrap_or(0)
    }

    /// Strategies requested so far, in call order.
    pub async fn strategies(&self) -> Vec<(String, FetchStrategy)> {
        self.state.lock().await.strategies.clone()
    }
}

#[async_trait]
impl MessageSource for MemoryMessageSource {
    async fn authenticate(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.auth_failure.clone() {
            return Err(err);
        }
        state.authenticated = true;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        channel_handle: &str,
        strategy: FetchStrategy,
    ) -> Result<Vec<FetchedMessage>, SourceError> {
        let mut state = self.state.lock().await;
        if !state.authenticated {
            return Err(SourceError::NotAuthenticated);
        }
        *state.attempts.entry(channel_handle.to_string()).or_default() += 1;
        state.strategies.push((channel_handle.to_string(), strategy));
        if let Some(err) = state.failures.get_mut(channel_handle).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let mut messages = state.messages.get(channel_handle).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.external_id);
        let selected = match strategy {
            FetchStrategy::LastMessages(n) => {
                let skip = messages.len().saturating_sub(n as usize);
                messages.split_off(skip)
            }
            FetchStrategy::SinceMessage(id) => messages.into_iter().filter(|m| m.external_id > id).collect(),
            FetchStrategy::SinceHours(hours) => {
                let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
                messages.into_iter().filter(|m| m.received_at >= cutoff).collect()
            }
        };
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, hours_ago: i64) -> FetchedMessage {
        FetchedMessage {
            external_id: id,
            text: format!("message {id}"),
            received_at: Utc::now() - chrono::Duration::hours(hours_ago),
        }
    }

    #[test]
    fn statuses_map_onto_source_errors() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "u"),
            SourceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "u"),
            SourceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "u"),
            SourceError::Transient(_)
        ));
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "u"),
            SourceError::Rejected {
                status: 404,
                url: "u".into()
            }
        );
    }

    #[tokio::test]
    async fn scripted_source_applies_strategies() {
        let source = MemoryMessageSource::new();
        source.authenticate().await.unwrap();
        source
            .set_messages("chan", vec![msg(3, 1), msg(1, 48), msg(2, 30)])
            .await;

        let last = source.fetch_messages("chan", FetchStrategy::LastMessages(2)).await.unwrap();
        assert_eq!(last.iter().map(|m| m.external_id).collect::<Vec<_>>(), vec![2, 3]);

        let since = source.fetch_messages("chan", FetchStrategy::SinceMessage(1)).await.unwrap();
        assert_eq!(since.len(), 2);

        let window = source.fetch_messages("chan", FetchStrategy::SinceHours(24)).await.unwrap();
        assert_eq!(window.iter().map(|m| m.external_id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(source.attempts("chan").await, 3);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let source = MemoryMessageSource::new();
        source.authenticate().await.unwrap();
        source.set_messages("chan", vec![msg(1, 0)]).await;
        source
            .fail_next("chan", 1, SourceError::Transient("flaky".into()))
            .await;

        assert!(source.fetch_messages("chan", FetchStrategy::LastMessages(10)).await.is_err());
        assert_eq!(
            source.fetch_messages("chan", FetchStrategy::LastMessages(10)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn fetching_before_authentication_fails() {
        let source = MemoryMessageSource::new();
        assert_eq!(
            source.fetch_messages("chan", FetchStrategy::LastMessages(1)).await,
            Err(SourceError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn rate_limiter_hands_out_capacity_without_waiting() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.take().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
