use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::rest::ratelimit::{BucketTracker, RateLimitHeaders};
use crate::rest::route::Route;
use crate::retry::{retry_async, RetryPolicy};

/// Production REST API root, without the version segment.
pub const API_BASE_URL: &str = "https://discord.com/api";
pub const DEFAULT_API_VERSION: u8 = 10;
const USER_AGENT: &str = concat!("DiscordBot (wyvern, ", env!("CARGO_PKG_VERSION"), ")");

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub api_version: u8,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Backoff for 5xx responses and transport failures.
    pub retry_policy: RetryPolicy,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION,
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::rest(),
        }
    }
}

/// Authenticated, rate-limited REST dispatcher.
///
/// Clones share the HTTP connection pool, the bucket tracker and the closed
/// flag.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    token: SecretString,
    base_url: String,
    api_version: u8,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    buckets: Arc<BucketTracker>,
    closed: Arc<AtomicBool>,
}

impl RestClient {
    /// Builds a client with default options and the shared bucket tracker.
    pub fn new(token: SecretString) -> Result<Self, RestError> {
        Self::with_options(token, RestClientOptions::default())
    }

    /// Builds a client with explicit timeouts, API version and retry policy.
    pub fn with_options(token: SecretString, options: RestClientOptions) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            token,
            base_url: API_BASE_URL.to_string(),
            api_version: options.api_version,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            buckets: BucketTracker::shared(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Sets an explicit API root such as `http://127.0.0.1:8080/api`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Replaces the process-wide bucket tracker with `buckets`.
    pub fn with_bucket_tracker(mut self, buckets: Arc<BucketTracker>) -> Self {
        self.buckets = buckets;
        self
    }

    /// The bucket tracker this client reserves slots from.
    pub fn bucket_tracker(&self) -> &Arc<BucketTracker> {
        &self.buckets
    }

    /// Rejects every request issued after this call. In-flight requests run
    /// to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`RestClient::close`] was called on this client or a clone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends `route` with an optional JSON payload.
    ///
    /// Returns `Ok(None)` for empty bodies (204, 304). A single 429 is honored
    /// and retried transparently; 5xx responses and transport failures are
    /// retried according to the configured [`RetryPolicy`].
    pub async fn request<T>(&self, route: &Route, payload: Option<&T>) -> Result<Option<Value>, RestError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(RestError::Closed);
        }
        let payload = payload.map(serde_json::to_value).transpose().map_err(RestError::Json)?;

        retry_async(
            &self.retry_policy,
            |attempt| {
                let payload = payload.as_ref();
                async move {
                    debug!(event = "rest_request", route = %route, attempt);
                    self.send_honoring_rate_limit(route, payload).await
                }
            },
            RestError::is_retryable,
        )
        .await
    }

    /// Fetches a user by id.
    pub async fn fetch_user(&self, user_id: u64) -> Result<Value, RestError> {
        let route = Route::get_user(user_id);
        self.request::<Value>(&route, None).await.map(Option::unwrap_or_default)
    }

    /// Fetches the bot's own user.
    pub async fn fetch_current_user(&self) -> Result<Value, RestError> {
        let route = Route::current_user();
        self.request::<Value>(&route, None).await.map(Option::unwrap_or_default)
    }

    /// Edits the bot user. `avatar` is an image data URI.
    pub async fn edit_current_user(
        &self,
        username: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<Value, RestError> {
        let mut payload = serde_json::Map::new();
        if let Some(username) = username {
            payload.insert("username".to_string(), json!(username));
        }
        if let Some(avatar) = avatar {
            payload.insert("avatar".to_string(), json!(avatar));
        }
        let route = Route::edit_current_user();
        self.request(&route, Some(&payload)).await.map(Option::unwrap_or_default)
    }

    /// Posts a message with an arbitrary JSON payload to `channel_id`.
    pub async fn create_message<T>(&self, channel_id: u64, payload: &T) -> Result<Value, RestError>
    where
        T: Serialize + ?Sized,
    {
        let route = Route::create_message(channel_id);
        self.request(&route, Some(payload)).await.map(Option::unwrap_or_default)
    }

    /// Sends a plain text message to `channel_id`.
    pub async fn send_message(&self, channel_id: u64, content: &str) -> Result<Value, RestError> {
        self.create_message(channel_id, &json!({ "content": content })).await
    }

    /// Registers a global application command.
    pub async fn create_application_command<T>(
        &self,
        application_id: u64,
        payload: &T,
    ) -> Result<Value, RestError>
    where
        T: Serialize + ?Sized,
    {
        let route = Route::create_application_command(application_id);
        self.request(&route, Some(payload)).await.map(Option::unwrap_or_default)
    }

    /// Answers an interaction. The endpoint replies with no body.
    pub async fn create_interaction_response<T>(
        &self,
        interaction_id: u64,
        interaction_token: &str,
        payload: &T,
    ) -> Result<(), RestError>
    where
        T: Serialize + ?Sized,
    {
        let route = Route::interaction_callback(interaction_id, interaction_token);
        self.request(&route, Some(payload)).await.map(|_| ())
    }

    fn endpoint(&self, route: &Route) -> String {
        format!("{}/v{}/{}", self.base_url, self.api_version, route.path())
    }

    async fn send_honoring_rate_limit(
        &self,
        route: &Route,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, RestError> {
        match self.send_attempt(route, payload).await {
            Err(RestError::RateLimited {
                retry_after,
                global,
                ..
            }) => {
                warn!(
                    event = "rest_rate_limited",
                    route = %route,
                    bucket = route.bucket_key(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    global,
                );
                tokio::time::sleep(retry_after).await;
                self.send_attempt(route, payload).await
            }
            other => other,
        }
    }

    async fn send_attempt(
        &self,
        route: &Route,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, RestError> {
        self.buckets.acquire(route.bucket_key()).await;

        let mut authorization = HeaderValue::from_str(&format!("Bot {}", self.token.expose_secret()))
            .map_err(|_| RestError::InvalidToken)?;
        authorization.set_sensitive(true);

        let mut builder = self
            .http
            .request(route.method().into(), self.endpoint(route))
            .timeout(self.attempt_timeout)
            .header(AUTHORIZATION, authorization);
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(RestError::Transport)?;
        let status = response.status();
        let limits = RateLimitHeaders::from_headers(response.headers());
        let body = response.text().await.map_err(RestError::Transport)?;

        self.buckets.update(route.bucket_key(), &limits, Instant::now());
        debug!(
            event = "rest_response",
            route = %route,
            status = status.as_u16(),
            remaining = limits.remaining,
        );

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return parse_body(status, &body);
        }

        let error = classify_status(status, &limits, body);
        if let RestError::RateLimited {
            retry_after, global, ..
        } = &error
        {
            self.buckets
                .record_rate_limited(route.bucket_key(), *retry_after, *global, Instant::now());
        }
        Err(error)
    }
}

/// REST failures, classified by what the caller can do about them.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },

    #[error("not found: {body}")]
    NotFound { body: String },

    #[error("rate limited for {retry_after:?} (global: {global}): {body}")]
    RateLimited {
        retry_after: Duration,
        global: bool,
        body: String,
    },

    #[error("server error {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    #[error("transport failure: {0}")]
    Transport(reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Unknown { status: StatusCode, body: String },

    #[error("json error: {0}")]
    Json(serde_json::Error),

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error("rest client is closed")]
    Closed,
}

impl RestError {
    /// Whether the dispatcher backs off and tries again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServerError { .. } => true,
            Self::Transport(err) => !err.is_builder() && !err.is_decode(),
            _ => false,
        }
    }

    /// Upstream HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            Self::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Self::ServerError { status, .. } | Self::Unknown { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::Json(_) | Self::InvalidToken | Self::Closed => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: Option<bool>,
}

fn classify_status(status: StatusCode, limits: &RateLimitHeaders, body: String) -> RestError {
    match status {
        StatusCode::UNAUTHORIZED => RestError::Unauthorized { body },
        StatusCode::NOT_FOUND => RestError::NotFound { body },
        StatusCode::TOO_MANY_REQUESTS => {
            let parsed = serde_json::from_str::<RateLimitedBody>(&body).ok();
            let retry_after = parsed
                .as_ref()
                .and_then(|parsed| parsed.retry_after)
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
                .or(limits.retry_after)
                .or(limits.reset_after)
                .unwrap_or(Duration::from_secs(1));
            let global = parsed.and_then(|parsed| parsed.global).unwrap_or(false) || limits.global;
            RestError::RateLimited {
                retry_after,
                global,
                body,
            }
        }
        status if status.is_server_error() => RestError::ServerError { status, body },
        status => RestError::Unknown { status, body },
    }
}

fn parse_body(status: StatusCode, body: &str) -> Result<Option<Value>, RestError> {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED || body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body).map(Some).map_err(RestError::Json)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{classify_status, parse_body, RestClient, RestError, API_BASE_URL};
    use crate::rest::ratelimit::RateLimitHeaders;
    use crate::rest::route::Route;

    fn client() -> RestClient {
        RestClient::new(SecretString::new("token".to_string())).expect("build client")
    }

    #[test]
    fn endpoint_is_versioned() {
        let client = client();
        assert_eq!(
            client.endpoint(&Route::create_message(123)),
            format!("{API_BASE_URL}/v10/channels/123/messages")
        );
    }

    #[test]
    fn base_url_override_strips_trailing_slash() {
        let client = client().with_base_url("http://127.0.0.1:9000/api/  ");
        assert_eq!(
            client.endpoint(&Route::current_user()),
            "http://127.0.0.1:9000/api/v10/users/@me"
        );
    }

    #[test]
    fn empty_statuses_return_no_body() {
        assert!(parse_body(StatusCode::NO_CONTENT, "").expect("204").is_none());
        assert!(parse_body(StatusCode::NOT_MODIFIED, "").expect("304").is_none());
        assert_eq!(
            parse_body(StatusCode::OK, r#"{"id":"1"}"#).expect("200"),
            Some(json!({"id": "1"}))
        );
    }

    #[test]
    fn statuses_map_to_error_taxonomy() {
        let limits = RateLimitHeaders::default();
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &limits, "no".into()),
            RestError::Unauthorized { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &limits, "gone".into()),
            RestError::NotFound { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &limits, "".into()),
            RestError::ServerError { status, .. } if status == StatusCode::BAD_GATEWAY
        ));
        match classify_status(StatusCode::FORBIDDEN, &limits, "missing access".into()) {
            RestError::Unknown { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "missing access");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_body_wins_over_headers() {
        let limits = RateLimitHeaders {
            retry_after: Some(Duration::from_secs(9)),
            ..RateLimitHeaders::default()
        };
        let error = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &limits,
            r#"{"message":"You are being rate limited.","retry_after":2.5,"global":true}"#.into(),
        );
        match error {
            RestError::RateLimited {
                retry_after,
                global,
                ..
            } => {
                assert_eq!(retry_after, Duration::from_millis(2500));
                assert!(global);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn only_server_errors_are_retryable_statuses() {
        let limits = RateLimitHeaders::default();
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, &limits, "".into()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, &limits, "".into()).is_retryable());
        assert!(!classify_status(StatusCode::TOO_MANY_REQUESTS, &limits, "".into()).is_retryable());
    }

    #[tokio::test]
    async fn closed_client_rejects_new_requests() {
        let client = client();
        let clone = client.clone();
        client.close();
        let result = clone.fetch_current_user().await;
        assert!(matches!(result, Err(RestError::Closed)));
    }
}
