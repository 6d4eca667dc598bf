//! Outbound HTTP dispatch under a process-wide rate ceiling.
//!
//! # Admission
//!
//! Every attempt (retries included) passes three stages, in order:
//! - a FIFO gate (`tokio::sync::Mutex` is fair), so admission order follows
//!   submission order;
//! - a semaphore with `requests_per_second` permits bounding calls in flight;
//! - a GCRA pacer with burst 1 and period `1s / requests_per_second`, which
//!   drip-feeds bursts and caps any rolling second at the ceiling.
//!
//! Completion order is not preserved; only admission is FIFO.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use netdash_core::config::{ApiConfig, ConfigError};
use netdash_core::error::ToolError;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, RETRY_AFTER};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

const QUOTA_HEADERS: [&str; 2] = ["x-ratelimit-remaining", "x-request-quota-remaining"];

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
    pub attempts: u32,
}

#[derive(Debug)]
struct RawResponse {
    status: u16,
    body: Value,
    retry_after: Option<Duration>,
}

impl RawResponse {
    fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// 429 and 5xx are transient; every other failure is terminal.
    fn is_retryable(&self) -> bool {
        self.status == 429 || (500..=599).contains(&self.status)
    }
}

pub struct RateLimitedDispatcher {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_retry_after: Duration,
    admission: Mutex<()>,
    in_flight: Arc<Semaphore>,
    pacer: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for RateLimitedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedDispatcher")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RateLimitedDispatcher {
    pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self, ConfigError> {
        let rate = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            ConfigError::Invalid {
                field: "api.requests_per_second".to_string(),
                message: "must be at least 1".to_string(),
            }
        })?;
        let quota = Quota::with_period(Duration::from_secs(1) / rate.get())
            .ok_or_else(|| ConfigError::Invalid {
                field: "api.requests_per_second".to_string(),
                message: "rate is too high to pace".to_string(),
            })?
            .allow_burst(NonZeroU32::MIN);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("netdash-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "api".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
            admission: Mutex::new(()),
            in_flight: Arc::new(Semaphore::new(rate.get() as usize)),
            pacer: RateLimiter::direct(quota),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one logical call, retrying 429/5xx with backoff. Parameters go to
    /// the query string for GET/DELETE/HEAD and to a JSON body otherwise.
    pub async fn submit(
        &self,
        method: Method,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<UpstreamResponse, ToolError> {
        let span = tracing::info_span!(
            "upstream",
            request_id = %Uuid::now_v7(),
            method = %method,
            path = %path
        );
        self.submit_with_retries(method, path, params)
            .instrument(span)
            .await
    }

    async fn submit_with_retries(
        &self,
        method: Method,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<UpstreamResponse, ToolError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let permit = self.admit().await?;
            tracing::info!(attempt, "dispatching upstream request");
            let response = self.send_once(&method, path, params).await;
            drop(permit);
            let response = response?;

            if response.is_success() {
                return Ok(UpstreamResponse {
                    status: response.status,
                    body: response.body,
                    attempts: attempt,
                });
            }

            if !response.is_retryable() || attempt >= self.max_attempts {
                tracing::warn!(
                    attempt,
                    status = response.status,
                    "upstream request failed"
                );
                return Err(ToolError::UpstreamApi {
                    status: response.status,
                    payload: response.body,
                    attempts: attempt,
                });
            }

            let delay = response
                .retry_after
                .unwrap_or_else(|| self.backoff_delay(attempt));
            tracing::warn!(
                attempt,
                status = response.status,
                delay_ms = delay.as_millis() as u64,
                "upstream request throttled or unavailable, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, ToolError> {
        let _gate = self.admission.lock().await;
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ToolError::Transport {
                message: "dispatcher admission queue is closed".to_string(),
                timed_out: false,
            })?;
        self.pacer.until_ready().await;
        Ok(permit)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<RawResponse, ToolError> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, path)).map_err(|e| {
            ToolError::Transport {
                message: format!("invalid upstream URL: {e}"),
                timed_out: false,
            }
        })?;

        let sends_body = !matches!(*method, Method::GET | Method::DELETE | Method::HEAD);
        if !sends_body {
            let pairs = query_pairs(params);
            if !pairs.is_empty() {
                let mut qp = url.query_pairs_mut();
                for (k, v) in &pairs {
                    qp.append_pair(k, v);
                }
            }
        }

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if sends_body {
            request = request.json(params);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers(), self.max_retry_after);
        log_quota_headers(response.headers());
        let bytes = response.bytes().await.map_err(transport_error)?;

        Ok(RawResponse {
            status,
            body: parse_response_body(&bytes),
            retry_after,
        })
    }
}

fn transport_error(err: reqwest::Error) -> ToolError {
    let timed_out = err.is_timeout();
    let message = if timed_out {
        "upstream request timed out".to_string()
    } else {
        format!("failed to reach upstream API: {}", err.without_url())
    };
    ToolError::Transport { message, timed_out }
}

/// Hints above `ceiling` are clamped to it; unparseable or negative hints
/// fall back to the regular backoff.
fn parse_retry_after(headers: &HeaderMap, ceiling: Duration) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    let clamped = seconds.min(ceiling.as_secs_f64());
    Duration::try_from_secs_f64(clamped)
        .ok()
        .map(|delay| delay.min(ceiling))
}

fn log_quota_headers(headers: &HeaderMap) {
    for name in QUOTA_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            tracing::debug!(header = name, value, "upstream quota");
        }
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Arrays become repeated `key[]` pairs, objects are sent as JSON text and
/// nulls are skipped.
fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(params.len());
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                let array_key = format!("{key}[]");
                for item in items.iter().filter(|item| !item.is_null()) {
                    out.push((array_key.clone(), scalar_to_string(item)));
                }
            }
            other => out.push((key.clone(), scalar_to_string(other))),
        }
    }
    out
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(v) => v.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct Recorder {
        hits: Arc<std::sync::Mutex<Vec<Instant>>>,
        template: ResponseTemplate,
    }

    impl Respond for Recorder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.hits.lock().unwrap().push(Instant::now());
            self.template.clone()
        }
    }

    fn api_config(base_url: &str) -> ApiConfig {
        ApiConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            requests_per_second: 5,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            max_retry_after_secs: 5,
        }
    }

    fn dispatcher(server: &MockServer) -> RateLimitedDispatcher {
        RateLimitedDispatcher::new(&api_config(&server.uri()), Some("test-key".to_string()))
            .unwrap()
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn query_pairs_expand_arrays_and_skip_nulls() {
        let pairs = query_pairs(&params(json!({
            "timespan": 3600,
            "tags": ["a", "b"],
            "verbose": true,
            "skip": null
        })));
        assert_eq!(
            pairs,
            vec![
                ("tags[]".to_string(), "a".to_string()),
                ("tags[]".to_string(), "b".to_string()),
                ("timespan".to_string(), "3600".to_string()),
                ("verbose".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let d = RateLimitedDispatcher::new(&api_config("http://127.0.0.1:9"), None).unwrap();
        assert_eq!(d.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(d.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(d.backoff_delay(3), Duration::from_millis(40));
        assert_eq!(d.backoff_delay(9), Duration::from_millis(40));
    }

    #[test]
    fn retry_after_hints_are_clamped_and_never_panic() {
        let ceiling = Duration::from_secs(5);
        let headers = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, value.parse().unwrap());
            headers
        };
        assert_eq!(
            parse_retry_after(&headers("1.5"), ceiling),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after(&headers("86400"), ceiling), Some(ceiling));
        assert_eq!(parse_retry_after(&headers("1e20"), ceiling), Some(ceiling));
        assert_eq!(parse_retry_after(&headers("inf"), ceiling), Some(ceiling));
        assert_eq!(parse_retry_after(&headers("NaN"), ceiling), None);
        assert_eq!(parse_retry_after(&headers("-3"), ceiling), None);
        assert_eq!(
            parse_retry_after(&headers("Wed, 21 Oct 2026 07:28:00 GMT"), ceiling),
            None
        );
        assert_eq!(parse_retry_after(&HeaderMap::new(), ceiling), None);
    }

    #[test]
    fn debug_output_hides_token() {
        let d = RateLimitedDispatcher::new(
            &api_config("http://127.0.0.1:9"),
            Some("super-secret".to_string()),
        )
        .unwrap();
        let rendered = format!("{d:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("authenticated: true"));
    }

    #[tokio::test]
    async fn get_sends_bearer_token_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/networks/N_1/clients"))
            .and(header("Authorization", "Bearer test-key"))
            .and(query_param("timespan", "3600"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "k1" }])))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher(&server)
            .submit(
                Method::GET,
                "/networks/N_1/clients",
                &params(json!({ "timespan": 3600 })),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.attempts, 1);
        assert_eq!(response.body, json!([{ "id": "k1" }]));
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/devices/Q2XX/reboot"))
            .and(body_json(json!({ "reason": "maintenance" })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher(&server)
            .submit(
                Method::POST,
                "/devices/Q2XX/reboot",
                &params(json!({ "reason": "maintenance" })),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.body["success"], true);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "errors": ["Not found"] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatcher(&server)
            .submit(Method::GET, "/networks/missing", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::UpstreamApi {
                status: 404,
                payload: json!({ "errors": ["Not found"] }),
                attempts: 1,
            }
        );
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher(&server)
            .submit(Method::GET, "/organizations", &Map::new())
            .await
            .unwrap();
        assert_eq!(response.attempts, 2);
        assert_eq!(response.body["ok"], true);
    }

    #[tokio::test]
    async fn rate_limited_responses_honor_retry_after_then_give_up() {
        let server = MockServer::start().await;
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .respond_with(Recorder {
                hits: hits.clone(),
                template: ResponseTemplate::new(429)
                    .insert_header("Retry-After", "2")
                    .set_body_json(json!({ "errors": ["API rate limit exceeded"] })),
            })
            .expect(3)
            .mount(&server)
            .await;

        let err = dispatcher(&server)
            .submit(Method::GET, "/organizations", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::UpstreamApi {
                status: 429,
                attempts: 3,
                ..
            }
        ));

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 3);
        for pair in hits.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn oversized_retry_after_is_capped_instead_of_crashing() {
        let server = MockServer::start().await;
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .respond_with(Recorder {
                hits: hits.clone(),
                template: ResponseTemplate::new(429).insert_header("Retry-After", "1e20"),
            })
            .expect(3)
            .mount(&server)
            .await;

        let mut config = api_config(&server.uri());
        config.max_retry_after_secs = 1;
        let d = RateLimitedDispatcher::new(&config, None).unwrap();
        let err = d
            .submit(Method::GET, "/organizations", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::UpstreamApi {
                status: 429,
                attempts: 3,
                ..
            }
        ));

        let hits = hits.lock().unwrap();
        for pair in hits.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(950), "gap {gap:?}");
            assert!(gap < Duration::from_secs(3), "gap {gap:?}");
        }
    }

    #[tokio::test]
    async fn slow_upstream_yields_transport_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(2500)))
            .mount(&server)
            .await;

        let mut config = api_config(&server.uri());
        config.timeout_secs = 1;
        let d = RateLimitedDispatcher::new(&config, None).unwrap();
        let err = d
            .submit(Method::GET, "/organizations", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Transport { timed_out: true, .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_transport_error() {
        let d = RateLimitedDispatcher::new(&api_config("http://127.0.0.1:9"), None).unwrap();
        let err = d
            .submit(Method::GET, "/organizations", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Transport { timed_out: false, .. }));
        assert_eq!(err.kind(), "transport_error");
    }

    #[tokio::test]
    async fn concurrent_burst_never_exceeds_ceiling_per_rolling_second() {
        let server = MockServer::start().await;
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .respond_with(Recorder {
                hits: hits.clone(),
                template: ResponseTemplate::new(200).set_body_json(json!([])),
            })
            .mount(&server)
            .await;

        let d = Arc::new(dispatcher(&server));
        let calls = (0..50).map(|n| {
            let d = d.clone();
            async move {
                d.submit(Method::GET, &format!("/networks/N_{n}"), &Map::new())
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));

        let mut hits = hits.lock().unwrap().clone();
        hits.sort();
        assert_eq!(hits.len(), 50);
        // Six consecutive arrivals must span at least a second (minus
        // loopback jitter), i.e. no rolling second holds more than five.
        for window in hits.windows(6) {
            assert!(
                window[5] - window[0] >= Duration::from_millis(950),
                "six requests within {:?}",
                window[5] - window[0]
            );
        }
    }
}
