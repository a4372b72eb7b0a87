//! reqwest implementation of the platform transport.
//!
//! Routes:
//! - acknowledgment: `POST interactions/{action_id}/{token}/callback`
//! - finalize: `PATCH webhooks/{application_id}/{token}/messages/@original`
//! - append: `POST webhooks/{application_id}/{token}`

use std::time::Duration;

use async_trait::async_trait;
use courier_api_types::MessagePayload;
use reqwest::{Client, Method, StatusCode, Url, header::HeaderMap};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::application::transport::{Transport, TransportReply};
use crate::config::PlatformSettings;
use crate::domain::error::DeliveryError;
use crate::domain::types::{BucketMetadata, Credential};

use super::error::InfraError;

const SOURCE: &str = "infra::transport";

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_BUCKET: &str = "x-ratelimit-bucket";
const HEADER_GLOBAL: &str = "x-ratelimit-global";
const HEADER_RETRY_AFTER: &str = "retry-after";

const CALLBACK_MESSAGE: u8 = 4;
const CALLBACK_DEFERRED: u8 = 5;

/// Longest error body carried into a delivery error.
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    application_id: String,
}

impl HttpTransport {
    pub fn new(settings: &PlatformSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::transport(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
            application_id: settings.application_id.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("courier/", env!("CARGO_PKG_VERSION"))
    }

    fn callback_url(&self, credential: &Credential) -> Result<Url, DeliveryError> {
        self.url(&format!(
            "interactions/{}/{}/callback",
            credential.action_id, credential.secret
        ))
    }

    fn follow_up_url(&self, credential: &Credential, edit: bool) -> Result<Url, DeliveryError> {
        let path = if edit {
            format!(
                "webhooks/{}/{}/messages/@original",
                self.application_id, credential.secret
            )
        } else {
            format!("webhooks/{}/{}", self.application_id, credential.secret)
        };
        self.url(&path)
    }

    fn url(&self, path: &str) -> Result<Url, DeliveryError> {
        self.base
            .join(path)
            .map_err(|err| DeliveryError::permanent(None, format!("invalid platform url: {err}")))
    }

    async fn send(&self, method: Method, url: Url, body: Value, action: &str) -> TransportReply {
        let response = match self.client.request(method, url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    action,
                    error = %err,
                    "Platform request failed"
                );
                return TransportReply::failed(BucketMetadata::default(), request_error(&err));
            }
        };

        let status = response.status();
        let metadata = parse_metadata(response.headers());
        if status.is_success() {
            debug!(
                target = SOURCE,
                action,
                status = status.as_u16(),
                remaining = ?metadata.remaining,
                "Platform request succeeded"
            );
            return TransportReply::delivered(metadata);
        }

        let body = response.text().await.unwrap_or_default();
        let reply = rejected(status, metadata, &body);
        if let Err(error) = &reply.result {
            debug!(
                target = SOURCE,
                action,
                status = status.as_u16(),
                error = %error,
                "Platform request rejected"
            );
        }
        reply
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn ack_immediate(
        &self,
        credential: &Credential,
        payload: &MessagePayload,
    ) -> TransportReply {
        let url = match self.callback_url(credential) {
            Ok(url) => url,
            Err(error) => return TransportReply::failed(BucketMetadata::default(), error),
        };
        let body = json!({ "type": CALLBACK_MESSAGE, "data": payload });
        self.send(Method::POST, url, body, "ack_immediate").await
    }

    async fn ack_deferred(&self, credential: &Credential) -> TransportReply {
        let url = match self.callback_url(credential) {
            Ok(url) => url,
            Err(error) => return TransportReply::failed(BucketMetadata::default(), error),
        };
        let body = json!({ "type": CALLBACK_DEFERRED });
        self.send(Method::POST, url, body, "ack_deferred").await
    }

    async fn deliver_follow_up(
        &self,
        credential: &Credential,
        payload: &MessagePayload,
        edit: bool,
    ) -> TransportReply {
        let url = match self.follow_up_url(credential, edit) {
            Ok(url) => url,
            Err(error) => return TransportReply::failed(BucketMetadata::default(), error),
        };
        let (method, action) = if edit {
            (Method::PATCH, "finalize")
        } else {
            (Method::POST, "append")
        };
        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(err) => {
                return TransportReply::failed(
                    BucketMetadata::default(),
                    DeliveryError::permanent(None, format!("payload not serializable: {err}")),
                );
            }
        };
        self.send(method, url, body, action).await
    }
}

/// Read the platform's rate-limit headers. Unparseable values are ignored.
pub fn parse_metadata(headers: &HeaderMap) -> BucketMetadata {
    let text = |name: &'static str| header_text(headers, name);

    BucketMetadata {
        limit: text(HEADER_LIMIT).and_then(|value| value.parse().ok()),
        remaining: text(HEADER_REMAINING).and_then(|value| value.parse().ok()),
        reset_after: text(HEADER_RESET_AFTER).and_then(parse_seconds),
        bucket_id: text(HEADER_BUCKET)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        retry_after: text(HEADER_RETRY_AFTER).and_then(parse_seconds),
        global: text(HEADER_GLOBAL).is_some_and(|value| value.eq_ignore_ascii_case("true")),
    }
}

/// Reply for a non-success response. Rate-limit details that only arrived in
/// the body are copied into the metadata so the bucket tracker sees them.
pub fn rejected(status: StatusCode, mut metadata: BucketMetadata, body: &str) -> TransportReply {
    let error = classify(status, &metadata, body);
    if let DeliveryError::RateLimited {
        retry_after,
        global,
    } = &error
    {
        metadata.retry_after = *retry_after;
        metadata.global = *global;
    }
    TransportReply::failed(metadata, error)
}

/// Map a non-success status to the delivery error taxonomy.
pub fn classify(status: StatusCode, metadata: &BucketMetadata, body: &str) -> DeliveryError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let body_retry = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| value.get("retry_after").and_then(Value::as_f64))
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());
        let body_global = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| value.get("global").and_then(Value::as_bool))
            .unwrap_or(false);
        return DeliveryError::RateLimited {
            retry_after: metadata.retry_after.or(body_retry),
            global: metadata.global || body_global,
        };
    }

    let message = truncate(body);
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return DeliveryError::transient(format!("status {status}: {message}"));
    }
    DeliveryError::permanent(Some(status.as_u16()), message)
}

fn request_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        DeliveryError::transient(err.to_string())
    } else {
        DeliveryError::permanent(err.status().map(|status| status.as_u16()), err.to_string())
    }
}

fn header_text<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((index, _)) => format!("{}…", &body[..index]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        extract::{Path, State},
        http::{HeaderMap as AxumHeaders, HeaderValue},
        routing::{patch, post},
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::domain::types::ActionId;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn rate_limit_headers_are_parsed() {
        let metadata = parse_metadata(&headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset-after", "1.25"),
            ("x-ratelimit-bucket", "abc123"),
        ]));

        assert_eq!(metadata.limit, Some(5));
        assert_eq!(metadata.remaining, Some(0));
        assert_eq!(metadata.reset_after, Some(Duration::from_millis(1_250)));
        assert_eq!(metadata.bucket_id.as_deref(), Some("abc123"));
        assert!(!metadata.global);
    }

    #[test]
    fn garbage_headers_are_ignored() {
        let metadata = parse_metadata(&headers(&[
            ("x-ratelimit-remaining", "lots"),
            ("x-ratelimit-reset-after", "-3"),
        ]));
        assert!(metadata.is_empty());
    }

    #[test]
    fn statuses_map_to_the_taxonomy() {
        let global = parse_metadata(&headers(&[
            ("x-ratelimit-global", "true"),
            ("retry-after", "2"),
        ]));
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &global, ""),
            DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
                global: true,
            }
        );

        let from_body = classify(
            StatusCode::TOO_MANY_REQUESTS,
            &BucketMetadata::default(),
            r#"{"retry_after": 0.5, "global": false}"#,
        );
        assert_eq!(from_body.retry_after(), Some(Duration::from_millis(500)));

        assert!(classify(StatusCode::BAD_GATEWAY, &BucketMetadata::default(), "").is_retryable());
        assert!(
            classify(
                StatusCode::SERVICE_UNAVAILABLE,
                &BucketMetadata::default(),
                ""
            )
            .is_retryable()
        );
        assert_eq!(
            classify(StatusCode::NOT_FOUND, &BucketMetadata::default(), "gone"),
            DeliveryError::permanent(Some(404), "gone")
        );
    }

    #[test]
    fn body_only_global_limit_reaches_the_metadata() {
        let reply = rejected(
            StatusCode::TOO_MANY_REQUESTS,
            parse_metadata(&HeaderMap::new()),
            r#"{"retry_after": 5.0, "global": true}"#,
        );

        assert!(reply.metadata.global);
        assert_eq!(reply.metadata.retry_after, Some(Duration::from_secs(5)));
        assert_eq!(
            reply.result,
            Err(DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
                global: true,
            })
        );

        let plain = rejected(StatusCode::BAD_GATEWAY, BucketMetadata::default(), "");
        assert!(plain.metadata.is_empty());
    }

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn callback(
        State(seen): State<Seen>,
        Path((action_id, token)): Path<(String, String)>,
        axum::Json(body): axum::Json<Value>,
    ) -> (AxumHeaders, &'static str) {
        seen.lock()
            .expect("seen lock")
            .push((format!("callback {action_id} {token}"), body));
        let mut headers = AxumHeaders::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        (headers, "")
    }

    async fn original(
        State(seen): State<Seen>,
        Path((_app, token)): Path<(String, String)>,
        axum::Json(body): axum::Json<Value>,
    ) -> (StatusCode, &'static str) {
        seen.lock()
            .expect("seen lock")
            .push((format!("edit {token}"), body));
        (StatusCode::NOT_FOUND, "unknown message")
    }

    async fn serve(seen: Seen) -> SocketAddr {
        let app = Router::new()
            .route("/api/interactions/{action_id}/{token}/callback", post(callback))
            .route("/api/webhooks/{app}/{token}/messages/@original", patch(original))
            .with_state(seen);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    #[tokio::test]
    async fn talks_to_the_platform_routes() {
        let seen: Seen = Arc::default();
        let addr = serve(seen.clone()).await;
        let transport = HttpTransport::new(&PlatformSettings {
            base_url: Url::parse(&format!("http://{addr}/api/")).expect("url"),
            application_id: "app".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client");
        let credential = Credential::new(ActionId::from("a1"), "tok");

        let ack = transport.ack_deferred(&credential).await;
        assert_eq!(ack.result, Ok(()));
        assert_eq!(ack.metadata.remaining, Some(4));

        let edit = transport
            .deliver_follow_up(&credential, &MessagePayload::text("done"), true)
            .await;
        assert_eq!(
            edit.result,
            Err(DeliveryError::permanent(Some(404), "unknown message"))
        );

        let seen = seen.lock().expect("seen lock").clone();
        assert_eq!(seen[0].0, "callback a1 tok");
        assert_eq!(seen[0].1, json!({ "type": 5 }));
        assert_eq!(seen[1].0, "edit tok");
        assert_eq!(seen[1].1, json!({ "content": "done" }));
    }
}
