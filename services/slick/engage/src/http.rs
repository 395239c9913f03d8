//! JSON GET/POST helpers and the fire-and-forget beacon used at teardown.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failed HTTP exchange. `status` is 0 when no response was received.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("HTTP {status}: {message}")]
pub struct HttpError {
    /// Response status code
    pub status: u16,
    /// Reason phrase or transport failure
    pub message: String,
    /// Parsed response body, if any
    pub response: Option<Value>,
}

impl HttpError {
    fn transport(e: reqwest::Error) -> Self {
        HttpError {
            status: 0,
            message: e.to_string(),
            response: None,
        }
    }
}

/// reqwest-backed JSON client
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// Client with default settings
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Client with a request timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// GET `url` and parse the JSON body
    pub async fn get(&self, url: &str) -> Result<Value, HttpError> {
        debug!("GET {}", url);
        let response = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(HttpError::transport)?;
        read_json(response).await
    }

    /// POST `body` as JSON to `url` and parse the JSON reply
    pub async fn post(&self, url: &str, body: &Value) -> Result<Value, HttpError> {
        debug!("POST {}", url);
        let response = self
            .inner
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(HttpError::transport)?;
        read_json(response).await
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, HttpError> {
    let status = response.status();
    let text = response.text().await.map_err(HttpError::transport)?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    if status.is_success() {
        return Ok(body);
    }
    Err(HttpError {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        response: (!body.is_null()).then_some(body),
    })
}

/// Best-effort fire-and-forget POST
pub trait Beacon: Send + Sync {
    /// Queue `body` for delivery to `url`. Returns false when beacons are
    /// unavailable and the caller should fall back to a regular POST.
    fn send_beacon(&self, url: &str, body: &Value) -> bool;
}

/// Beacon that posts on a spawned task of the current runtime
#[derive(Debug, Clone, Default)]
pub struct HttpBeacon {
    client: HttpClient,
}

impl HttpBeacon {
    /// Beacon over the given client
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl Beacon for HttpBeacon {
    fn send_beacon(&self, url: &str, body: &Value) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let client = self.client.clone();
        let url = url.to_string();
        let body = body.clone();
        handle.spawn(async move {
            if let Err(e) = client.post(&url, &body).await {
                warn!("Beacon to {} failed: {}", url, e);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let body = client
            .get(&format!("{}/config", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_non_success_is_structured_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/close"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "error": "missing reader" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/plain"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let err = client
            .post(&format!("{}/close", server.uri()), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 422);
        assert_eq!(err.message, "Unprocessable Entity");
        assert_eq!(err.response, Some(json!({ "error": "missing reader" })));

        let err = client
            .post(&format!("{}/plain", server.uri()), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 503);
        assert_eq!(err.response, Some(json!("down")));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let client = HttpClient::with_timeout(Duration::from_secs(2));
        let err = client.get("http://127.0.0.1:1/").await.unwrap_err();
        assert_eq!(err.status, 0);
        assert!(err.response.is_none());
    }

    #[tokio::test]
    async fn test_beacon_posts_in_background() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/beacon"))
            .and(body_json(json!({ "engagedMs": 1200 })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let beacon = HttpBeacon::default();
        assert!(beacon.send_beacon(&format!("{}/beacon", server.uri()), &json!({ "engagedMs": 1200 })));

        for _ in 0..100 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.verify().await;
    }

    #[test]
    fn test_beacon_unavailable_without_runtime() {
        let beacon = HttpBeacon::default();
        assert!(!beacon.send_beacon("http://127.0.0.1:1/beacon", &json!({})));
    }
}
