//! REST connector over reqwest.
//!
//! Timeouts are enforced per request via reqwest, which aborts the in-flight
//! call and releases the connection — a timed-out request is cancelled, not
//! abandoned.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ConnectionResult, Connector, DataSourceRecord, DataSourceType, FetchError, FetchOptions};
use crate::auth::AuthConfig;

/// Connector for HTTP/JSON APIs.
#[derive(Debug)]
pub struct RestConnector {
    id: String,
    base_url: String,
    auth: AuthConfig,
    health_check_endpoint: Option<String>,
    client: reqwest::Client,
    test_timeout: Duration,
    fetch_timeout: Duration,
}

impl RestConnector {
    /// Builds a connector from a record whose auth fields are already in the
    /// form the target expects (the manager decrypts before calling this).
    pub fn new(
        record: &DataSourceRecord,
        test_timeout: Duration,
        fetch_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = record
            .base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("REST data source '{}' has no base URL", record.id))?;

        Ok(Self {
            id: record.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: record.auth.clone(),
            health_check_endpoint: record.health_check_endpoint.clone(),
            client: reqwest::Client::new(),
            test_timeout,
            fetch_timeout,
        })
    }

    /// Joins the normalized base URL, an endpoint path, and URL-encoded
    /// query parameters.
    fn build_url(&self, endpoint: &str, params: &[(String, String)]) -> String {
        let mut url = if endpoint.is_empty() {
            self.base_url.clone()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        };

        if !params.is_empty() {
            let query: Vec<String> = params
                .iter()
                .map(|(k, v)| {
                    format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                })
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }

        url
    }

    fn classify(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::TimedOut
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Connector for RestConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::Rest
    }

    async fn test_connection(&self) -> ConnectionResult {
        let endpoint = self.health_check_endpoint.as_deref().unwrap_or("");
        let url = self.build_url(endpoint, &[]);

        let mut request = self
            .client
            .get(&url)
            .timeout(self.test_timeout)
            .header("Accept", "application/json");
        for (name, value) in self.auth.auth_headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let outcome = request.send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) if response.status().is_success() => ConnectionResult {
                is_connected: true,
                latency_ms,
                last_error: None,
                last_checked: Utc::now(),
            },
            Ok(response) => ConnectionResult {
                is_connected: false,
                latency_ms,
                last_error: Some(format!(
                    "HTTP {}: {}",
                    response.status().as_u16(),
                    response.status().canonical_reason().unwrap_or("unknown")
                )),
                last_checked: Utc::now(),
            },
            Err(e) => ConnectionResult {
                is_connected: false,
                latency_ms,
                last_error: Some(Self::classify(e).to_string()),
                last_checked: Utc::now(),
            },
        }
    }

    async fn fetch(&self, endpoint: &str, options: FetchOptions) -> Result<Value, FetchError> {
        let url = self.build_url(endpoint, &options.params);
        let method = options.method.unwrap_or(Method::GET);
        let timeout = options.timeout.unwrap_or(self.fetch_timeout);

        debug!(source_id = %self.id, method = %method, url = %url, "Connector fetch");

        let mut request = self.client.request(method, &url).timeout(timeout);
        for (name, value) in self.auth.auth_headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        let explicit_content_type = options
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &options.body {
            if explicit_content_type {
                // Caller controls the representation; send the body verbatim
                let raw = match body {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.body(raw);
            } else {
                request = request.json(body);
            }
        }

        let response = request.send().await.map_err(Self::classify)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Read the body before deciding success so error messages can carry
        // server-provided detail
        let text = response.text().await.map_err(Self::classify)?;

        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                detail: if text.is_empty() { None } else { Some(text) },
            });
        }

        if content_type.contains("json") {
            serde_json::from_str(&text)
                .map_err(|e| FetchError::Network(format!("Invalid JSON response: {}", e)))
        } else {
            Ok(json!({ "text": text, "_raw": true }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::HealthStatus;

    fn rest_record(id: &str, base_url: &str, auth: AuthConfig) -> DataSourceRecord {
        DataSourceRecord {
            id: id.to_string(),
            name: id.to_string(),
            source_type: DataSourceType::Rest,
            base_url: Some(base_url.to_string()),
            host: None,
            port: None,
            auth,
            health_check_endpoint: None,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
        }
    }

    fn connector(base_url: &str, auth: AuthConfig) -> RestConnector {
        RestConnector::new(
            &rest_record("ds-1", base_url, auth),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_missing_base_url_rejected() {
        let mut record = rest_record("ds-1", "", AuthConfig::None);
        record.base_url = None;
        assert!(RestConnector::new(&record, Duration::from_secs(10), Duration::from_secs(30)).is_err());
    }

    #[test]
    fn test_build_url_normalization() {
        let c = connector("https://api.example.com/", AuthConfig::None);

        assert_eq!(c.build_url("", &[]), "https://api.example.com");
        assert_eq!(c.build_url("/users", &[]), "https://api.example.com/users");
        assert_eq!(c.build_url("users", &[]), "https://api.example.com/users");
    }

    #[test]
    fn test_build_url_encodes_params() {
        let c = connector("https://api.example.com", AuthConfig::None);
        let url = c.build_url(
            "/search",
            &[
                ("q".to_string(), "a b&c".to_string()),
                ("page".to_string(), "2".to_string()),
            ],
        );
        assert_eq!(url, "https://api.example.com/search?q=a%20b%26c&page=2");
    }

    #[tokio::test]
    async fn test_connection_success_with_auth_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header("X-API-Key", "sk-123")
            .match_header("Accept", "application/json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let mut record = rest_record(
            "ds-1",
            &server.url(),
            AuthConfig::ApiKey {
                api_key: "sk-123".to_string(),
                api_key_header: None,
                api_key_prefix: None,
            },
        );
        record.health_check_endpoint = Some("/health".to_string());
        let c = RestConnector::new(&record, Duration::from_secs(10), Duration::from_secs(30)).unwrap();

        let result = c.test_connection().await;
        mock.assert_async().await;
        assert!(result.is_connected);
        assert!(result.last_error.is_none());
    }

    #[tokio::test]
    async fn test_connection_non_2xx_is_unhealthy_not_err() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(503)
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let result = c.test_connection().await;

        assert!(!result.is_connected);
        assert_eq!(result.last_error.as_deref(), Some("HTTP 503: Service Unavailable"));
    }

    #[tokio::test]
    async fn test_connection_unreachable_host() {
        // Port 1 on localhost: connection refused
        let c = connector("http://127.0.0.1:1", AuthConfig::None);
        let result = c.test_connection().await;

        assert!(!result.is_connected);
        assert!(result.last_error.is_some());
    }

    #[tokio::test]
    async fn test_fetch_parses_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1}, {"id": 2}]"#)
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let value = c.fetch("/users", FetchOptions::default()).await.unwrap();

        assert_eq!(value, json!([{"id": 1}, {"id": 2}]));
    }

    #[tokio::test]
    async fn test_fetch_wraps_non_json_as_raw_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("OK")
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let value = c.fetch("/status", FetchOptions::default()).await.unwrap();

        assert_eq!(value, json!({"text": "OK", "_raw": true}));
    }

    #[tokio::test]
    async fn test_fetch_non_2xx_carries_status_and_detail() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users")
            .with_status(404)
            .with_body("no such collection")
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let err = c.fetch("/users", FetchOptions::default()).await.unwrap_err();

        match err {
            FetchError::Http {
                status,
                status_text,
                detail,
            } => {
                assert_eq!(status, 404);
                assert_eq!(status_text, "Not Found");
                assert_eq!(detail.as_deref(), Some("no such collection"));
            }
            other => panic!("expected Http error, got {:?}", other),
        }
        // Display format stays "HTTP {status}: {statusText}"
    }

    #[tokio::test]
    async fn test_fetch_post_serializes_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::Json(json!({"name": "widget"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 9}"#)
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let options = FetchOptions {
            method: Some(Method::POST),
            body: Some(json!({"name": "widget"})),
            ..Default::default()
        };
        let value = c.fetch("/items", options).await.unwrap();

        mock.assert_async().await;
        assert_eq!(value, json!({"id": 9}));
    }

    #[tokio::test]
    async fn test_fetch_explicit_content_type_sends_body_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/raw")
            .match_header("content-type", "text/csv")
            .match_body("a,b,c")
            .with_status(200)
            .with_body("done")
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let mut headers = std::collections::HashMap::new();
        headers.insert("Content-Type".to_string(), "text/csv".to_string());
        let options = FetchOptions {
            method: Some(Method::POST),
            headers,
            body: Some(json!("a,b,c")),
            ..Default::default()
        };

        c.fetch("/raw", options).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_query_params_reach_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "a b".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let c = connector(&server.url(), AuthConfig::None);
        let options = FetchOptions {
            params: vec![("q".to_string(), "a b".to_string())],
            ..Default::default()
        };

        c.fetch("/search", options).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_timeout_aborts_in_flight() {
        // A listener that accepts into its backlog but never responds
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let c = connector(&format!("http://{}", addr), AuthConfig::None);
        let options = FetchOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let err = c.fetch("/slow", options).await.unwrap_err();
        assert_eq!(err, FetchError::TimedOut);
        assert_eq!(err.to_string(), "Request timed out");
    }
}
