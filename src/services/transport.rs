// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! HTTP transport seam.
//!
//! The sync engine only ever sees status, headers and body. Retries,
//! throttling and token handling live above this layer.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Credentials attached to an outbound request.
#[derive(Clone)]
pub enum RequestAuth {
    None,
    Bearer(String),
    /// Client credentials for the token endpoint
    Basic { client_id: String, client_secret: String },
}

impl std::fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestAuth::None => f.write_str("None"),
            RequestAuth::Bearer(_) => f.write_str("Bearer(***)"),
            RequestAuth::Basic { client_id, .. } => write!(f, "Basic({client_id}:***)"),
        }
    }
}

impl RequestAuth {
    fn header_value(&self) -> Option<String> {
        match self {
            RequestAuth::None => None,
            RequestAuth::Bearer(token) => Some(format!("Bearer {token}")),
            RequestAuth::Basic {
                client_id,
                client_secret,
            } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{client_id}:{client_secret}"))
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub auth: RequestAuth,
    /// Sent as `application/x-www-form-urlencoded` when non-empty
    pub form: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>, bearer: &str) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            auth: RequestAuth::Bearer(bearer.to_string()),
            form: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, auth: RequestAuth, form: &[(&str, &str)]) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            auth,
            form: form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Body shortened for error messages.
    pub fn snippet(&self) -> String {
        const MAX: usize = 300;
        match self.body.char_indices().nth(MAX) {
            Some((idx, _)) => format!("{}…", &self.body[..idx]),
            None => self.body.clone(),
        }
    }
}

/// Failure to obtain any response at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// [`HttpTransport`] over a shared `reqwest::Client` with a per-call timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fitbaus-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.http.request(request.method.clone(), &request.url);
        if let Some(value) = request.auth.header_value() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::Network(format!("invalid auth header: {e}")))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(classify)?;

        tracing::debug!(method = %request.method, url = %request.url, status, "HTTP response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_basic_auth_header() {
        let auth = RequestAuth::Basic {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        };
        // base64("id:secret")
        assert_eq!(auth.header_value().unwrap(), "Basic aWQ6c2VjcmV0");
        assert_eq!(format!("{auth:?}"), "Basic(id:***)");
    }

    #[tokio::test]
    async fn test_send_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(header("authorization", "Basic aWQ6c2VjcmV0"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("fitbit-rate-limit-remaining", "7")
                    .set_body_string("{\"errors\":[]}"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(ApiRequest::post_form(
                format!("{}/oauth2/token", server.uri()),
                RequestAuth::Basic {
                    client_id: "id".to_string(),
                    client_secret: "secret".to_string(),
                },
                &[("grant_type", "refresh_token")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status, 400);
        assert_eq!(response.header("Fitbit-Rate-Limit-Remaining"), Some("7"));
        assert_eq!(response.body, "{\"errors\":[]}");
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(50)).unwrap();
        let err = transport
            .send(ApiRequest::get(server.uri(), "token"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
