//! HTTP client for the upstream identity provider and data services.
//!
//! `UpstreamClient` performs exactly one request per call. It never retries;
//! retry policy lives in [`crate::api::executor`]. Failures come back as
//! [`UpstreamFailure`] so they can be classified in one place.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::auth::Credential;
use crate::config::UpstreamConfig;

use super::UpstreamFailure;

/// Client for one upstream origin.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    /// Create a client for `config.base_url` with the configured per-attempt timeout
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn auth_headers(credential: Option<&Credential>) -> Result<header::HeaderMap, UpstreamFailure> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(credential) = credential {
            let mut value = header::HeaderValue::from_str(&credential.authorization_header())
                .map_err(|_| UpstreamFailure::Other("credential is not a valid header value".to_string()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning a failure with the body if not.
    async fn check_response(response: Response) -> Result<Response, UpstreamFailure> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(UpstreamFailure::from_status(status, &body))
        }
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: Option<&Credential>,
    ) -> Result<T, UpstreamFailure> {
        let url = self.url(path);
        debug!(url = %url, authenticated = credential.is_some(), "GET");

        let response = self
            .client
            .get(&url)
            .headers(Self::auth_headers(credential)?)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    /// POST `body` as JSON to `path` and decode the JSON response.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        credential: Option<&Credential>,
    ) -> Result<T, UpstreamFailure> {
        let url = self.url(path);
        debug!(url = %url, authenticated = credential.is_some(), "POST");

        let response = self
            .client
            .post(&url)
            .headers(Self::auth_headers(credential)?)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{classify, ErrorClass};
    use crate::auth::TokenType;
    use chrono::{Duration as ChronoDuration, Utc};
    use mockito::{Matcher, Server};

    fn config(base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base_url.to_string(),
            request_timeout_secs: 5,
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn test_url_joining() {
        let client = UpstreamClient::new(&config("http://localhost:8009/")).expect("client");
        assert_eq!(client.base_url(), "http://localhost:8009");
        assert_eq!(client.url("/auth/login"), "http://localhost:8009/auth/login");
        assert_eq!(client.url("health"), "http://localhost:8009/health");
    }

    #[tokio::test]
    async fn test_get_attaches_credential() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/profile")
            .match_header("Authorization", Matcher::Exact("Bearer tok1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let client = UpstreamClient::new(&config(&server.url())).expect("client");
        let now = Utc::now();
        let credential = Credential::new(
            "tok1".to_string(),
            TokenType::Bearer,
            now,
            now + ChronoDuration::hours(1),
        )
        .expect("credential");

        let body: serde_json::Value = client
            .get_json("/auth/profile", Some(&credential))
            .await
            .expect("request succeeds");
        assert_eq!(body["ok"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_carries_message() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/auth/register")
            .with_status(409)
            .with_body(r#"{"detail":"Email already registered"}"#)
            .create_async()
            .await;

        let client = UpstreamClient::new(&config(&server.url())).expect("client");
        let failure = client
            .post_json::<serde_json::Value, _>("/auth/register", &serde_json::json!({}), None)
            .await
            .expect_err("409 is a failure");

        assert_eq!(classify(&failure), ErrorClass::RetryableClientError);
        assert_eq!(failure.to_string(), "status 409 Conflict: Email already registered");
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_failure() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = UpstreamClient::new(&config(&server.url())).expect("client");
        let failure = client
            .get_json::<serde_json::Value>("/health", None)
            .await
            .expect_err("body is not json");
        assert!(matches!(failure, UpstreamFailure::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_network_error() {
        // Port 9 (discard) is not listening on loopback in test environments
        let client = UpstreamClient::new(&config("http://127.0.0.1:9")).expect("client");
        let failure = client
            .get_json::<serde_json::Value>("/health", None)
            .await
            .expect_err("nothing is listening");
        assert_eq!(classify(&failure), ErrorClass::ServerOrNetworkError);
    }
}
