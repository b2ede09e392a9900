//! Login, use, rejection and re-login against a mock identity provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mockito::{Matcher, Server};

use tenantdash_core::api::{ApiError, UpstreamFailure};
use tenantdash_core::auth::{
    CredentialStore, CredentialVault, InvalidationReason, LoginResult, MemoryVault, TokenType,
};
use tenantdash_core::config::Config;
use tenantdash_core::SessionContext;

fn config(base_url: &str) -> Config {
    let mut config = Config::default();
    config.upstream.base_url = base_url.to_string();
    config.upstream.request_timeout_secs = 5;
    config.vault.enabled = false;
    config
}

#[tokio::test]
async fn test_login_then_rejected_validation() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(r#"{"accessToken":"tok1","tokenType":"bearer","expiresInSeconds":3600}"#)
        .create_async()
        .await;
    let profile = server
        .mock("GET", "/auth/profile")
        .match_header("Authorization", "Bearer tok1")
        .with_status(401)
        .with_body(r#"{"detail":"Token revoked"}"#)
        .expect(1)
        .create_async()
        .await;

    let context = SessionContext::from_config(&config(&server.url())).expect("context");
    let mut invalidations = context.subscribe();
    let gateway = context.gateway();

    gateway
        .login("testuser@example.com", "TestPassword123")
        .await
        .expect("login");

    let credential = gateway.current_credential().expect("credential after login");
    assert_eq!(credential.token_type(), &TokenType::Bearer);
    let remaining = (credential.expires_at() - Utc::now()).num_seconds();
    assert!((3590..=3600).contains(&remaining), "remaining {}", remaining);

    assert!(matches!(gateway.validate().await, Err(ApiError::Unauthenticated)));
    assert!(gateway.current_credential().is_none());
    assert_eq!(gateway.cascade().fired_count(), 1);

    let event = invalidations.recv().await.expect("invalidation event");
    assert_eq!(event.reason, InvalidationReason::ValidationRejected);
    assert!(invalidations.try_recv().is_err());
    profile.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_rejections_redirect_once() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(r#"{"access_token":"tok1","token_type":"Bearer","expires_in":3600}"#)
        .create_async()
        .await;
    let _items = server
        .mock("GET", "/items")
        .with_status(401)
        .create_async()
        .await;

    let context = Arc::new(SessionContext::from_config(&config(&server.url())).expect("context"));
    context
        .gateway()
        .login("testuser@example.com", "TestPassword123")
        .await
        .expect("login");

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let context = context.clone();
            tokio::spawn(async move {
                let client = context.gateway().client().clone();
                context
                    .executor()
                    .query("items", move |credential| {
                        let client = client.clone();
                        async move {
                            client
                                .get_json::<serde_json::Value>("/items", credential.as_deref())
                                .await
                        }
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        let result = task.await.expect("task");
        assert!(matches!(result, Err(ApiError::Unauthenticated)));
    }
    assert!(context.gateway().current_credential().is_none());
    assert_eq!(context.gateway().cascade().fired_count(), 1);
}

#[tokio::test]
async fn test_rejection_of_old_credential_spares_new_login() {
    let mut server = Server::new_async().await;
    let _first = server
        .mock("POST", "/auth/login")
        .match_body(Matcher::PartialJsonString(r#"{"password":"FirstPass1"}"#.to_string()))
        .with_status(200)
        .with_body(r#"{"access_token":"old","expires_in":3600}"#)
        .create_async()
        .await;
    let _second = server
        .mock("POST", "/auth/login")
        .match_body(Matcher::PartialJsonString(r#"{"password":"SecondPass2"}"#.to_string()))
        .with_status(200)
        .with_body(r#"{"access_token":"new","expires_in":3600}"#)
        .create_async()
        .await;

    let context = SessionContext::from_config(&config(&server.url())).expect("context");
    let gateway = context.gateway();
    let old = gateway
        .login("testuser@example.com", "FirstPass1")
        .await
        .expect("first login");
    gateway
        .login("testuser@example.com", "SecondPass2")
        .await
        .expect("second login");

    // A rejection of the first credential arrives after the second login
    assert!(!gateway.cascade().invalidate(&old, InvalidationReason::RequestRejected));
    assert_eq!(
        gateway.current_credential().map(|c| c.token().to_string()),
        Some("new".to_string())
    );
    assert_eq!(gateway.cascade().fired_count(), 0);

    // The current one being rejected does end the session
    let result = context
        .executor()
        .mutation("save", |credential| {
            assert_eq!(credential.as_ref().map(|c| c.token()), Some("new"));
            async move {
                Err::<(), _>(UpstreamFailure::Status {
                    status: reqwest::StatusCode::UNAUTHORIZED,
                    message: None,
                })
            }
        })
        .await;
    assert!(matches!(result, Err(ApiError::Unauthenticated)));
    assert_eq!(gateway.cascade().fired_count(), 1);
    assert!(gateway.current_credential().is_none());
}

#[tokio::test]
async fn test_credential_survives_restart_through_vault() {
    let server = Server::new_async().await;
    let vault = Arc::new(MemoryVault::new());

    let first = SessionContext::with_store(
        &config(&server.url()),
        Arc::new(CredentialStore::open(vault.clone())),
    )
    .expect("context");
    first
        .gateway()
        .issue(LoginResult::new("tok1", TokenType::Bearer, 3600))
        .expect("issue");

    let second = SessionContext::with_store(
        &config(&server.url()),
        Arc::new(CredentialStore::open(vault.clone())),
    )
    .expect("context");
    assert_eq!(
        second.gateway().current_credential().map(|c| c.token().to_string()),
        Some("tok1".to_string())
    );

    second.gateway().logout();
    assert!(vault.load().expect("load").is_none());
}

#[tokio::test]
async fn test_unreachable_provider_keeps_session() {
    // Nothing listens on the discard port
    let context = SessionContext::from_config(&config("http://127.0.0.1:9")).expect("context");
    context
        .gateway()
        .issue(LoginResult::new("tok1", TokenType::Bearer, 3600))
        .expect("issue");

    let started = std::time::Instant::now();
    assert!(matches!(
        context.gateway().validate().await,
        Err(ApiError::ServerOrNetworkError(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(context.gateway().current_credential().is_some());
    assert_eq!(context.gateway().cascade().fired_count(), 0);
}
