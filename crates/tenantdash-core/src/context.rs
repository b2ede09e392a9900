use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::{ApiError, RequestExecutor, UpstreamClient};
use crate::auth::{
    CredentialGateway, CredentialStore, HealthStatus, InvalidationEvent, KeyringVault, Session,
};
use crate::config::Config;

/// One logical session: a store, the gateway in front of it, and the
/// executor every upstream call goes through. Share it behind an `Arc`.
pub struct SessionContext {
    gateway: Arc<CredentialGateway>,
    executor: RequestExecutor,
}

impl SessionContext {
    /// Build from configuration. With the vault enabled, a credential left by
    /// a previous run is restored from the OS keychain.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = if config.vault.enabled {
            debug!(service = %config.vault.service_name, "Using keychain vault");
            CredentialStore::open(Arc::new(KeyringVault::new(config.vault.service_name.clone())))
        } else {
            CredentialStore::new()
        };
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: &Config, store: Arc<CredentialStore>) -> Result<Self> {
        let client = UpstreamClient::new(&config.upstream)?;
        let gateway = Arc::new(CredentialGateway::new(client, &config.upstream, store));
        let executor = RequestExecutor::new(gateway.clone(), &config.retry);
        Ok(Self { gateway, executor })
    }

    pub fn gateway(&self) -> &Arc<CredentialGateway> {
        &self.gateway
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Re-authentication signals raised by the invalidation cascade
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.gateway.cascade().subscribe()
    }

    /// Validated session for the held credential, asking upstream only when
    /// none is cached yet.
    pub async fn session(&self) -> Result<Arc<Session>, ApiError> {
        match self.gateway.session() {
            Some(session) if self.gateway.store().is_authenticated() => Ok(session),
            _ => self.gateway.validate().await,
        }
    }

    /// Provider health, retried like any other query.
    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        let client = self.gateway.client();
        let path = self.gateway.endpoints().health.as_str();
        self.executor
            .query("health", move |_| client.get_json::<HealthStatus>(path, None))
            .await
    }
}
