//! Boundary between the credential store and the upstream identity provider.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::api::{classify, ApiError, ErrorClass, FieldViolation, UpstreamClient, UpstreamFailure};
use crate::config::UpstreamConfig;
use crate::sanitize::{self, FieldKind, Rules};

use super::models::{HealthStatus, LoginRequest, Profile, RegisterRequest, RegisteredUser};
use super::{Credential, CredentialStore, InvalidationReason, LoginResult, Session, SessionInvalidation};

/// Longest display name accepted at registration
const MAX_NAME_LENGTH: usize = 100;

/// Upstream endpoint paths, relative to the client's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub profile: String,
    pub register: String,
    pub health: String,
}

impl From<&UpstreamConfig> for Endpoints {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            login: config.login_path.clone(),
            profile: config.profile_path.clone(),
            register: config.register_path.clone(),
            health: config.health_path.clone(),
        }
    }
}

#[derive(Debug)]
pub struct CredentialGateway {
    client: UpstreamClient,
    endpoints: Endpoints,
    store: Arc<CredentialStore>,
    cascade: Arc<SessionInvalidation>,
}

impl CredentialGateway {
    pub fn new(client: UpstreamClient, config: &UpstreamConfig, store: Arc<CredentialStore>) -> Self {
        let cascade = Arc::new(SessionInvalidation::new(store.clone()));
        Self {
            client,
            endpoints: Endpoints::from(config),
            store,
            cascade,
        }
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn cascade(&self) -> &Arc<SessionInvalidation> {
        &self.cascade
    }

    /// Build a credential from a login result and make it current.
    pub fn issue(&self, login: LoginResult) -> Result<Arc<Credential>, ApiError> {
        if login.expires_in <= 0 {
            return Err(ApiError::InvalidIssuance(format!(
                "lifetime must be positive, got {}s",
                login.expires_in
            )));
        }

        let issued_at = Utc::now();
        let expires_at = Duration::try_seconds(login.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ApiError::InvalidIssuance(format!(
                    "lifetime of {}s is out of range",
                    login.expires_in
                ))
            })?;
        let credential = Credential::new(login.access_token, login.token_type, issued_at, expires_at)?;

        debug!(expires_at = %credential.expires_at(), "Issued credential");
        Ok(self.store.set(credential))
    }

    pub fn current_credential(&self) -> Option<Arc<Credential>> {
        self.store.get()
    }

    /// Session cached by the last successful validation of the current credential
    pub fn session(&self) -> Option<Arc<Session>> {
        self.store.session()
    }

    /// Ask upstream who the current credential belongs to.
    ///
    /// A rejected credential is invalidated. Any other failure leaves the
    /// store untouched.
    pub async fn validate(&self) -> Result<Arc<Session>, ApiError> {
        let credential = self.store.get().ok_or(ApiError::Unauthenticated)?;
        match self.fetch_profile(&credential).await {
            Ok(session) => Ok(session),
            Err(failure) => match classify(&failure) {
                ErrorClass::Unauthenticated => {
                    self.cascade.invalidate(&credential, InvalidationReason::ValidationRejected);
                    Err(ApiError::Unauthenticated)
                }
                ErrorClass::ServerOrNetworkError => {
                    warn!(error = %failure, "Validation could not reach upstream");
                    Err(ApiError::ServerOrNetworkError(failure.to_string()))
                }
                class => Err(ApiError::from_failure(class, failure)),
            },
        }
    }

    /// Re-validate the held credential. There is no separate refresh token;
    /// the credential is kept as-is if upstream still accepts it.
    pub async fn refresh(&self) -> Result<Arc<Session>, ApiError> {
        let credential = self.store.get().ok_or(ApiError::Unauthenticated)?;
        match self.fetch_profile(&credential).await {
            Ok(session) => {
                debug!("Credential re-validated");
                Ok(session)
            }
            Err(failure) if classify(&failure) == ErrorClass::Unauthenticated => {
                self.cascade.invalidate(&credential, InvalidationReason::RefreshRejected);
                Err(ApiError::Unauthenticated)
            }
            Err(failure) => {
                warn!(error = %failure, "Refresh failed");
                Err(ApiError::ServerOrNetworkError(failure.to_string()))
            }
        }
    }

    /// Drop the local session. Upstream is not contacted.
    pub fn logout(&self) {
        if self.store.clear() {
            info!("Logged out");
        }
    }

    /// Exchange email and password for a credential.
    ///
    /// Rejected credentials surface as `Unauthenticated` without invalidating
    /// anything; the current session, if any, stays as it was.
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<Credential>, ApiError> {
        let [email, password] = guard([
            (FieldKind::Email, email, Rules::for_kind(FieldKind::Email)),
            (
                FieldKind::Password,
                password,
                Rules::for_kind(FieldKind::Password).with_min_length(1),
            ),
        ])?;

        let request = LoginRequest {
            email: &email,
            password: &password,
        };
        let login: LoginResult = self
            .client
            .post_json(&self.endpoints.login, &request, None)
            .await
            .map_err(into_api_error)?;

        let credential = self.issue(login)?;
        info!("Logged in");
        Ok(credential)
    }

    /// Create an account. Does not log in.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<RegisteredUser, ApiError> {
        let [email, password, name] = guard([
            (FieldKind::Email, email, Rules::for_kind(FieldKind::Email)),
            (FieldKind::Password, password, Rules::for_kind(FieldKind::Password)),
            (
                FieldKind::GenericText,
                name.unwrap_or_default(),
                Rules::for_kind(FieldKind::GenericText).with_max_length(MAX_NAME_LENGTH),
            ),
        ])?;

        let request = RegisterRequest {
            email: &email,
            password: &password,
            name: Some(name.as_str()).filter(|n| !n.is_empty()),
        };
        let mut registered: RegisteredUser = self
            .client
            .post_json(&self.endpoints.register, &request, None)
            .await
            .map_err(into_api_error)?;

        if registered.email.is_none() {
            registered.email = Some(email);
        }
        info!("Registered account");
        Ok(registered)
    }

    /// Single unauthenticated call to the provider's health endpoint
    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.client
            .get_json(&self.endpoints.health, None)
            .await
            .map_err(into_api_error)
    }

    async fn fetch_profile(&self, credential: &Arc<Credential>) -> Result<Arc<Session>, UpstreamFailure> {
        let profile: Profile = self
            .client
            .get_json(&self.endpoints.profile, Some(credential))
            .await?;
        let session = Session::from_profile(profile, credential);
        Ok(self.store.cache_session(credential, session))
    }
}

fn into_api_error(failure: UpstreamFailure) -> ApiError {
    ApiError::from_failure(classify(&failure), failure)
}

/// Run each field through the sanitization guard, collecting every violation.
fn guard<const N: usize>(fields: [(FieldKind, &str, Rules); N]) -> Result<[String; N], ApiError> {
    let mut violations = Vec::new();
    let values = fields.map(|(kind, raw, rules)| {
        let result = sanitize::validate(kind, raw, &rules);
        violations.extend(
            result
                .errors
                .into_iter()
                .map(|error| FieldViolation { field: kind, error }),
        );
        result.sanitized_value
    });

    if violations.is_empty() {
        Ok(values)
    } else {
        Err(ApiError::InputRejected(violations))
    }
}
