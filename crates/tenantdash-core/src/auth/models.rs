//! Wire types exchanged with the upstream identity provider.
//!
//! The provider has shipped both camelCase and snake_case field names, so
//! every field accepts either spelling.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::credential::TokenType;

/// Token lifetime assumed when the provider omits one (24 hours).
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 86_400;

fn default_lifetime() -> i64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

fn default_role() -> String {
    "user".to_string()
}

/// Successful response from the login endpoint.
#[derive(Clone, Deserialize)]
pub struct LoginResult {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "tokenType", default)]
    pub token_type: TokenType,
    #[serde(
        alias = "expiresInSeconds",
        alias = "expires_in_seconds",
        default = "default_lifetime"
    )]
    pub expires_in: i64,
}

impl LoginResult {
    pub fn new(access_token: impl Into<String>, token_type: TokenType, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            token_type,
            expires_in,
        }
    }
}

impl fmt::Debug for LoginResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResult")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// User identifiers arrive as integers from some deployments and strings from others.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Number(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Number(id) => write!(f, "{}", id),
            UserId::Text(id) => f.write_str(id),
        }
    }
}

/// Response from the "who am I" endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(alias = "tenantId")]
    pub tenant_id: String,
}

#[derive(Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub(crate) struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
}

/// Response from the registration endpoint. Deployments differ in how much
/// they echo back, so everything is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisteredUser {
    #[serde(default)]
    pub id: Option<UserId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response from the provider's health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}
