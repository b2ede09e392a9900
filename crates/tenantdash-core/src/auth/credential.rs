use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;

use super::models::Profile;

/// Buffer before expiry at which a credential is considered due for refresh.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Scheme of an access token. Parsed case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TokenType {
    #[default]
    Bearer,
    Other(String),
}

impl TokenType {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("bearer") || value.is_empty() {
            TokenType::Bearer
        } else {
            TokenType::Other(value.to_string())
        }
    }

    /// Scheme name as sent in the `Authorization` header
    pub fn scheme(&self) -> &str {
        match self {
            TokenType::Bearer => "Bearer",
            TokenType::Other(scheme) => scheme,
        }
    }
}

impl From<String> for TokenType {
    fn from(value: String) -> Self {
        TokenType::parse(&value)
    }
}

impl From<TokenType> for String {
    fn from(value: TokenType) -> Self {
        match value {
            TokenType::Bearer => "bearer".to_string(),
            TokenType::Other(scheme) => scheme,
        }
    }
}

/// A short-lived access credential.
///
/// Always satisfies `expires_at > issued_at` and has a non-empty token; the
/// only way to build one is [`Credential::new`], which also guards
/// deserialization from the vault.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCredential")]
pub struct Credential {
    token: String,
    token_type: TokenType,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawCredential {
    token: String,
    token_type: TokenType,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<RawCredential> for Credential {
    type Error = ApiError;

    fn try_from(raw: RawCredential) -> Result<Self, Self::Error> {
        Credential::new(raw.token, raw.token_type, raw.issued_at, raw.expires_at)
    }
}

impl Credential {
    pub fn new(
        token: String,
        token_type: TokenType,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, ApiError> {
        if token.trim().is_empty() {
            return Err(ApiError::InvalidIssuance("access token is empty".to_string()));
        }
        if expires_at <= issued_at {
            return Err(ApiError::InvalidIssuance(
                "credential expires before it was issued".to_string(),
            ));
        }
        Ok(Self {
            token,
            token_type,
            issued_at,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_type(&self) -> &TokenType {
        &self.token_type
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check if the credential will expire soon and should be re-validated
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES) >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type.scheme(), self.token)
    }
}

// Tokens must never reach logs, so Debug is written by hand.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The authenticated identity derived from a valid credential.
///
/// A read-only projection: it lives next to the credential inside the store
/// and disappears with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub tenant_id: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn from_profile(profile: Profile, credential: &Credential) -> Self {
        let display_name = profile
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                profile
                    .email
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });

        Self {
            user_id: profile.id.to_string(),
            email: profile.email,
            display_name,
            role: profile.role,
            tenant_id: profile.tenant_id,
            expires_at: credential.expires_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::UserId;

    fn credential(lifetime: Duration) -> Credential {
        let now = Utc::now();
        Credential::new("tok1".to_string(), TokenType::Bearer, now, now + lifetime)
            .expect("valid credential")
    }

    #[test]
    fn test_rejects_empty_token() {
        let now = Utc::now();
        let result = Credential::new("  ".to_string(), TokenType::Bearer, now, now + Duration::hours(1));
        assert!(matches!(result, Err(ApiError::InvalidIssuance(_))));
    }

    #[test]
    fn test_rejects_non_positive_lifetime() {
        let now = Utc::now();
        let result = Credential::new("tok".to_string(), TokenType::Bearer, now, now);
        assert!(matches!(result, Err(ApiError::InvalidIssuance(_))));
    }

    #[test]
    fn test_expiry() {
        let fresh = credential(Duration::hours(1));
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh());
        assert!(fresh.minutes_until_expiry() >= 59);

        let soon = credential(Duration::minutes(3));
        assert!(!soon.is_expired());
        assert!(soon.needs_refresh());

        assert!(fresh.is_expired_at(fresh.expires_at()));
        assert!(fresh.is_expired_at(fresh.expires_at() + Duration::seconds(1)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let c = credential(Duration::hours(1));
        let debug = format!("{:?}", c);
        assert!(!debug.contains("tok1"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_token_type_parsing() {
        assert_eq!(TokenType::parse("Bearer"), TokenType::Bearer);
        assert_eq!(TokenType::parse("bearer"), TokenType::Bearer);
        assert_eq!(TokenType::parse("MAC"), TokenType::Other("MAC".to_string()));
        assert_eq!(credential(Duration::hours(1)).authorization_header(), "Bearer tok1");
    }

    #[test]
    fn test_deserialize_enforces_invariants() {
        let json = r#"{"token":"abc","token_type":"bearer","issued_at":"2026-01-01T00:00:00Z","expires_at":"2025-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Credential>(json).is_err());

        let json = r#"{"token":"abc","token_type":"Bearer","issued_at":"2026-01-01T00:00:00Z","expires_at":"2026-01-02T00:00:00Z"}"#;
        let c: Credential = serde_json::from_str(json).expect("valid credential json");
        assert_eq!(c.token(), "abc");
        assert_eq!(c.token_type(), &TokenType::Bearer);
    }

    #[test]
    fn test_session_display_name_falls_back_to_email() {
        let c = credential(Duration::hours(1));
        let profile = Profile {
            id: UserId::Number(1),
            email: "testuser@example.com".to_string(),
            name: None,
            role: "user".to_string(),
            tenant_id: "test-tenant-1".to_string(),
        };
        let session = Session::from_profile(profile, &c);
        assert_eq!(session.user_id, "1");
        assert_eq!(session.display_name, "testuser");
        assert_eq!(session.tenant_id, "test-tenant-1");
        assert_eq!(session.expires_at, c.expires_at());
    }
}
