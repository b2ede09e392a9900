//! Session credential lifecycle.
//!
//! This module provides:
//! - `Credential` and `Session`: the short-lived access credential and the
//!   identity projected from it
//! - `CredentialStore`: the single holder of the current credential, with an
//!   optional `CredentialVault` (OS keychain) behind it
//! - `CredentialGateway`: issue, validate, refresh and logout against the
//!   upstream identity provider, plus the login/register/health proxies
//! - `SessionInvalidation`: clears the store and signals re-authentication
//!   when upstream rejects a credential

pub mod cascade;
pub mod credential;
pub mod gateway;
pub mod models;
pub mod store;
pub mod vault;

pub use cascade::{InvalidationEvent, InvalidationReason, SessionInvalidation};
pub use credential::{Credential, Session, TokenType};
pub use gateway::{CredentialGateway, Endpoints};
pub use models::{HealthStatus, LoginResult, Profile, RegisteredUser, UserId};
pub use store::CredentialStore;
pub use vault::{CredentialVault, KeyringVault, MemoryVault};
