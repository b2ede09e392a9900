//! Core of the tenant dashboard: the session credential lifecycle and the
//! request layer every upstream call passes through.
//!
//! A credential is issued by the [`auth::CredentialGateway`] from a login
//! result, held by the [`auth::CredentialStore`], attached to each call by the
//! [`api::RequestExecutor`], and torn down by the
//! [`auth::SessionInvalidation`] cascade once upstream rejects it. Free-text
//! input is checked by [`sanitize`] before it is sent anywhere.
//!
//! [`SessionContext`] wires all of it together from a [`config::Config`].

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod sanitize;

pub use context::SessionContext;
