//! Input sanitization for free-text fields.
//!
//! Every user-supplied value that ends up in a request body (login,
//! registration, search) passes through [`validate`] first. The guard is
//! pure: it never touches the credential store or the network, so it is
//! safe to call on every keystroke.
//!
//! Markup is always stripped *before* lengths are measured, so tag padding
//! cannot be used to slip past a length limit.

pub mod guard;
pub mod rules;

pub use guard::{strip_markup, validate, ValidationError, ValidationResult};
pub use rules::{FieldKind, Rules};
