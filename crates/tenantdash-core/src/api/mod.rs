//! Upstream request plumbing.
//!
//! `UpstreamClient` makes single HTTP calls, `classify` turns their failures
//! into an [`ErrorClass`], and `RequestExecutor` decides what to do about
//! them: retry, give up, or invalidate the session.

pub mod client;
pub mod error;
pub mod executor;

pub use client::UpstreamClient;
pub use error::{classify, ApiError, ErrorClass, FieldViolation, UpstreamFailure};
pub use executor::{
    Backoff, Decision, ExecuteOptions, Execution, OperationKind, RequestAttempt, RequestExecutor,
    RetryPolicy, Scheduler, TokioScheduler,
};
