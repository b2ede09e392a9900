//! Resilient execution of upstream operations.
//!
//! Every query and mutation runs through [`RequestExecutor`], which attaches
//! the current credential, classifies failures, and applies the retry policy
//! for the operation kind. The retry loop is an explicit state machine:
//!
//! ```text
//! Idle -> Attempting(n) -> Succeeded
//!                       -> Failed
//!                       -> Backoff(n) -> Attempting(n + 1)
//! ```
//!
//! Backoff sleeps go through a [`Scheduler`], and both the in-flight attempt
//! and the sleep are raced against a cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{Credential, CredentialGateway, InvalidationReason};
use crate::config::RetryConfig;

use super::{classify, ApiError, ErrorClass, UpstreamFailure};

/// Upper bound on jitter, as a fraction of the computed delay.
const JITTER_DIVISOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// `min(base * 2^n, max)` after the n-th failed attempt (0-based)
    Exponential { base_delay_ms: u64, max_delay_ms: u64 },
    Fixed { delay_ms: u64 },
}

/// Retry policy for one operation kind.
///
/// `max_attempts` counts every attempt including the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::query_default()
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    Fail,
    Invalidate,
}

impl RetryPolicy {
    /// Three attempts, exponential backoff from 1s capped at 30s
    pub fn query_default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
            jitter: false,
        }
    }

    /// A single retry after a fixed 1s delay
    pub fn mutation_default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::Fixed { delay_ms: 1000 },
            jitter: false,
        }
    }

    /// Delay before the attempt that follows failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.backoff {
            Backoff::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                base_delay_ms.saturating_mul(factor).min(max_delay_ms)
            }
            Backoff::Fixed { delay_ms } => delay_ms,
        };
        Duration::from_millis(millis)
    }

    /// Decide the next step after attempt `attempt` (0-based) failed with `class`.
    ///
    /// Deterministic: jitter, if enabled, is applied by the executor afterwards.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> Decision {
        match class {
            ErrorClass::Unauthenticated => Decision::Invalidate,
            ErrorClass::ClientError => Decision::Fail,
            ErrorClass::RetryableClientError
            | ErrorClass::ServerOrNetworkError
            | ErrorClass::Unknown => {
                if attempt.saturating_add(1) < self.max_attempts {
                    Decision::Retry(self.delay_for(attempt))
                } else {
                    Decision::Fail
                }
            }
        }
    }
}

/// Timer abstraction for backoff sleeps.
pub trait Scheduler: Send + Sync {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed()
    }
}

/// Record of one try of one operation. Only lives as long as the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttempt {
    pub operation_kind: OperationKind,
    pub attempt_number: u32,
    /// `None` for the attempt that succeeded
    pub error_class: Option<ErrorClass>,
    pub timestamp: DateTime<Utc>,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub name: String,
    pub policy: Option<RetryPolicy>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Stop retrying (and skip session invalidation) once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of an execution together with every attempt it made.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T, ApiError>,
    pub attempts: Vec<RequestAttempt>,
}

enum State<T> {
    Idle,
    Attempting(u32),
    Backoff { attempt: u32, delay: Duration },
    Succeeded(T),
    Failed(ApiError),
}

/// Why a single attempt failed.
enum AttemptFailure {
    Upstream {
        failure: UpstreamFailure,
        credential: Option<Arc<Credential>>,
    },
    /// Re-validating an expired credential failed before the call was made
    Refresh(ApiError),
}

impl AttemptFailure {
    fn class(&self) -> ErrorClass {
        match self {
            AttemptFailure::Upstream { failure, .. } => classify(failure),
            AttemptFailure::Refresh(err) => err.class().unwrap_or(ErrorClass::ServerOrNetworkError),
        }
    }
}

/// Runs operations with the retry policy for their kind.
pub struct RequestExecutor<S: Scheduler = TokioScheduler> {
    gateway: Arc<CredentialGateway>,
    query_policy: RetryPolicy,
    mutation_policy: RetryPolicy,
    scheduler: S,
}

impl RequestExecutor<TokioScheduler> {
    pub fn new(gateway: Arc<CredentialGateway>, retry: &RetryConfig) -> Self {
        Self::with_scheduler(gateway, retry, TokioScheduler)
    }
}

impl<S: Scheduler> RequestExecutor<S> {
    pub fn with_scheduler(gateway: Arc<CredentialGateway>, retry: &RetryConfig, scheduler: S) -> Self {
        Self {
            gateway,
            query_policy: retry.query.clone(),
            mutation_policy: retry.mutation.clone(),
            scheduler,
        }
    }

    pub fn policy_for(&self, kind: OperationKind) -> &RetryPolicy {
        match kind {
            OperationKind::Query => &self.query_policy,
            OperationKind::Mutation => &self.mutation_policy,
        }
    }

    /// Run a read operation with the query policy.
    pub async fn query<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, ApiError>
    where
        F: FnMut(Option<Arc<Credential>>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        self.execute(OperationKind::Query, ExecuteOptions::new(name), operation)
            .await
    }

    /// Run a write operation with the mutation policy.
    pub async fn mutation<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, ApiError>
    where
        F: FnMut(Option<Arc<Credential>>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        self.execute(OperationKind::Mutation, ExecuteOptions::new(name), operation)
            .await
    }

    pub async fn execute<T, F, Fut>(
        &self,
        kind: OperationKind,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut(Option<Arc<Credential>>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        self.execute_traced(kind, options, operation).await.result
    }

    /// Run `operation`, returning the outcome and the attempt log.
    ///
    /// `operation` receives the credential to attach (if any) and is called
    /// once per attempt. Attempts never overlap.
    pub async fn execute_traced<T, F, Fut>(
        &self,
        kind: OperationKind,
        options: ExecuteOptions,
        mut operation: F,
    ) -> Execution<T>
    where
        F: FnMut(Option<Arc<Credential>>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let policy = options
            .policy
            .clone()
            .unwrap_or_else(|| self.policy_for(kind).clone());
        let cancel = options.cancel.clone().unwrap_or_default();
        let name = options.name.as_str();

        let mut attempts = Vec::new();
        let mut state = State::Idle;

        loop {
            state = match state {
                State::Idle => State::Attempting(0),

                State::Attempting(attempt) => {
                    if cancel.is_cancelled() {
                        State::Failed(ApiError::Cancelled)
                    } else {
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            outcome = self.attempt(&mut operation) => Some(outcome),
                        };

                        match outcome {
                            None => State::Failed(ApiError::Cancelled),
                            Some(Ok(value)) => {
                                attempts.push(record(kind, attempt, None));
                                if attempt > 0 {
                                    info!(operation = name, attempts = attempt + 1, "Succeeded after retry");
                                }
                                State::Succeeded(value)
                            }
                            Some(Err(failure)) => {
                                let class = failure.class();
                                attempts.push(record(kind, attempt, Some(class)));
                                self.after_failure(name, &policy, &cancel, attempt, class, failure)
                            }
                        }
                    }
                }

                State::Backoff { attempt, delay } => {
                    let delay = if policy.jitter { with_jitter(delay) } else { delay };
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => State::Failed(ApiError::Cancelled),
                        _ = self.scheduler.sleep(delay) => State::Attempting(attempt + 1),
                    }
                }

                State::Succeeded(value) => {
                    return Execution {
                        result: Ok(value),
                        attempts,
                    };
                }

                State::Failed(err) => {
                    if matches!(err, ApiError::Cancelled) {
                        debug!(operation = name, "Cancelled; no further attempts");
                    }
                    return Execution {
                        result: Err(err),
                        attempts,
                    };
                }
            };
        }
    }

    /// One attempt: pick the credential, re-validating it first if expired, then call.
    async fn attempt<T, F, Fut>(&self, operation: &mut F) -> Result<T, AttemptFailure>
    where
        F: FnMut(Option<Arc<Credential>>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let mut credential = self.gateway.current_credential();

        if credential.as_ref().is_some_and(|c| c.is_expired()) {
            debug!("Credential expired, re-validating before use");
            self.gateway.refresh().await.map_err(AttemptFailure::Refresh)?;
            credential = self.gateway.current_credential();
        }

        operation(credential.clone())
            .await
            .map_err(|failure| AttemptFailure::Upstream { failure, credential })
    }

    fn after_failure<T>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        attempt: u32,
        class: ErrorClass,
        failure: AttemptFailure,
    ) -> State<T> {
        match policy.decide(class, attempt) {
            Decision::Retry(delay) => State::Backoff { attempt, delay },
            Decision::Fail => {
                let err = match failure {
                    AttemptFailure::Upstream { failure, .. } => ApiError::from_failure(class, failure),
                    AttemptFailure::Refresh(err) => err,
                };
                warn!(operation = name, attempts = attempt + 1, ?class, error = %err, "Operation failed");
                State::Failed(err)
            }
            Decision::Invalidate => {
                if cancel.is_cancelled() {
                    return State::Failed(ApiError::Cancelled);
                }
                // A rejected refresh has already gone through the cascade
                match &failure {
                    AttemptFailure::Upstream {
                        credential: Some(credential),
                        ..
                    } => {
                        self.gateway
                            .cascade()
                            .invalidate(credential, InvalidationReason::RequestRejected);
                    }
                    AttemptFailure::Upstream { credential: None, .. } => {
                        self.gateway
                            .cascade()
                            .reject_anonymous(InvalidationReason::RequestRejected);
                    }
                    AttemptFailure::Refresh(_) => {}
                }
                warn!(operation = name, "Upstream rejected credential");
                State::Failed(ApiError::Unauthenticated)
            }
        }
    }
}

fn record(kind: OperationKind, attempt: u32, class: Option<ErrorClass>) -> RequestAttempt {
    RequestAttempt {
        operation_kind: kind,
        attempt_number: attempt,
        error_class: class,
        timestamp: Utc::now(),
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_extra = delay.as_millis() as u64 / JITTER_DIVISOR;
    if max_extra == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra);
    delay + Duration::from_millis(extra)
}
