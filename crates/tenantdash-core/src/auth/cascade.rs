use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{Credential, CredentialStore};

/// Pending events a slow subscriber may fall behind by before it starts
/// seeing `Lagged`.
const EVENT_CAPACITY: usize = 16;

const NEVER_SIGNALLED: u64 = u64::MAX;

/// What observed the rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidationReason {
    /// The "who am I" call rejected the credential
    ValidationRejected,
    /// Re-validation of an expired credential was rejected
    RefreshRejected,
    /// An ordinary query or mutation came back unauthenticated
    RequestRejected,
}

/// Signal for the presentation layer to route the user to re-authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub reason: InvalidationReason,
    pub at: DateTime<Utc>,
}

/// Turns an unauthenticated response into the global effect: the store is
/// cleared and subscribers are told to re-authenticate.
///
/// Clearing is compare-and-clear against the credential that was rejected,
/// so any number of concurrent rejections of one credential raise the signal
/// once, and a rejection of an old credential leaves a newer one alone.
/// Rejections of calls that carried no credential raise the signal once per
/// store generation: again only after a new credential has come and gone.
pub struct SessionInvalidation {
    store: Arc<CredentialStore>,
    events: broadcast::Sender<InvalidationEvent>,
    fired: AtomicU64,
    /// Store generation the signal was last raised for
    signalled: AtomicU64,
}

impl std::fmt::Debug for SessionInvalidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInvalidation")
            .field("fired", &self.fired_count())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl SessionInvalidation {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            events,
            fired: AtomicU64::new(0),
            signalled: AtomicU64::new(NEVER_SIGNALLED),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.events.subscribe()
    }

    /// Invalidate `credential`. Returns true if this call raised the signal.
    pub fn invalidate(&self, credential: &Arc<Credential>, reason: InvalidationReason) -> bool {
        let Some(generation) = self.store.revoke(credential) else {
            debug!(?reason, "Credential already invalidated or replaced");
            return false;
        };
        // An anonymous rejection may have won the race since the clear
        if self.signalled.swap(generation, Ordering::SeqCst) == generation {
            debug!(?reason, "Already signalled for this session");
            return false;
        }
        self.raise(reason);
        true
    }

    /// A call made without any credential was rejected.
    ///
    /// Raises the signal if the store is still empty and nothing has been
    /// raised since its last credential went away. Returns whether it fired.
    pub fn reject_anonymous(&self, reason: InvalidationReason) -> bool {
        let Some(generation) = self.store.vacant_generation() else {
            debug!(?reason, "A credential was set meanwhile; not signalling");
            return false;
        };
        let previous = self.signalled.swap(generation, Ordering::SeqCst);
        if previous == generation {
            debug!(?reason, "Already signalled for this session");
            return false;
        }
        self.raise(reason);
        true
    }

    fn raise(&self, reason: InvalidationReason) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        info!(?reason, "Session invalidated, re-authentication required");

        // No subscribers is fine; the store is already cleared.
        let _ = self.events.send(InvalidationEvent {
            reason,
            at: Utc::now(),
        });
    }

    /// Number of times the signal has been raised
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }
}
