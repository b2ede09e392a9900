use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use super::{Credential, CredentialVault, Session};

/// The credential together with the session projection derived from it.
/// Replaced as a whole on every write.
#[derive(Debug)]
struct Slot {
    credential: Arc<Credential>,
    session: Option<Arc<Session>>,
    /// Which `set` put this credential here
    generation: u64,
}

/// Holder of the current access credential.
///
/// Reads are a single atomic load of an `Arc`; they take no lock and never
/// wait on a writer or on vault I/O. Writes are serialized by a writer lock
/// and publish a whole new [`Slot`] in one swap, so readers observe either
/// the old value or the new one, never a mix.
pub struct CredentialStore {
    slot: ArcSwapOption<Slot>,
    writer: Mutex<()>,
    /// Number of credentials ever set
    generation: AtomicU64,
    vault: Option<Arc<dyn CredentialVault>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.get().is_some())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("persistent", &self.vault.is_some())
            .finish()
    }
}

impl CredentialStore {
    /// In-memory store with no persistence
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
            vault: None,
        }
    }

    /// Store backed by `vault`, restoring any credential persisted by a previous run.
    ///
    /// An expired or unreadable persisted credential is discarded.
    pub fn open(vault: Arc<dyn CredentialVault>) -> Self {
        let restored = match vault.load() {
            Ok(Some(credential)) if !credential.is_expired() => {
                debug!(expires_at = %credential.expires_at(), "Restored credential from vault");
                Some(Arc::new(Slot {
                    credential: Arc::new(credential),
                    session: None,
                    generation: 1,
                }))
            }
            Ok(Some(_)) => {
                debug!("Discarding expired credential from vault");
                Self::erase_vault(vault.as_ref());
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load credential from vault");
                Self::erase_vault(vault.as_ref());
                None
            }
        };

        let generation = if restored.is_some() { 1 } else { 0 };
        Self {
            slot: ArcSwapOption::new(restored),
            writer: Mutex::new(()),
            generation: AtomicU64::new(generation),
            vault: Some(vault),
        }
    }

    /// Replace the stored credential. Any cached session is dropped.
    pub fn set(&self, credential: Credential) -> Arc<Credential> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let credential = Arc::new(credential);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot.store(Some(Arc::new(Slot {
            credential: credential.clone(),
            session: None,
            generation,
        })));

        if let Some(ref vault) = self.vault {
            if let Err(e) = vault.save(&credential) {
                warn!(error = %e, "Failed to persist credential");
            }
        }
        credential
    }

    /// The stored credential, expired or not
    pub fn get(&self) -> Option<Arc<Credential>> {
        self.current().map(|slot| slot.credential.clone())
    }

    /// The cached session projection, if the current credential has been validated
    pub fn session(&self) -> Option<Arc<Session>> {
        self.current().and_then(|slot| slot.session.clone())
    }

    /// Present and not yet expired
    pub fn is_authenticated(&self) -> bool {
        self.get().map(|c| !c.is_expired()).unwrap_or(false)
    }

    /// Remove the credential and its session. Returns whether anything was removed.
    pub fn clear(&self) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear_locked()
    }

    /// Clear only if `credential` is still the stored one.
    ///
    /// Lets a failure observed with an old credential leave a newer one alone.
    pub fn clear_if_current(&self, credential: &Arc<Credential>) -> bool {
        self.revoke(credential).is_some()
    }

    /// Like [`clear_if_current`](Self::clear_if_current), returning the
    /// generation of the credential that was removed.
    pub(crate) fn revoke(&self, credential: &Arc<Credential>) -> Option<u64> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match self.current() {
            Some(slot) if Arc::ptr_eq(&slot.credential, credential) => {
                self.clear_locked();
                Some(slot.generation)
            }
            _ => None,
        }
    }

    /// If the store is empty, the generation of the last credential it held
    /// (0 if it never held one).
    pub(crate) fn vacant_generation(&self) -> Option<u64> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match self.current() {
            Some(_) => None,
            None => Some(self.generation.load(Ordering::SeqCst)),
        }
    }

    /// Attach a session projection to `credential` if it is still current.
    pub fn cache_session(&self, credential: &Arc<Credential>, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = self.current() {
            if Arc::ptr_eq(&slot.credential, credential) {
                self.slot.store(Some(Arc::new(Slot {
                    credential: slot.credential.clone(),
                    session: Some(session.clone()),
                    generation: slot.generation,
                })));
            }
        }
        session
    }

    fn current(&self) -> Option<Arc<Slot>> {
        self.slot.load_full()
    }

    fn clear_locked(&self) -> bool {
        let removed = self.slot.swap(None).is_some();

        if removed {
            if let Some(ref vault) = self.vault {
                Self::erase_vault(vault.as_ref());
            }
        }
        removed
    }

    fn erase_vault(vault: &dyn CredentialVault) {
        if let Err(e) = vault.erase() {
            warn!(error = %e, "Failed to erase persisted credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryVault, TokenType};
    use chrono::{Duration, Utc};
    use std::thread;

    fn credential(token: &str) -> Credential {
        let now = Utc::now();
        Credential::new(token.to_string(), TokenType::Bearer, now, now + Duration::hours(1))
            .expect("credential")
    }

    fn session(user: &str) -> Session {
        Session {
            user_id: user.to_string(),
            email: format!("{}@example.com", user),
            display_name: user.to_string(),
            role: "user".to_string(),
            tenant_id: "t-1".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_write_then_read() {
        let store = CredentialStore::new();
        for token in ["a", "b", "c"] {
            let c = credential(token);
            store.set(c.clone());
            assert_eq!(store.get().as_deref(), Some(&c));
        }
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = CredentialStore::new();
        store.set(credential("tok1"));

        assert!(store.clear());
        assert!(store.get().is_none());
        assert!(!store.clear());
        assert!(store.get().is_none());
        assert!(store.session().is_none());
    }

    #[test]
    fn test_set_drops_cached_session() {
        let store = CredentialStore::new();
        let first = store.set(credential("tok1"));
        store.cache_session(&first, session("ada"));
        assert_eq!(store.session().map(|s| s.user_id.clone()), Some("ada".to_string()));

        store.set(credential("tok2"));
        assert!(store.session().is_none());
    }

    #[test]
    fn test_session_not_cached_for_stale_credential() {
        let store = CredentialStore::new();
        let old = store.set(credential("old"));
        store.set(credential("new"));

        let returned = store.cache_session(&old, session("ada"));
        assert_eq!(returned.user_id, "ada");
        assert!(store.session().is_none());
    }

    #[test]
    fn test_clear_if_current() {
        let store = CredentialStore::new();
        let old = store.set(credential("old"));
        let new = store.set(credential("new"));

        assert!(!store.clear_if_current(&old));
        assert_eq!(store.get().map(|c| c.token().to_string()), Some("new".to_string()));

        assert!(store.clear_if_current(&new));
        assert!(store.get().is_none());
        assert!(!store.clear_if_current(&new));
    }

    #[test]
    fn test_get_returns_expired_credentials() {
        let store = CredentialStore::new();
        let now = Utc::now();
        let expired = Credential::new(
            "tok".to_string(),
            TokenType::Bearer,
            now - Duration::hours(2),
            now - Duration::hours(1),
        )
        .expect("credential");
        store.set(expired);

        assert!(store.get().is_some());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let store = Arc::new(CredentialStore::new());
        store.set(credential("tok-0"));

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 1..200 {
                    if i % 10 == 0 {
                        store.clear();
                    } else {
                        store.set(credential(&format!("tok-{}", i)));
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(c) = store.get() {
                            assert!(c.token().starts_with("tok-"));
                            assert!(c.expires_at() > c.issued_at());
                        }
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for reader in readers {
            reader.join().expect("reader");
        }
        assert_eq!(store.get().map(|c| c.token().to_string()), Some("tok-199".to_string()));
    }

    #[test]
    fn test_reads_do_not_wait_for_writer() {
        let store = Arc::new(CredentialStore::new());
        store.set(credential("tok1"));

        // Hold the writer lock as a slow `set` would while talking to the vault
        let _writer = store.writer.lock().expect("writer");
        let reader = {
            let store = store.clone();
            thread::spawn(move || store.get().map(|c| c.token().to_string()))
        };
        assert_eq!(reader.join().expect("reader"), Some("tok1".to_string()));
    }

    #[test]
    fn test_generations() {
        let store = CredentialStore::new();
        assert_eq!(store.vacant_generation(), Some(0));

        let first = store.set(credential("tok1"));
        assert_eq!(store.vacant_generation(), None);
        let second = store.set(credential("tok2"));

        assert_eq!(store.revoke(&first), None);
        assert_eq!(store.revoke(&second), Some(2));
        assert_eq!(store.vacant_generation(), Some(2));
    }

    #[test]
    fn test_vault_write_through_and_restore() {
        let vault = Arc::new(MemoryVault::new());
        let store = CredentialStore::open(vault.clone());
        assert!(store.get().is_none());

        let c = credential("persisted");
        store.set(c.clone());
        assert_eq!(vault.load().expect("load"), Some(c.clone()));

        let reopened = CredentialStore::open(vault.clone());
        assert_eq!(reopened.get().as_deref(), Some(&c));

        reopened.clear();
        assert!(vault.load().expect("load").is_none());
    }

    #[test]
    fn test_open_discards_expired_credential() {
        let vault = Arc::new(MemoryVault::new());
        let now = Utc::now();
        let expired = Credential::new(
            "tok".to_string(),
            TokenType::Bearer,
            now - Duration::hours(2),
            now - Duration::hours(1),
        )
        .expect("credential");
        vault.save(&expired).expect("save");

        let store = CredentialStore::open(vault.clone());
        assert!(store.get().is_none());
        assert!(vault.load().expect("load").is_none());
    }
}
