use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;

use super::Credential;

/// Keychain account under which the session credential is stored
const ACCOUNT_NAME: &str = "session";

/// Durable backing for the credential store.
pub trait CredentialVault: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    /// Remove the stored credential. Erasing an empty vault is not an error.
    fn erase(&self) -> Result<()>;
}

/// Stores the credential in the OS keychain, out of reach of other
/// processes in the user's session.
#[derive(Debug, Clone)]
pub struct KeyringVault {
    service: String,
    account: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: ACCOUNT_NAME.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, &self.account).context("Failed to create keyring entry")
    }
}

impl CredentialVault for KeyringVault {
    fn load(&self) -> Result<Option<Credential>> {
        match self.entry()?.get_password() {
            Ok(json) => {
                let credential = serde_json::from_str(&json)
                    .context("Failed to parse stored credential")?;
                Ok(Some(credential))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read credential from keychain"),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        self.entry()?
            .set_password(&json)
            .context("Failed to store credential in keychain")
    }

    fn erase(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

/// In-process vault. Keeps the serialized form so it behaves like the keychain.
#[derive(Debug, Default)]
pub struct MemoryVault {
    slot: Mutex<Option<String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialVault for MemoryVault {
    fn load(&self) -> Result<Option<Credential>> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_deref() {
            Some(json) => Ok(Some(
                serde_json::from_str(json).context("Failed to parse stored credential")?,
            )),
            None => Ok(None),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenType;
    use chrono::{Duration, Utc};

    #[test]
    fn test_memory_vault_round_trip() {
        let vault = MemoryVault::new();
        assert!(vault.load().expect("load").is_none());

        let now = Utc::now();
        let credential =
            Credential::new("tok1".to_string(), TokenType::Bearer, now, now + Duration::hours(1))
                .expect("credential");
        vault.save(&credential).expect("save");
        assert_eq!(vault.load().expect("load"), Some(credential));

        vault.erase().expect("erase");
        vault.erase().expect("erase again");
        assert!(vault.load().expect("load").is_none());
    }

    #[test]
    fn test_memory_vault_rejects_corrupt_entry() {
        let vault = MemoryVault::new();
        *vault.slot.lock().expect("lock") = Some("{not json".to_string());
        assert!(vault.load().is_err());
    }

    /// Each call opens a fresh keyring entry, so this only passes when a
    /// platform backend is compiled in; the mock store forgets between entries.
    #[test]
    #[ignore = "needs an unlocked OS keychain"]
    fn test_keyring_vault_persists_between_entries() {
        let service = format!("tenantdash-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let vault = KeyringVault::new(service.clone());

        let now = Utc::now();
        let credential =
            Credential::new("tok1".to_string(), TokenType::Bearer, now, now + Duration::hours(1))
                .expect("credential");
        vault.save(&credential).expect("save");

        let reopened = KeyringVault::new(service);
        assert_eq!(reopened.load().expect("load"), Some(credential));

        reopened.erase().expect("erase");
        assert!(vault.load().expect("load").is_none());
    }
}
