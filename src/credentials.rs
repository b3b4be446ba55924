//! Router login storage, keyed by server id. The library only reads from
//! it; where credentials actually live is up to the embedding application.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no credentials stored for server '{0}'")]
    NotFound(String),
    #[error("credential store unavailable: {0}")]
    Backend(String),
}

pub trait CredentialStore: Send + Sync {
    fn save(&self, server_id: &str, username: &str, password: &str) -> Result<(), CredentialError>;

    fn get(&self, server_id: &str) -> Result<StoredCredential, CredentialError>;

    fn delete(&self, server_id: &str) -> Result<(), CredentialError>;
}

/// In-process store; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, server_id: &str, username: &str, password: &str) -> Result<(), CredentialError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                server_id.to_string(),
                StoredCredential {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            );
        Ok(())
    }

    fn get(&self, server_id: &str) -> Result<StoredCredential, CredentialError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(server_id.to_string()))
    }

    fn delete(&self, server_id: &str) -> Result<(), CredentialError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        Ok(())
    }
}
