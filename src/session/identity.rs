// src/session/identity.rs
//! Identity store
//!
//! Resolves the long-lived anonymous identity from the durable scope and
//! reads/writes the session record in the tab scope. Storage failures never
//! reach callers: an unreadable anonymous id falls back to an ephemeral one,
//! an unreadable session record reads as absent.

use crate::session::storage::KeyValueStore;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use ulid::Ulid;

/// Visitor identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub anonymous_id: String,
    pub user_id: Option<String>,
}

/// Persisted session record (tab scope)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,

    /// Epoch milliseconds
    pub started_at: i64,

    /// Epoch milliseconds
    pub last_activity_at: i64,

    /// Set by the last unload-class signal; cleared again on resume
    #[serde(default)]
    pub ended: bool,

    /// Sticky replay sampling decision
    #[serde(default = "default_sampled")]
    pub replay_sampled: bool,
}

fn default_sampled() -> bool {
    true
}

/// Identity and session persistence over two storage scopes
pub struct IdentityStore {
    durable: Arc<dyn KeyValueStore>,
    tab: Arc<dyn KeyValueStore>,
    anonymous_key: String,
    user_key: String,
    session_key: String,
    anonymous_id: Mutex<Option<String>>,
}

impl IdentityStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, tab: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        Self {
            durable,
            tab,
            anonymous_key: format!("{}_anonymous_id", prefix),
            user_key: format!("{}_user_id", prefix),
            session_key: format!("{}_session", prefix),
            anonymous_id: Mutex::new(None),
        }
    }

    /// Resolve the anonymous id, minting and persisting one on first use
    pub fn anonymous_id(&self) -> String {
        let mut cached = self.anonymous_id.lock();
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }

        let id = match self.durable.get(&self.anonymous_key) {
            Ok(Some(existing)) if !existing.is_empty() => existing,
            Ok(_) => {
                let minted = Ulid::new().to_string();
                if let Err(e) = self.durable.set(&self.anonymous_key, &minted) {
                    warn!("Failed to persist anonymous id: {}", e);
                }
                debug!("Minted anonymous id {}", minted);
                minted
            }
            Err(e) => {
                warn!("Durable store unreadable, using ephemeral id: {}", e);
                Ulid::new().to_string()
            }
        };

        *cached = Some(id.clone());
        id
    }

    pub fn user_id(&self) -> Option<String> {
        match self.durable.get(&self.user_key) {
            Ok(user_id) => user_id.filter(|id| !id.is_empty()),
            Err(e) => {
                warn!("Failed to read user id: {}", e);
                None
            }
        }
    }

    /// Set or clear the identified user. The anonymous id is untouched.
    pub fn set_user_id(&self, user_id: Option<&str>) -> Result<()> {
        match user_id {
            Some(id) => self.durable.set(&self.user_key, id),
            None => self.durable.remove(&self.user_key),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            anonymous_id: self.anonymous_id(),
            user_id: self.user_id(),
        }
    }

    /// Read the tab-scoped session record, if any
    pub fn load_session(&self) -> Option<SessionRecord> {
        let raw = match self.tab.get(&self.session_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read session record: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring malformed session record: {}", e);
                None
            }
        }
    }

    pub fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.tab.set(&self.session_key, &raw)
    }
}
