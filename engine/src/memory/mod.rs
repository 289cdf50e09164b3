//! Memory store
//!
//! Key-value memory with four lifetimes:
//!
//! - `Session`: discarded when the session ends.
//! - `Operational`: learned failure/fix pairs, kept across sessions.
//! - `Preference`: user preferences, kept across sessions.
//! - `OrganizationalPolicy`: read-only to the controller; only an
//!   administrator writes these, and nothing expires them.
//!
//! Entries may carry a TTL; expired entries read as absent. The store
//! persists as a single JSON file under the data directory.

use chrono::{DateTime, Duration, Utc};
use sdk::errors::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Lifetime class of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Session,
    Operational,
    Preference,
    OrganizationalPolicy,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Session => "session",
            MemoryKind::Operational => "operational",
            MemoryKind::Preference => "preference",
            MemoryKind::OrganizationalPolicy => "organizational_policy",
        }
    }
}

/// One stored memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub kind: MemoryKind,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The memory store
pub struct MemoryStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

fn storage_key(kind: MemoryKind, key: &str) -> String {
    format!("{}:{}", kind.as_str(), key)
}

impl MemoryStore {
    /// In-memory store without persistence
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store backed by a JSON file, loading existing entries if present
    pub fn open(path: &Path) -> Result<Self, ControllerError> {
        let entries = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let list: Vec<MemoryEntry> = serde_json::from_str(&text)
                .map_err(|e| ControllerError::Config(format!("corrupt memory store: {e}")))?;
            list.into_iter()
                .map(|e| (storage_key(e.kind, &e.key), e))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        })
    }

    /// Read a value. Expired entries read as absent.
    pub fn get(&self, kind: MemoryKind, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&storage_key(kind, key))
            .filter(|e| !e.is_expired(Utc::now()))
            .map(|e| e.value.clone())
    }

    /// Write a value. Organizational policy is read-only through this path.
    pub fn put(&self, kind: MemoryKind, key: &str, value: &str) -> Result<(), ControllerError> {
        self.put_entry(kind, key, value, None, false)
    }

    /// Write a value that expires after `ttl`
    pub fn put_with_ttl(
        &self,
        kind: MemoryKind,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ControllerError> {
        self.put_entry(kind, key, value, Some(Utc::now() + ttl), false)
    }

    /// Administrative write; the only path that may set organizational policy
    pub fn admin_put(&self, kind: MemoryKind, key: &str, value: &str) -> Result<(), ControllerError> {
        self.put_entry(kind, key, value, None, true)
    }

    fn put_entry(
        &self,
        kind: MemoryKind,
        key: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
        admin: bool,
    ) -> Result<(), ControllerError> {
        if kind == MemoryKind::OrganizationalPolicy && !admin {
            return Err(ControllerError::PermissionDenied {
                capability: "memory".to_string(),
                permission: "policy:write".to_string(),
            });
        }

        let entry = MemoryEntry {
            kind,
            key: key.to_string(),
            value: value.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(storage_key(kind, key), entry);
        }
        self.save()
    }

    /// Remember a failure signature seen during execution
    pub fn record_failure(&self, signature: &str) -> Result<(), ControllerError> {
        let count = self
            .get(MemoryKind::Operational, &format!("failure:{signature}"))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        self.put(
            MemoryKind::Operational,
            &format!("failure:{signature}"),
            &(count + 1).to_string(),
        )
    }

    /// Remember that a fix resolved a failure signature
    pub fn record_known_fix(&self, signature: &str, fix: &str) -> Result<(), ControllerError> {
        self.put(MemoryKind::Operational, &format!("fix:{signature}"), fix)
    }

    /// Look up a remembered fix for a failure signature
    pub fn known_fix(&self, signature: &str) -> Option<String> {
        self.get(MemoryKind::Operational, &format!("fix:{signature}"))
    }

    /// Drop all session-scoped entries. Called at session end.
    pub fn end_session(&self) -> Result<(), ControllerError> {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.retain(|_, e| e.kind != MemoryKind::Session);
        }
        self.save()
    }

    fn save(&self) -> Result<(), ControllerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<MemoryEntry> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let mut list: Vec<MemoryEntry> = entries.values().cloned().collect();
            list.sort_by(|a, b| storage_key(a.kind, &a.key).cmp(&storage_key(b.kind, &b.key)));
            list
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&list)
            .map_err(|e| ControllerError::Config(format!("memory serialization failed: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
