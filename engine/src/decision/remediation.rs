//! Remediation catalog
//!
//! Known failure signatures and the fix to apply before retrying. Lookup is
//! case-insensitive substring matching on the failure message; the first
//! matching entry wins, so more specific patterns go first.

use serde::Serialize;

/// A cataloged fix for a recognized failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    /// Signature matched against failure messages
    pub pattern: String,
    /// What to do before retrying
    pub fix: String,
}

/// Catalog of known failure signatures
#[derive(Debug, Clone)]
pub struct RemediationCatalog {
    entries: Vec<Remediation>,
}

impl RemediationCatalog {
    /// Catalog with the stock failure signatures
    pub fn with_defaults() -> Self {
        let entry = |pattern: &str, fix: &str| Remediation {
            pattern: pattern.to_string(),
            fix: fix.to_string(),
        };
        Self {
            entries: vec![
                entry("connection refused", "wait for the service and reconnect"),
                entry("rate limit", "back off before reissuing the request"),
                entry("timeout", "retry with a longer deadline"),
                entry("out of memory", "reduce batch size and retry"),
                entry("missing dependency", "install the named dependency and retry"),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, pattern: impl Into<String>, fix: impl Into<String>) {
        self.entries.push(Remediation {
            pattern: pattern.into(),
            fix: fix.into(),
        });
    }

    /// First entry whose pattern appears in the message, case-insensitive
    pub fn lookup(&self, message: &str) -> Option<&Remediation> {
        let message = message.to_lowercase();
        self.entries
            .iter()
            .find(|e| message.contains(&e.pattern.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = RemediationCatalog::with_defaults();
        let hit = catalog.lookup("ERROR: Connection Refused by host").unwrap();
        assert_eq!(hit.pattern, "connection refused");
    }

    #[test]
    fn test_lookup_misses_unknown_failure() {
        let catalog = RemediationCatalog::with_defaults();
        assert!(catalog.lookup("segmentation fault in parser").is_none());
    }

    #[test]
    fn test_custom_entries_extend_defaults() {
        let mut catalog = RemediationCatalog::with_defaults();
        catalog.add("stale lock", "remove the lock file and retry");
        let hit = catalog.lookup("aborting: stale lock detected").unwrap();
        assert_eq!(hit.fix, "remove the lock file and retry");
    }
}
