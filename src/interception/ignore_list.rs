// src/interception/ignore_list.rs
//! Host patterns excluded from network reporting
//!
//! A pattern is either an exact host (`api.example.com`) or a wildcard
//! (`*.example.com`) that matches the bare domain and any subdomain.

use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{debug, info};

/// Ignore list
#[derive(Debug, Default)]
pub struct IgnoreList {
    exact: RwLock<HashSet<String>>,
    suffixes: RwLock<Vec<String>>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured patterns
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = Self::new();
        for pattern in patterns {
            list.add(pattern.as_ref());
        }
        list
    }

    /// Add a pattern. Blank patterns are ignored.
    pub fn add(&self, pattern: &str) {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return;
        }

        info!("Ignoring network reports for {}", pattern);

        match pattern.strip_prefix("*.") {
            Some(suffix) => self.suffixes.write().push(suffix.to_string()),
            None => {
                self.exact.write().insert(pattern);
            }
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        if self.exact.read().contains(&host) {
            debug!("Exact ignore match for {}", host);
            return true;
        }

        self.suffixes.read().iter().any(|suffix| {
            host == *suffix
                || host
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }

    pub fn len(&self) -> usize {
        self.exact.read().len() + self.suffixes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
