//! Work keys and the store key layout derived from them

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PaceError;

/// Longest accepted work key, in bytes
pub const MAX_WORK_KEY_LEN: usize = 256;

/// A validated caller-supplied identifier (e.g. a user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkKey(String);

impl WorkKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, PaceError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(PaceError::Validation("work key is empty".to_string()));
        }
        if raw.len() > MAX_WORK_KEY_LEN {
            return Err(PaceError::Validation(format!(
                "work key is {} bytes, maximum is {}",
                raw.len(),
                MAX_WORK_KEY_LEN
            )));
        }
        if let Some(c) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(PaceError::Validation(format!(
                "work key contains forbidden character {:?}",
                c
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkKey {
    type Error = PaceError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<WorkKey> for String {
    fn from(key: WorkKey) -> Self {
        key.0
    }
}

/// Namespaced store keys for every per-key entity
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAMESPACE)
    }
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Window Counter for one fixed window
    pub fn window_counter(&self, key: &WorkKey, window_id: i64) -> String {
        format!("{}:{}:count:{}", self.namespace, key, window_id)
    }

    /// Rate-Exceeded Flag
    pub fn rate_flag(&self, key: &WorkKey) -> String {
        format!("{}:{}:limited", self.namespace, key)
    }

    /// Execution Lock
    pub fn lock(&self, key: &WorkKey) -> String {
        format!("{}:{}:lock", self.namespace, key)
    }

    /// Last-Execution Timestamp
    pub fn last_execution(&self, key: &WorkKey) -> String {
        format!("{}:{}:last", self.namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_bad_keys() {
        assert!(WorkKey::parse("").is_err());
        assert!(WorkKey::parse("has space").is_err());
        assert!(WorkKey::parse("tab\there").is_err());
        assert!(WorkKey::parse("nul\0").is_err());
        assert!(WorkKey::parse("x".repeat(MAX_WORK_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_parse_accepts_opaque_keys() {
        assert_eq!(WorkKey::parse("123").unwrap().as_str(), "123");
        assert!(WorkKey::parse("user:42/eu-west").is_ok());
        assert!(WorkKey::parse("ключ").is_ok());
        assert!(WorkKey::parse("x".repeat(MAX_WORK_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("kp");
        let key = WorkKey::parse("123").unwrap();
        assert_eq!(keys.window_counter(&key, 29_000_000), "kp:123:count:29000000");
        assert_eq!(keys.rate_flag(&key), "kp:123:limited");
        assert_eq!(keys.lock(&key), "kp:123:lock");
        assert_eq!(keys.last_execution(&key), "kp:123:last");
    }

    #[test]
    fn test_serde_validates() {
        let key: WorkKey = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(key.as_str(), "abc");
        assert!(serde_json::from_str::<WorkKey>("\"\"").is_err());
    }
}
