//! Common types used throughout the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Tag naming the kind of domain entity a mutation belongs to
/// (e.g. `sale`, `transfer`, `product`).
///
/// Tags are trimmed and lowercased so `"Sale"` and `"sale "` address the
/// same outbox key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type tag.
    ///
    /// # Errors
    /// - Returns error if the tag is empty after trimming
    pub fn new(tag: impl AsRef<str>) -> crate::Result<Self> {
        let tag = tag.as_ref().trim().to_ascii_lowercase();
        if tag.is_empty() {
            return Err(crate::Error::Validation(
                "Entity type cannot be empty".to_string(),
            ));
        }
        Ok(Self(tag))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// Identifier of a branch (store) in the retail network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub i64);

impl StoreId {
    /// Extract the store reference embedded in a payload document.
    ///
    /// Only a top-level `store_id` field counts; it may be an integer or a
    /// numeric string. Anything else means the payload is global.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        match payload.get("store_id")? {
            serde_json::Value::Number(n) => n.as_i64().map(StoreId),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok().map(StoreId),
            _ => None,
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret string that zeroizes on drop and never prints its value.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret. Callers must not store the returned slice.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_normalized() {
        let tag = EntityType::new("  Sale ").unwrap();
        assert_eq!(tag.as_str(), "sale");
        assert_eq!(tag, "sale".parse().unwrap());
    }

    #[test]
    fn test_entity_type_empty_fails() {
        assert!(EntityType::new("   ").is_err());
    }

    #[test]
    fn test_store_reference_from_payload() {
        assert_eq!(StoreId::from_payload(&json!({"store_id": 42})), Some(StoreId(42)));
        assert_eq!(StoreId::from_payload(&json!({"store_id": "99"})), Some(StoreId(99)));
        assert_eq!(StoreId::from_payload(&json!({"store_id": null})), None);
        assert_eq!(StoreId::from_payload(&json!({"qty": 5})), None);
        assert_eq!(StoreId::from_payload(&json!([1, 2, 3])), None);
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(secret.expose(), "hunter2");
    }
}
