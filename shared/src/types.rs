//! Core shared types and identifiers

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::errors::{SharedError, SharedResult};

/// Identity of one orchestrated server instance within a fixture
///
/// The name doubles as a directory component, so it is restricted to
/// characters that are safe in paths on every platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(name: impl Into<String>) -> SharedResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(SharedError::InvalidInstanceName { input: name });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_instance_id_accepts_path_safe_names() {
        for name in ["a", "shard-1", "root_shard", "v1.2"] {
            assert!(InstanceId::new(name).is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn test_instance_id_rejects_unsafe_names() {
        for name in ["", ".", "..", "a/b", "a:b", "with space"] {
            assert!(InstanceId::new(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_instance_id_borrows_as_str_for_map_lookup() {
        let mut map = HashMap::new();
        map.insert(InstanceId::new("a").unwrap(), 1);
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(InstanceId::new("a").unwrap().to_string(), "a");
    }
}
