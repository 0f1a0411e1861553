//! Permissions attached to an authenticated tunnel connection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extension map produced by key authentication and carried by the
/// authenticated connection for the rest of its lifetime.
///
/// Keys are the `EXT_*` constants at the crate root; host-certificate
/// sessions additionally carry the authority domain of the signing CA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    extensions: BTreeMap<String, String>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extensions
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CERT_TYPE_HOST, EXT_AUTHORITY, EXT_CERT_TYPE};

    #[test]
    fn test_permissions_lookup() {
        let perms = Permissions::new()
            .with_extension(EXT_CERT_TYPE, CERT_TYPE_HOST)
            .with_extension(EXT_AUTHORITY, "east.example.com");

        assert_eq!(perms.get(EXT_CERT_TYPE), Some(CERT_TYPE_HOST));
        assert_eq!(perms.get(EXT_AUTHORITY), Some("east.example.com"));
        assert_eq!(perms.get("missing"), None);
    }
}
