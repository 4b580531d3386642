//! ID generation and name/prefix resolution
//!
//! Generates 64-hex container/network IDs and resolves a caller-supplied
//! reference (full ID, short prefix, or name) back to the canonical ID.
//! Rebuilt in memory from the StateStore on every startup; never itself
//! persisted.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::RngCore;
use thiserror::Error;

pub const MIN_PREFIX_LEN: usize = 4;
pub const SHORT_ID_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no such object: {0}")]
    NotFound(String),

    #[error("ambiguous ID prefix: {0}")]
    AmbiguousPrefix(String),

    #[error("reference too short to resolve: {0}")]
    TooShort(String),
}

/// Generates 64-hex random IDs and resolves id/name references.
///
/// One instance per object namespace (containers, networks) — the
/// daemon holds separate registries so a container and a network can
/// legally share a name.
pub struct IDRegistry {
    inner: RwLock<HashMap<String, String>>,
}

impl IDRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    /// Generate a fresh, random 64-hex ID. Does not register it; callers
    /// register once the owning record is known to be persistable.
    pub fn generate_id() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Register a name -> id binding, replacing any prior binding for
    /// that name (the owning manager is responsible for rejecting name
    /// conflicts before calling this).
    pub fn register(&self, id: &str, name: &str) {
        self.inner.write().insert(name.to_string(), id.to_string());
    }

    pub fn unregister_name(&self, name: &str) {
        self.inner.write().remove(name);
    }

    /// Rebuild the registry from a full set of (id, name) pairs, as read
    /// from the StateStore on startup. Replaces any existing bindings.
    pub fn rebuild<I: IntoIterator<Item = (String, String)>>(&self, records: I) {
        let mut map = self.inner.write();
        map.clear();
        for (id, name) in records {
            map.insert(name, id);
        }
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Resolve `reference` against the supplied set of known full IDs.
    ///
    /// Order: exact ID match, then exact name match, then unique hex
    /// prefix of at least [`MIN_PREFIX_LEN`] characters.
    pub fn resolve<'a, I>(&self, reference: &str, known_ids: I) -> Result<String, ResolveError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: Vec<&str> = known_ids.into_iter().collect();

        if known.contains(&reference) {
            return Ok(reference.to_string());
        }

        if let Some(id) = self.inner.read().get(reference) {
            return Ok(id.clone());
        }

        if reference.len() < MIN_PREFIX_LEN {
            return Err(ResolveError::TooShort(reference.to_string()));
        }

        let lower = reference.to_ascii_lowercase();
        let matches: Vec<&&str> = known.iter().filter(|id| id.starts_with(&lower)).collect();

        match matches.len() {
            0 => Err(ResolveError::NotFound(reference.to_string())),
            1 => Ok(matches[0].to_string()),
            _ => Err(ResolveError::AmbiguousPrefix(reference.to_string())),
        }
    }

    pub fn short_id(id: &str) -> &str {
        &id[..SHORT_ID_LEN.min(id.len())]
    }
}

impl Default for IDRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_64_hex_ids() {
        let id = IDRegistry::generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn resolves_exact_id() {
        let reg = IDRegistry::new();
        let id = "a".repeat(64);
        assert_eq!(reg.resolve(&id, vec![id.as_str()]).unwrap(), id);
    }

    #[test]
    fn resolves_exact_name() {
        let reg = IDRegistry::new();
        let id = "b".repeat(64);
        reg.register(&id, "web");
        assert_eq!(reg.resolve("web", vec![id.as_str()]).unwrap(), id);
    }

    #[test]
    fn rejects_short_prefix() {
        let reg = IDRegistry::new();
        let id = "c".repeat(64);
        let err = reg.resolve("c12", vec![id.as_str()]).unwrap_err();
        assert_eq!(err, ResolveError::TooShort("c12".to_string()));
    }

    #[test]
    fn resolves_unique_four_char_prefix() {
        let reg = IDRegistry::new();
        let a = "aaaa".to_string() + &"1".repeat(60);
        let b = "bbbb".to_string() + &"2".repeat(60);
        let resolved = reg.resolve("aaaa", vec![a.as_str(), b.as_str()]).unwrap();
        assert_eq!(resolved, a);
    }

    #[test]
    fn ambiguous_prefix_errors() {
        let reg = IDRegistry::new();
        let a = "aaaa1111".to_string() + &"1".repeat(56);
        let b = "aaaa2222".to_string() + &"2".repeat(56);
        let err = reg.resolve("aaaa", vec![a.as_str(), b.as_str()]).unwrap_err();
        assert_eq!(err, ResolveError::AmbiguousPrefix("aaaa".to_string()));
    }

    #[test]
    fn short_id_truncates_to_12() {
        let id = "f".repeat(64);
        assert_eq!(IDRegistry::short_id(&id).len(), 12);
    }
}
