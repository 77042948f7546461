//! Profile Store
//!
//! Ordered collection of profiles. Insertion order is display order, and
//! every profile occupies exactly one row: importing a profile that matches
//! an existing one (same endpoint, same source link or same identifier)
//! replaces that row in place instead of appending a duplicate.

use crate::persist::write_atomic;
use crate::profile::{ServerProfile, ValidationError};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

/// What a store mutation did, for row-level change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// A new row was appended
    Inserted(usize),
    /// An existing row was overwritten in place
    Updated(usize),
    /// A row was removed
    Removed(usize),
    /// The whole store was replaced
    Reset,
}

/// Profile store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid profile: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Row {0} out of range")]
    OutOfRange(usize),

    #[error("Profile store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Profile store is not a JSON array: {0}")]
    Format(String),
}

/// Ordered, identity-deduplicated profile collection
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Vec<ServerProfile>,
}

impl ProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// All profiles in display order
    pub fn profiles(&self) -> &[ServerProfile] {
        &self.profiles
    }

    pub fn get(&self, row: usize) -> Option<&ServerProfile> {
        self.profiles.get(row)
    }

    /// Add or merge a profile
    ///
    /// Invalid profiles are rejected without touching the store. A profile
    /// matching an existing row overwrites it and keeps that row's identifier.
    pub fn add(&mut self, mut profile: ServerProfile) -> Result<StoreChange, StoreError> {
        profile.validate()?;
        profile.ensure_identifier();

        match self.identity_row(&profile) {
            Some(row) => {
                let existing = &mut self.profiles[row];
                profile.id = existing.id.clone();
                profile.ping_in_progress = existing.ping_in_progress;
                profile.last_ping_ms = existing.last_ping_ms;
                debug!("Profile {} re-imported into row {}", profile.display_name(), row);
                *existing = profile;
                Ok(StoreChange::Updated(row))
            }
            None => {
                debug!("Profile {} appended", profile.display_name());
                self.profiles.push(profile);
                Ok(StoreChange::Inserted(self.profiles.len() - 1))
            }
        }
    }

    /// Remove the profile at `row`
    pub fn remove(&mut self, row: usize) -> Result<ServerProfile, StoreError> {
        if row >= self.profiles.len() {
            return Err(StoreError::OutOfRange(row));
        }
        Ok(self.profiles.remove(row))
    }

    /// Drop every profile
    pub fn clear(&mut self) {
        self.profiles.clear();
    }

    pub fn find_by_identifier(&self, id: &str) -> Option<&ServerProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.profiles.iter().position(|p| p.id == id)
    }

    /// Mark a latency probe as running for `row`
    pub fn set_ping_in_progress(&mut self, row: usize, in_progress: bool) -> bool {
        match self.profiles.get_mut(row) {
            Some(p) => {
                p.ping_in_progress = in_progress;
                true
            }
            None => false,
        }
    }

    /// Record a probe result for the profile with `id`
    ///
    /// Looked up by identifier since rows may have moved while the probe ran.
    pub fn record_ping(&mut self, id: &str, ms: i64) -> Option<usize> {
        let row = self.index_of(id)?;
        let p = &mut self.profiles[row];
        p.ping_in_progress = false;
        p.last_ping_ms = ms;
        Some(row)
    }

    fn identity_row(&self, profile: &ServerProfile) -> Option<usize> {
        self.profiles
            .iter()
            .position(|existing| existing.matches_identity(profile))
    }

    /// Load a store from a JSON array file
    ///
    /// Entries that fail to decode or validate are dropped; entries without
    /// an identifier get a fresh one. A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path)?;
        let store = Self::from_json(&content)?;
        info!("Loaded {} profiles from {}", store.len(), path.display());
        Ok(store)
    }

    /// Decode a store from JSON text
    pub fn from_json(content: &str) -> Result<Self, StoreError> {
        let entries: Vec<Value> =
            serde_json::from_str(content).map_err(|e| StoreError::Format(e.to_string()))?;

        let mut store = Self::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let profile = match serde_json::from_value::<ServerProfile>(entry) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping profile #{}: {}", index, e);
                    continue;
                }
            };
            if let Err(e) = store.add(profile) {
                warn!("Skipping profile #{}: {}", index, e);
            }
        }
        Ok(store)
    }

    /// Encode the store as a pretty JSON array
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(&self.profiles).map_err(|e| StoreError::Format(e.to_string()))
    }

    /// Persist the store atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let json = self.to_json()?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }
}

/// Re-resolve a selection after `removed` was deleted
///
/// Keeps pointing at the same profile when it survived, otherwise clamps to
/// the nearest valid row; `None` when the store is now empty.
pub fn reselect_after_removal(
    selected: Option<usize>,
    removed: usize,
    len_after: usize,
) -> Option<usize> {
    if len_after == 0 {
        return None;
    }
    let selected = selected?;
    let row = if selected > removed { selected - 1 } else { selected };
    Some(row.min(len_after - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::parse;
    use crate::profile::Protocol;

    const LINK: &str = "vless://user-1@host.example:443?type=ws&security=tls&path=abc#First";

    #[test]
    fn test_add_and_merge_in_place() {
        let mut store = ProfileStore::new();
        assert_eq!(
            store.add(parse("vless://other@a.example:1#A").unwrap()).unwrap(),
            StoreChange::Inserted(0)
        );

        let first = parse(LINK).unwrap();
        let first_id = first.id.clone();
        assert_eq!(store.add(first).unwrap(), StoreChange::Inserted(1));
        store.add(parse("vless://third@c.example:3#C").unwrap()).unwrap();

        let second = parse("vless://USER-1@HOST.example:443?type=grpc&serviceName=svc#Second").unwrap();
        assert_eq!(store.add(second).unwrap(), StoreChange::Updated(1));

        assert_eq!(store.len(), 3);
        let merged = store.get(1).unwrap();
        assert_eq!(merged.name, "Second");
        assert_eq!(merged.network, "grpc");
        assert_eq!(merged.id, first_id);
    }

    #[test]
    fn test_same_link_twice_yields_one_row() {
        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();
        store.add(parse(LINK).unwrap()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_rejected_without_mutation() {
        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();

        let mut bad = ServerProfile::new(Protocol::Vmess, "", 443, "id");
        bad.name = "bad".into();
        assert!(matches!(store.add(bad), Err(StoreError::Invalid(_))));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0).unwrap().name, "First");
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();
        let id = store.get(0).unwrap().id.clone();

        assert_eq!(store.index_of(&id), Some(0));
        assert!(store.find_by_identifier(&id).is_some());
        assert!(matches!(store.remove(5), Err(StoreError::OutOfRange(5))));

        store.remove(0).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.index_of(&id), None);
    }

    #[test]
    fn test_record_ping() {
        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();
        let id = store.get(0).unwrap().id.clone();

        assert!(store.set_ping_in_progress(0, true));
        assert!(store.get(0).unwrap().ping_in_progress);

        assert_eq!(store.record_ping(&id, 42), Some(0));
        let p = store.get(0).unwrap();
        assert!(!p.ping_in_progress);
        assert_eq!(p.last_ping_ms, 42);

        assert_eq!(store.record_ping("missing", 1), None);
    }

    #[test]
    fn test_merge_keeps_liveness() {
        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();
        let id = store.get(0).unwrap().id.clone();
        store.record_ping(&id, 42);
        store.set_ping_in_progress(0, true);

        assert_eq!(store.add(parse(LINK).unwrap()).unwrap(), StoreChange::Updated(0));
        let p = store.get(0).unwrap();
        assert_eq!(p.last_ping_ms, 42);
        assert!(p.ping_in_progress);
    }

    #[test]
    fn test_reselect_after_removal() {
        assert_eq!(reselect_after_removal(Some(2), 0, 3), Some(1));
        assert_eq!(reselect_after_removal(Some(0), 2, 3), Some(0));
        assert_eq!(reselect_after_removal(Some(3), 3, 3), Some(2));
        assert_eq!(reselect_after_removal(Some(0), 0, 0), None);
        assert_eq!(reselect_after_removal(None, 0, 2), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let mut store = ProfileStore::new();
        store.add(parse(LINK).unwrap()).unwrap();
        store.add(parse("vless://x@y.example:2#Y").unwrap()).unwrap();
        store.save(&path).unwrap();

        let loaded = ProfileStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(0).unwrap().id, store.get(0).unwrap().id);
        assert_eq!(loaded.get(0).unwrap().path, "/abc");
        assert_eq!(loaded.get(1).unwrap().name, "Y");
    }

    #[test]
    fn test_query_keys_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let mut store = ProfileStore::new();
        store
            .add(parse("vless://u@h.example:443?type=tcp&name=x&address=evil#N").unwrap())
            .unwrap();
        store.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("\"name\"").count(), 1);
        assert_eq!(text.matches("\"address\"").count(), 1);

        let loaded = ProfileStore::load(&path).unwrap();
        let p = loaded.get(0).unwrap();
        assert_eq!(p.name, "N");
        assert_eq!(p.address, "h.example");
        assert_eq!(p.extra.get("x-name"), Some(&Value::from("x")));
        assert_eq!(p, store.get(0).unwrap());
    }

    #[test]
    fn test_load_filters_and_regenerates() {
        let json = r#"[
            {"protocol":"vless","address":"a.example","port":443,"userId":"u1"},
            {"protocol":"vless","address":"","port":443,"userId":"u2"},
            {"protocol":"trojan","address":"b.example","port":443,"userId":"u3"},
            {"protocol":"vmess","address":"c.example","port":80,"userId":"u4","id":"keep-me"}
        ]"#;
        let store = ProfileStore::from_json(json).unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.get(0).unwrap().id.is_empty());
        assert_eq!(store.get(1).unwrap().id, "keep-me");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("none.json")).unwrap();
        assert!(store.is_empty());
    }
}
