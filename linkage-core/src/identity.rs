//! Resource Identity
//!
//! A [`ResourceKey`] is the stable identity of one logical resource. Keys
//! are minted by a [`KeyCache`], which guarantees there is exactly one key
//! per `(type, id)` pair, so two keys compare equal only when they name the
//! same resource.
//!
//! Keys are cheap to clone (a single `Arc`) and compare by their local id,
//! a process-unique counter value assigned at creation. A key minted for a
//! client-created record has no server id until [`KeyCache::assign_id`] is
//! called; such keys are reported as [`is_new`](ResourceKey::is_new).

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::payload::ResourceIdentifier;

/// Process-unique local identifier of a resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl LocalId {
    /// Generate a new unique local id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

struct KeyData {
    lid: LocalId,
    lid_str: String,
    resource_type: Arc<str>,
    id: OnceLock<Arc<str>>,
}

/// Stable identity of one resource.
#[derive(Clone)]
pub struct ResourceKey(Arc<KeyData>);

impl ResourceKey {
    fn mint(resource_type: &str, id: Option<&str>) -> Self {
        let lid = LocalId::new();
        let data = KeyData {
            lid,
            lid_str: format!("@lid:{resource_type}-{}", lid.raw()),
            resource_type: Arc::from(resource_type),
            id: OnceLock::new(),
        };
        if let Some(id) = id {
            let _ = data.id.set(Arc::from(id));
        }
        Self(Arc::new(data))
    }

    /// The local id.
    pub fn lid(&self) -> LocalId {
        self.0.lid
    }

    /// The local id in its string form, e.g. `@lid:post-12`.
    pub fn lid_str(&self) -> &str {
        &self.0.lid_str
    }

    /// The resource type.
    pub fn resource_type(&self) -> &str {
        &self.0.resource_type
    }

    /// The server id, if one has been assigned.
    pub fn id(&self) -> Option<&str> {
        self.0.id.get().map(|id| &**id)
    }

    /// True for client-created resources that have not received an id.
    pub fn is_new(&self) -> bool {
        self.0.id.get().is_none()
    }

    /// The identifier form of this key.
    pub fn to_identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type().to_string(),
            id: self.id().map(str::to_string),
            lid: Some(self.lid_str().to_string()),
        }
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.lid == other.0.lid
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.lid.hash(state);
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.lid.cmp(&other.0.lid)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.resource_type(), id),
            None => write!(f, "{}:{}", self.resource_type(), self.lid_str()),
        }
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({self})")
    }
}

/// Keys serialize as their identifier object.
impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_identifier().serialize(serializer)
    }
}

/// Outcome of assigning a server id to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdAssignment {
    /// The id was recorded on the key.
    Assigned,
    /// Another key already owns `(type, id)`. The two identities must be
    /// merged into `existing`.
    Conflict { existing: ResourceKey },
}

#[derive(Default)]
struct KeyIndex {
    by_id: HashMap<(String, String), ResourceKey>,
    by_lid: HashMap<String, ResourceKey>,
    by_type: IndexMap<String, IndexSet<ResourceKey>>,
}

impl KeyIndex {
    fn insert(&mut self, key: &ResourceKey) {
        if let Some(id) = key.id() {
            self.by_id
                .insert((key.resource_type().to_string(), id.to_string()), key.clone());
        }
        self.by_lid.insert(key.lid_str().to_string(), key.clone());
        self.by_type
            .entry(key.resource_type().to_string())
            .or_default()
            .insert(key.clone());
    }
}

/// Identity cache minting one [`ResourceKey`] per resource.
#[derive(Default)]
pub struct KeyCache {
    index: RwLock<KeyIndex>,
}

impl KeyCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the key for `(type, id)`, minting it on first use.
    pub fn get_or_create(&self, resource_type: &str, id: &str) -> ResourceKey {
        if let Some(key) = self.peek(resource_type, id) {
            return key;
        }
        let mut index = self.index.write();
        // another caller may have minted it between the locks
        if let Some(key) = index
            .by_id
            .get(&(resource_type.to_string(), id.to_string()))
        {
            return key.clone();
        }
        let key = ResourceKey::mint(resource_type, Some(id));
        index.insert(&key);
        key
    }

    /// Mint a key for a client-created resource.
    pub fn create_local(&self, resource_type: &str) -> ResourceKey {
        let key = ResourceKey::mint(resource_type, None);
        self.index.write().insert(&key);
        key
    }

    /// Look up the key for `(type, id)` without minting.
    pub fn peek(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.index
            .read()
            .by_id
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned()
    }

    /// Look up a key by its local id string.
    pub fn peek_lid(&self, lid: &str) -> Option<ResourceKey> {
        self.index.read().by_lid.get(lid).cloned()
    }

    /// Resolve an identifier to a key.
    ///
    /// Identifiers with an `id` resolve by `(type, id)`, minting when
    /// unknown. Identifiers with only a `lid` must name a known key.
    pub fn upgrade(&self, identifier: &ResourceIdentifier) -> Option<ResourceKey> {
        if let Some(lid) = identifier.lid.as_deref() {
            if let Some(key) = self.peek_lid(lid) {
                return Some(key);
            }
        }
        identifier
            .id
            .as_deref()
            .map(|id| self.get_or_create(&identifier.resource_type, id))
    }

    /// Record the server id of a client-created key.
    ///
    /// Keys that already carry an id are left untouched and reported as
    /// assigned when the id matches.
    pub fn assign_id(&self, key: &ResourceKey, id: &str) -> IdAssignment {
        let mut index = self.index.write();
        let slot = (key.resource_type().to_string(), id.to_string());
        if let Some(existing) = index.by_id.get(&slot) {
            if existing != key {
                return IdAssignment::Conflict {
                    existing: existing.clone(),
                };
            }
            return IdAssignment::Assigned;
        }
        if key.0.id.set(Arc::from(id)).is_err() {
            // already had a different id; keep the original
            return IdAssignment::Assigned;
        }
        index.by_id.insert(slot, key.clone());
        IdAssignment::Assigned
    }

    /// All keys of a type in creation order.
    pub fn keys_of(&self, resource_type: &str) -> Vec<ResourceKey> {
        self.index
            .read()
            .by_type
            .get(resource_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a key from every index.
    pub fn forget(&self, key: &ResourceKey) {
        let mut index = self.index.write();
        if let Some(id) = key.id() {
            index
                .by_id
                .remove(&(key.resource_type().to_string(), id.to_string()));
        }
        index.by_lid.remove(key.lid_str());
        if let Some(keys) = index.by_type.get_mut(key.resource_type()) {
            keys.shift_remove(key);
        }
    }
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index.read();
        f.debug_struct("KeyCache")
            .field("keys", &index.by_lid.len())
            .field("types", &index.by_type.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_unique() {
        let id1 = LocalId::new();
        let id2 = LocalId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn one_key_per_resource() {
        let cache = KeyCache::new();
        let a = cache.get_or_create("post", "1");
        let b = cache.get_or_create("post", "1");
        let c = cache.get_or_create("post", "2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "post:1");
        assert!(!a.is_new());
    }

    #[test]
    fn local_keys_are_new_until_assigned() {
        let cache = KeyCache::new();
        let key = cache.create_local("tag");
        assert!(key.is_new());
        assert!(key.id().is_none());

        assert_eq!(cache.assign_id(&key, "9"), IdAssignment::Assigned);
        assert!(!key.is_new());
        assert_eq!(cache.peek("tag", "9"), Some(key));
    }

    #[test]
    fn assigning_a_taken_id_reports_conflict() {
        let cache = KeyCache::new();
        let existing = cache.get_or_create("tag", "3");
        let local = cache.create_local("tag");

        assert_eq!(
            cache.assign_id(&local, "3"),
            IdAssignment::Conflict {
                existing: existing.clone()
            }
        );
        assert!(local.is_new());
    }

    #[test]
    fn upgrade_prefers_lid() {
        let cache = KeyCache::new();
        let local = cache.create_local("tag");
        let identifier = ResourceIdentifier {
            resource_type: "tag".into(),
            id: None,
            lid: Some(local.lid_str().to_string()),
        };
        assert_eq!(cache.upgrade(&identifier), Some(local));

        let unknown = ResourceIdentifier {
            resource_type: "tag".into(),
            id: None,
            lid: Some("@lid:missing".into()),
        };
        assert_eq!(cache.upgrade(&unknown), None);
    }

    #[test]
    fn forget_removes_from_type_listing() {
        let cache = KeyCache::new();
        let a = cache.get_or_create("post", "1");
        let b = cache.get_or_create("post", "2");
        assert_eq!(cache.keys_of("post"), vec![a.clone(), b.clone()]);

        cache.forget(&a);
        assert_eq!(cache.keys_of("post"), vec![b]);
        assert!(cache.peek("post", "1").is_none());
    }
}
