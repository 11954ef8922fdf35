/// `scripting/cache.rs` - memoized invocation results.
///
/// A script with a cache manager looks results up by a fingerprint of the
/// call before running its body and stores them afterwards. Eviction belongs
/// to the manager; scripts only invalidate their own entries on change.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub script_id: String,
    pub fingerprint: String,
}

/// External cache collaborator.
pub trait CacheManager: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Json>;
    fn set(&self, key: CacheKey, value: Json);
    /// Drop every entry of `script_id`.
    fn invalidate(&self, script_id: &str);
}

/// What goes into a fingerprint besides the keyword arguments.
#[derive(Debug, Default)]
pub struct KeyParts<'a> {
    /// Identifier and physical path of the calling context's parent.
    pub context: Option<(&'a str, Vec<String>)>,
    /// Identifier and remaining path segments.
    pub subpath: Option<(&'a str, Vec<String>)>,
    /// Identifier and value; only used when the policy includes it.
    pub namespace: Option<(&'a str, Json)>,
    pub args: &'a [Json],
}

/// Hex SHA-256 of the canonical JSON of the key set.
///
/// `serde_json::Map` keeps keys sorted, so equal key sets hash equally
/// regardless of keyword order.
pub fn fingerprint(kwargs: &Map<String, Json>, parts: KeyParts<'_>) -> String {
    let mut keyset = kwargs.clone();
    if let Some((name, path)) = parts.context {
        keyset.insert(name.to_string(), Json::from(path));
    }
    if let Some((name, path)) = parts.subpath {
        keyset.insert(name.to_string(), Json::from(path));
    }
    if let Some((name, value)) = parts.namespace {
        keyset.insert(name.to_string(), value);
    }
    keyset.insert("*".to_string(), Json::Array(parts.args.to_vec()));
    hex::encode(Sha256::digest(Json::Object(keyset).to_string().as_bytes()))
}

struct RamCacheInner {
    entries: HashMap<CacheKey, Json>,
    order: VecDeque<CacheKey>,
}

/// Bounded in-memory cache; the oldest insert goes first.
pub struct RamCache {
    capacity: usize,
    inner: Mutex<RamCacheInner>,
}

impl RamCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RamCacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheManager for RamCache {
    fn get(&self, key: &CacheKey) -> Option<Json> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).cloned()
    }

    fn set(&self, key: CacheKey, value: Json) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // last write wins
        if inner.entries.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.entries.remove(&old);
                }
                None => break,
            }
        }
    }

    fn invalidate(&self, script_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.retain(|k, _| k.script_id != script_id);
        inner.order.retain(|k| k.script_id != script_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(script: &str, fp: &str) -> CacheKey {
        CacheKey {
            script_id: script.to_string(),
            fingerprint: fp.to_string(),
        }
    }

    #[test]
    fn fingerprint_covers_every_part() {
        let mut kw = Map::new();
        kw.insert("a".into(), json!(1));
        let base = fingerprint(&kw, KeyParts { args: &[json!(1)], ..Default::default() });
        let same = fingerprint(&kw, KeyParts { args: &[json!(1)], ..Default::default() });
        assert_eq!(base, same);
        assert_ne!(base, fingerprint(&kw, KeyParts { args: &[json!(2)], ..Default::default() }));
        let with_context = fingerprint(
            &kw,
            KeyParts {
                context: Some(("context", vec!["site".into()])),
                args: &[json!(1)],
                ..Default::default()
            },
        );
        assert_ne!(base, with_context);
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn ram_cache_evicts_oldest() {
        let cache = RamCache::new(2);
        cache.set(key("s", "1"), json!(1));
        cache.set(key("s", "2"), json!(2));
        cache.set(key("s", "1"), json!(10));
        cache.set(key("s", "3"), json!(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("s", "1")), None);
        assert_eq!(cache.get(&key("s", "3")), Some(json!(3)));
    }

    #[test]
    fn invalidate_is_per_script() {
        let cache = RamCache::new(10);
        cache.set(key("a", "1"), json!(1));
        cache.set(key("b", "1"), json!(2));
        cache.invalidate("a");
        assert_eq!(cache.get(&key("a", "1")), None);
        assert_eq!(cache.get(&key("b", "1")), Some(json!(2)));
        assert!(!cache.is_empty());
    }
}
