//! Per-object view onto the store.
//!
//! All chunks and the metadata record of one origin object live under a
//! shared prefix derived from its URL, so a namespace is nothing more than
//! a prefix binder: it joins keys and delegates to the store. It keeps no
//! state of its own and is cheap to clone into segment readers.

use std::sync::Arc;

use tracing::warn;

use crate::store::{Store, StoreError, DATA_BUCKET};
use crate::util::url_namespace;

#[derive(Clone)]
pub struct CacheNamespace {
    store: Arc<Store>,
    prefix: String,
}

impl CacheNamespace {
    pub fn new(store: Arc<Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Bind the namespace for an origin URL. Distinct URLs never collide:
    /// the prefix is a 128-bit digest of the full URL.
    pub fn for_url(store: Arc<Store>, url: &str) -> Self {
        let prefix = url_namespace(url);
        Self::new(store, prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub fn set(&self, key: &str, value: &[u8], ttl: i64) -> Result<(), StoreError> {
        self.store.ttl_set(DATA_BUCKET, &self.join(key), value, ttl)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(DATA_BUCKET, &self.join(key))
    }

    /// Existence check that also refreshes the key's TTL on a hit. Store
    /// failures are reported as a miss: the caller will fall back to the
    /// origin, which is always a valid answer.
    pub fn has(&self, key: &str, ttl: i64) -> bool {
        match self.store.touch(DATA_BUCKET, &self.join(key), ttl) {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, key, "cache existence check failed");
                false
            }
        }
    }
}
