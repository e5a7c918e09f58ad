//! Object metadata: the total length learned from the probe plus the
//! whitelisted upstream headers, stored under `<ns>:meta` next to the
//! chunks it describes. Metadata only exists for objects larger than one
//! chunk; smaller objects are never promoted to the chunked cache.

use std::collections::BTreeMap;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheNamespace;
use crate::store::StoreError;

/// Key of the metadata record inside a namespace.
pub const META_KEY: &str = "meta";

/// Upstream headers worth keeping for replay on cached responses.
const KEPT_HEADERS: [&str; 2] = ["Content-Type", "Accept-Ranges"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub length: u64,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Load the metadata record, distinguishing "never probed" (`None`) from a
/// record that exists but cannot be parsed. Anything shorter than the
/// shortest possible serialization counts as absent.
pub fn load_meta(ns: &CacheNamespace) -> Result<Option<ObjectMeta>, MetaError> {
    let Some(raw) = ns.get(META_KEY)? else {
        return Ok(None);
    };
    if raw.len() < 2 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Filter `headers` down to the whitelist and persist the record with the
/// same TTL the chunks get.
pub fn set_meta(
    ns: &CacheNamespace,
    length: u64,
    headers: &HeaderMap,
    ttl: i64,
) -> Result<ObjectMeta, MetaError> {
    let mut kept = BTreeMap::new();
    for name in KEPT_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            kept.insert(name.to_owned(), value.to_owned());
        }
    }
    let meta = ObjectMeta {
        length,
        headers: kept,
    };
    ns.set(META_KEY, &serde_json::to_vec(&meta)?, ttl)?;
    Ok(meta)
}
