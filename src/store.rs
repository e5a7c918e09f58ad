//! Durable key/value store with bucketing and a TTL side-index.
//!
//! Buckets map onto sled trees; two-level buckets are flattened into a
//! `outer/inner` tree name. Every keyed write with a positive TTL also
//! writes a record into the `ttl` bucket inside the same transaction, so at
//! any instant data and its TTL entry are either both present or both
//! absent. The periodic [`Store::expire`] sweep walks the index and removes
//! everything that has lapsed.
//!
//! The index record is a compact JSON array `[expiresAt, bucket.., key]` —
//! arity 3 for single-level buckets, 4 for two-level ones. Records with any
//! other arity are treated as unreadable and only their index entry is
//! dropped.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bucket holding object chunks and metadata records.
pub const DATA_BUCKET: &str = "data";
/// Bucket holding the TTL index, keyed `bucket:key`.
pub const TTL_BUCKET: &str = "ttl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Engine(#[from] sled::Error),
    #[error("ttl index record could not be encoded: {0}")]
    Index(#[from] serde_json::Error),
    #[error("store transaction aborted")]
    Aborted,
}

impl From<TransactionError<()>> for StoreError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(e) => StoreError::Engine(e),
            TransactionError::Abort(()) => StoreError::Aborted,
        }
    }
}

/// Single-file transactional store. Writes serialize; reads run concurrently
/// against the tree snapshots sled maintains. Cheap to share behind an `Arc`.
pub struct Store {
    db: Db,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        info!(path = %path.as_ref().display(), "cache store opened");
        Ok(Self { db })
    }

    fn tree(&self, bucket: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(bucket)?)
    }

    /// Plain put, no TTL bookkeeping. The bucket is created as needed.
    pub fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.tree(bucket)?.insert(key, value)?;
        Ok(())
    }

    /// Two-level variant of [`Store::set`].
    pub fn set2(&self, outer: &str, inner: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.tree(&tree_name(&[outer, inner]))?.insert(key, value)?;
        Ok(())
    }

    /// Write `value` and its TTL index entry in one transaction. A TTL of
    /// zero or below writes the value and removes any index entry instead,
    /// making the key immortal.
    pub fn ttl_set(&self, bucket: &str, key: &str, value: &[u8], ttl: i64) -> Result<(), StoreError> {
        self.ttl_set_path(&[bucket], key, value, ttl)
    }

    /// Two-level variant of [`Store::ttl_set`].
    pub fn ttl_set2(
        &self,
        outer: &str,
        inner: &str,
        key: &str,
        value: &[u8],
        ttl: i64,
    ) -> Result<(), StoreError> {
        self.ttl_set_path(&[outer, inner], key, value, ttl)
    }

    fn ttl_set_path(
        &self,
        path: &[&str],
        key: &str,
        value: &[u8],
        ttl: i64,
    ) -> Result<(), StoreError> {
        let data = self.tree(&tree_name(path))?;
        let ttl_tree = self.tree(TTL_BUCKET)?;
        let ik = index_key(path, key);
        let record = if ttl > 0 {
            Some(ttl_record(unix_now() + ttl, path, key)?)
        } else {
            None
        };
        (&data, &ttl_tree)
            .transaction(|(d, t)| {
                d.insert(key.as_bytes(), value)?;
                match &record {
                    Some(rec) => {
                        t.insert(ik.as_bytes(), rec.as_slice())?;
                    }
                    None => {
                        t.remove(ik.as_bytes())?;
                    }
                }
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Read a key. The returned bytes are an owned copy, safe to hold after
    /// the read transaction ends.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree(bucket)?.get(key)?.map(|v| v.to_vec()))
    }

    /// Read-only existence check.
    pub fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.tree(bucket)?.contains_key(key)?)
    }

    /// Report whether `key` exists; when it does and `ttl` is positive, push
    /// its expiry out without rewriting the data. Both steps share one
    /// transaction.
    pub fn touch(&self, bucket: &str, key: &str, ttl: i64) -> Result<bool, StoreError> {
        let data = self.tree(bucket)?;
        let ttl_tree = self.tree(TTL_BUCKET)?;
        let ik = index_key(&[bucket], key);
        let record = if ttl > 0 {
            Some(ttl_record(unix_now() + ttl, &[bucket], key)?)
        } else {
            None
        };
        let found = (&data, &ttl_tree)
            .transaction(|(d, t)| {
                if d.get(key.as_bytes())?.is_none() {
                    return Ok(false);
                }
                if let Some(rec) = &record {
                    t.insert(ik.as_bytes(), rec.as_slice())?;
                }
                Ok::<_, ConflictableTransactionError<()>>(true)
            })
            .map_err(StoreError::from)?;
        Ok(found)
    }

    /// Delete the enumerated keys, or the whole bucket when `keys` is
    /// `None`. Enumerated deletes are applied as one atomic batch.
    pub fn del(&self, bucket: &str, keys: Option<&[&str]>) -> Result<(), StoreError> {
        match keys {
            None => {
                self.db.drop_tree(bucket)?;
            }
            Some(keys) => {
                let mut batch = sled::Batch::default();
                for key in keys {
                    batch.remove(key.as_bytes());
                }
                self.tree(bucket)?.apply_batch(batch)?;
            }
        }
        Ok(())
    }

    /// Read-only iteration over one bucket.
    pub fn for_each<F>(&self, bucket: &str, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    {
        for item in self.tree(bucket)?.iter() {
            let (key, value) = item?;
            f(&key, &value)?;
        }
        Ok(())
    }

    /// Sweep the TTL index: every record whose expiry has passed loses both
    /// its data entry and its index entry, deleted together per bucket.
    /// Unreadable records lose only the index entry; the data they pointed
    /// at is left for a later rewrite to re-index. Returns the number of
    /// data keys removed.
    pub fn expire(&self) -> Result<usize, StoreError> {
        let now = unix_now();
        // bucket tree name -> (data key, index key) pairs
        let mut doomed: HashMap<String, Vec<(String, Vec<u8>)>> = HashMap::new();
        let mut unreadable: Vec<Vec<u8>> = Vec::new();
        self.for_each(TTL_BUCKET, |key, value| {
            match parse_ttl_record(value) {
                Some((expires_at, _, _)) if expires_at > now => {}
                Some((_, bucket, data_key)) => {
                    doomed
                        .entry(bucket)
                        .or_default()
                        .push((data_key, key.to_vec()));
                }
                None => {
                    warn!(
                        key = %String::from_utf8_lossy(key),
                        "dropping unreadable ttl index record"
                    );
                    unreadable.push(key.to_vec());
                }
            }
            Ok(())
        })?;

        let ttl_tree = self.tree(TTL_BUCKET)?;
        let mut removed = 0usize;
        for (bucket, entries) in &doomed {
            let data = self.tree(bucket)?;
            (&data, &ttl_tree)
                .transaction(|(d, t)| {
                    for (data_key, index_key) in entries {
                        d.remove(data_key.as_bytes())?;
                        t.remove(index_key.as_slice())?;
                    }
                    Ok::<_, ConflictableTransactionError<()>>(())
                })
                .map_err(StoreError::from)?;
            removed += entries.len();
        }
        if !unreadable.is_empty() {
            let mut batch = sled::Batch::default();
            for key in &unreadable {
                batch.remove(key.as_slice());
            }
            ttl_tree.apply_batch(batch)?;
        }
        debug!(removed, unreadable = unreadable.len(), "ttl sweep finished");
        Ok(removed)
    }

    /// Block until pending writes hit disk. Called on shutdown; everyday
    /// durability is left to sled's background flusher.
    pub fn flush(&self) {
        if let Err(err) = self.db.flush() {
            warn!(%err, "store flush failed");
        }
    }
}

fn tree_name(path: &[&str]) -> String {
    path.join("/")
}

fn index_key(path: &[&str], key: &str) -> String {
    let mut joined = String::with_capacity(key.len() + 8);
    for bucket in path {
        joined.push_str(bucket);
        joined.push(':');
    }
    joined.push_str(key);
    joined
}

fn ttl_record(expires_at: i64, path: &[&str], key: &str) -> Result<Vec<u8>, serde_json::Error> {
    let mut row = vec![json!(expires_at)];
    row.extend(path.iter().map(|b| json!(b)));
    row.push(json!(key));
    serde_json::to_vec(&row)
}

fn parse_ttl_record(raw: &[u8]) -> Option<(i64, String, String)> {
    let row: Vec<Value> = serde_json::from_slice(raw).ok()?;
    if row.len() != 3 && row.len() != 4 {
        return None;
    }
    let expires_at = row.first()?.as_i64()?;
    let key = row.last()?.as_str()?.to_owned();
    let buckets: Vec<&str> = row
        .get(1..row.len() - 1)?
        .iter()
        .map(Value::as_str)
        .collect::<Option<_>>()?;
    Some((expires_at, buckets.join("/"), key))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
