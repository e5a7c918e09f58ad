//! Caching HTTP range proxy.
//!
//! Clients address upstream origins through the proxy; it serves byte
//! ranges out of a persistent local chunk cache and fetches only what is
//! missing. Large, mostly-immutable objects consumed in partial reads by
//! many clients are the target workload.
//!
//! ```text
//! client range ──► coordinator ──► metadata (probe on first touch)
//!                       │
//!                       └─► pipeline: cached chunk │ fill ── tee ──► store
//! ```
//!
//! Objects are cut into fixed 256 KiB chunks keyed `<ns>:<index>` under a
//! namespace derived from the origin URL. A fill downloads one contiguous
//! run of missing chunks and persists each completed chunk while the bytes
//! stream to the client. Expiry is TTL-only: every write carries an entry
//! in a parallel index bucket, and a periodic sweep removes whatever has
//! lapsed.

pub mod cache;
pub mod fetch;
pub mod meta;
pub mod pipeline;
pub mod proxy;
pub mod statics;
pub mod store;
pub mod util;
pub mod vhost;

pub use cache::CacheNamespace;
pub use fetch::{FetchError, FetchResponse, HttpFetcher, Origin};
pub use meta::{ObjectMeta, META_KEY};
pub use pipeline::{ChunkPipeline, FillContext, PipelineError, CHUNK_SIZE};
pub use store::{Store, StoreError, DATA_BUCKET, TTL_BUCKET};
pub use vhost::{ResolvedRoute, VhostRule, VhostTable};
