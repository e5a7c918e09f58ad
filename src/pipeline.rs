//! Chunked read pipeline.
//!
//! Given a client byte range, the planner walks the chunk indices the range
//! touches exactly once. Chunks already in the store become one-shot cached
//! segments; every contiguous run of missing chunks becomes a single fill
//! segment that downloads the run in one ranged GET and tees it into the
//! store while it streams to the client. The concatenated segments, with
//! `start % CHUNK_SIZE` head bytes skipped and the total capped at
//! `end - start + 1`, are exactly the requested bytes of the origin object.
//!
//! Segments are lazy: nothing is loaded or downloaded until the response
//! body is actually polled.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::header::RANGE;
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheNamespace;
use crate::fetch::{BodyStream, FetchError, FetchResponse, Origin};
use crate::store::StoreError;

/// Fixed cache unit: chunk index `i` covers bytes
/// `[i * CHUNK_SIZE, (i + 1) * CHUNK_SIZE)` of the origin object, the last
/// chunk possibly short.
pub const CHUNK_SIZE: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fill request returned status {0}")]
    FillStatus(StatusCode),
}

/// What every fill segment needs from its parent, passed by value so
/// segments never hold a reference back into the pipeline.
#[derive(Clone)]
pub struct FillContext {
    /// Origin URL the fills are issued against.
    pub url: String,
    /// Request headers forwarded upstream; each fill clones and sets its
    /// own `Range`.
    pub headers: HeaderMap,
    /// Total byte length of the origin object.
    pub length: u64,
    /// TTL applied to every chunk written by the tee.
    pub ttl: i64,
}

pub struct ChunkPipeline {
    origin: Arc<dyn Origin>,
    segments: VecDeque<Segment>,
    skip: u64,
    remaining: u64,
}

impl ChunkPipeline {
    /// Plan the segment list for client range `[start, end]` of the object
    /// described by `ctx`. An `end` of zero or past the object collapses to
    /// `length - 1`; an inverted range collapses to the single byte at
    /// `end`. The planning pass also refreshes the TTL of every chunk it
    /// finds cached.
    pub fn open(
        origin: Arc<dyn Origin>,
        ns: &CacheNamespace,
        ctx: &FillContext,
        mut start: u64,
        mut end: u64,
    ) -> Self {
        let length = ctx.length;
        if length == 0 {
            return Self {
                origin,
                segments: VecDeque::new(),
                skip: 0,
                remaining: 0,
            };
        }
        if end == 0 || end > length - 1 {
            end = length - 1;
        }
        if start > end {
            start = end;
        }
        let start_chunk = start / CHUNK_SIZE;
        let end_chunk = end / CHUNK_SIZE;
        let mut segments = VecDeque::new();
        let mut i = start_chunk;
        while i <= end_chunk {
            if ns.has(&i.to_string(), ctx.ttl) {
                debug!(chunk = i, "cache hit");
                segments.push_back(Segment::Cached(CachedSegment::new(ns.clone(), i)));
                i += 1;
                continue;
            }
            // Probe forward to cover the whole missing run with one fill.
            let mut last_missing = i;
            let mut next = i + 1;
            while next <= end_chunk && !ns.has(&next.to_string(), ctx.ttl) {
                last_missing = next;
                next += 1;
            }
            let fill_start = i * CHUNK_SIZE;
            let fill_end = ((last_missing + 1) * CHUNK_SIZE).min(length) - 1;
            debug!(from = fill_start, to = fill_end, "fill planned");
            segments.push_back(Segment::Fill(FillSegment::new(
                ns.clone(),
                ctx.clone(),
                fill_start,
                fill_end,
            )));
            i = last_missing + 1;
        }
        Self {
            origin,
            segments,
            skip: start % CHUNK_SIZE,
            remaining: end - start + 1,
        }
    }

    async fn next_block(&mut self) -> Result<Option<Bytes>, PipelineError> {
        while self.remaining > 0 {
            let Some(segment) = self.segments.front_mut() else {
                return Ok(None);
            };
            match segment.next(self.origin.as_ref()).await? {
                None => {
                    self.segments.pop_front();
                }
                Some(mut block) => {
                    if self.skip > 0 {
                        let head = self.skip.min(block.len() as u64);
                        block.advance(head as usize);
                        self.skip -= head;
                        if block.is_empty() {
                            continue;
                        }
                    }
                    if block.len() as u64 > self.remaining {
                        block.truncate(self.remaining as usize);
                    }
                    self.remaining -= block.len() as u64;
                    if self.remaining == 0 {
                        // Delivery is capped here, but an in-flight fill may
                        // sit mid-chunk. Run the segment to its end so the
                        // tee persists that trailing chunk whole; a fill
                        // never extends past the chunk containing `end`, so
                        // this drains less than one chunk.
                        while let Ok(Some(_)) = segment.next(self.origin.as_ref()).await {}
                    }
                    return Ok(Some(block));
                }
            }
        }
        Ok(None)
    }

    /// Consume the pipeline as a byte stream suitable for a response body.
    /// Dropping the stream mid-flight closes the in-flight fill and flushes
    /// its tee buffer.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, PipelineError>> + Send {
        futures_util::stream::try_unfold(self, |mut pipeline| async move {
            Ok(pipeline.next_block().await?.map(|block| (block, pipeline)))
        })
    }
}

enum Segment {
    Cached(CachedSegment),
    Fill(FillSegment),
}

impl Segment {
    async fn next(&mut self, origin: &dyn Origin) -> Result<Option<Bytes>, PipelineError> {
        match self {
            Segment::Cached(seg) => seg.next(),
            Segment::Fill(seg) => seg.next(origin).await,
        }
    }
}

/// One chunk served straight from the store, loaded on first read. A chunk
/// that expired between planning and read yields nothing and the stream
/// simply runs short; the read path never falls back to the origin
/// mid-stream.
struct CachedSegment {
    ns: CacheNamespace,
    index: u64,
    drained: bool,
}

impl CachedSegment {
    fn new(ns: CacheNamespace, index: u64) -> Self {
        Self {
            ns,
            index,
            drained: false,
        }
    }

    fn next(&mut self) -> Result<Option<Bytes>, PipelineError> {
        if self.drained {
            return Ok(None);
        }
        self.drained = true;
        match self.ns.get(&self.index.to_string())? {
            Some(raw) => Ok(Some(Bytes::from(raw))),
            None => {
                warn!(chunk = self.index, "chunk expired between planning and read");
                Ok(None)
            }
        }
    }
}

/// One ranged GET spanning a contiguous run of missing chunks. The download
/// starts on first read; every block is pushed through the tee sink before
/// it is handed to the client.
struct FillSegment {
    ctx: FillContext,
    range_start: u64,
    range_end: u64,
    state: FillState,
    sink: ChunkSink,
}

enum FillState {
    Idle,
    Streaming(BodyStream),
    Done,
}

impl FillSegment {
    fn new(ns: CacheNamespace, ctx: FillContext, range_start: u64, range_end: u64) -> Self {
        let sink = ChunkSink::new(ns, ctx.ttl, range_start / CHUNK_SIZE);
        Self {
            ctx,
            range_start,
            range_end,
            state: FillState::Idle,
            sink,
        }
    }

    async fn next(&mut self, origin: &dyn Origin) -> Result<Option<Bytes>, PipelineError> {
        loop {
            match &mut self.state {
                FillState::Idle => {
                    let mut headers = self.ctx.headers.clone();
                    let range = format!("bytes={}-{}", self.range_start, self.range_end);
                    headers.insert(RANGE, HeaderValue::from_str(&range).map_err(FetchError::from)?);
                    let FetchResponse { status, body, .. } =
                        origin.get(&self.ctx.url, headers).await?;
                    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
                        self.state = FillState::Done;
                        return Err(PipelineError::FillStatus(status));
                    }
                    self.state = FillState::Streaming(body);
                }
                FillState::Streaming(body) => match body.next().await {
                    Some(Ok(block)) => {
                        self.sink.push(&block);
                        return Ok(Some(block));
                    }
                    Some(Err(err)) => {
                        self.state = FillState::Done;
                        return Err(err.into());
                    }
                    None => {
                        self.sink.finish();
                        self.state = FillState::Done;
                        return Ok(None);
                    }
                },
                FillState::Done => return Ok(None),
            }
        }
    }
}

/// Tee sink: accumulates fill bytes and writes each completed chunk under
/// its decimal index. Store failures are logged and swallowed — a missing
/// chunk is refilled by a later request, a corrupted client response is
/// not recoverable.
struct ChunkSink {
    ns: CacheNamespace,
    ttl: i64,
    index: u64,
    buf: BytesMut,
}

impl ChunkSink {
    fn new(ns: CacheNamespace, ttl: i64, index: u64) -> Self {
        Self {
            ns,
            ttl,
            index,
            buf: BytesMut::new(),
        }
    }

    fn push(&mut self, block: &[u8]) {
        self.buf.extend_from_slice(block);
        while self.buf.len() as u64 >= CHUNK_SIZE {
            let chunk = self.buf.split_to(CHUNK_SIZE as usize);
            self.write(&chunk);
            self.index += 1;
        }
    }

    /// Persist whatever is still buffered under the current index: the
    /// trailing, possibly short, chunk at body end, or the bytes a
    /// cancelled download had already collected. Runs on close and on
    /// drop, whichever comes first; the buffer drains either way.
    fn finish(&mut self) {
        if !self.buf.is_empty() {
            let chunk = self.buf.split_to(self.buf.len());
            self.write(&chunk);
        }
    }

    fn write(&self, chunk: &[u8]) {
        if let Err(err) = self.ns.set(&self.index.to_string(), chunk, self.ttl) {
            warn!(chunk = self.index, %err, "chunk write failed, streaming on");
        }
    }
}

impl Drop for ChunkSink {
    fn drop(&mut self) {
        self.finish();
    }
}
