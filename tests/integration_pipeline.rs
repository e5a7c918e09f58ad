//! Pipeline behavior against a live fixture origin: byte equality, fill
//! grouping, tee persistence, and expiry races.

mod common;

use std::sync::Arc;

use common::{http_fetcher, pattern, temp_store, FixtureOrigin, UnreachableOrigin};
use futures_util::StreamExt;
use http::HeaderMap;
use rangeproxy::{CacheNamespace, ChunkPipeline, FillContext, Origin, Store, CHUNK_SIZE, DATA_BUCKET};

const CHUNK: usize = CHUNK_SIZE as usize;

fn fill_ctx(url: &str, length: u64) -> FillContext {
    FillContext {
        url: url.to_owned(),
        headers: HeaderMap::new(),
        length,
        ttl: 3600,
    }
}

async fn read_all(pipeline: ChunkPipeline) -> Vec<u8> {
    let mut out = Vec::new();
    let mut stream = Box::pin(pipeline.into_stream());
    while let Some(block) = stream.next().await {
        out.extend_from_slice(&block.expect("pipeline block"));
    }
    out
}

fn seed_chunks(ns: &CacheNamespace, body: &[u8]) {
    for (i, chunk) in body.chunks(CHUNK).enumerate() {
        ns.set(&i.to_string(), chunk, 3600).expect("seed chunk");
    }
}

#[tokio::test]
async fn full_read_matches_origin_and_closes_every_chunk() {
    let origin = FixtureOrigin::start(1_000_000, true).await;
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::for_url(store, &origin.url());

    let pipeline = ChunkPipeline::open(
        http_fetcher(),
        &ns,
        &fill_ctx(&origin.url(), 1_000_000),
        0,
        0,
    );
    let got = read_all(pipeline).await;
    assert_eq!(got, pattern(1_000_000));

    // every chunk the object spans is now persisted, the tail short
    for i in 0..4u64 {
        let chunk = ns.get(&i.to_string()).expect("get").expect("chunk present");
        let lo = i as usize * CHUNK;
        let hi = (lo + CHUNK).min(1_000_000);
        assert_eq!(chunk, &pattern(1_000_000)[lo..hi], "chunk {i}");
    }
    assert!(ns.get("4").expect("get").is_none());
}

#[tokio::test]
async fn misaligned_range_returns_exact_bytes() {
    let origin = FixtureOrigin::start(1_000_000, true).await;
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::for_url(store, &origin.url());

    let pipeline = ChunkPipeline::open(
        http_fetcher(),
        &ns,
        &fill_ctx(&origin.url(), 1_000_000),
        300_000,
        700_000,
    );
    let got = read_all(pipeline).await;
    assert_eq!(got, &pattern(1_000_000)[300_000..=700_000]);

    // only the chunks the range touches were filled
    assert!(ns.get("0").expect("get").is_none());
    assert!(ns.get("1").expect("get").is_some());
    assert!(ns.get("2").expect("get").is_some());
    assert!(ns.get("3").expect("get").is_none());
}

#[tokio::test]
async fn fully_cached_object_never_contacts_origin() {
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::new(store, "cachedonly");
    let body = pattern(700_000);
    seed_chunks(&ns, &body);

    let origin: Arc<dyn Origin> = Arc::new(UnreachableOrigin);
    let pipeline = ChunkPipeline::open(
        origin,
        &ns,
        &fill_ctx("http://origin.invalid/obj", 700_000),
        100,
        654_321,
    );
    let got = read_all(pipeline).await;
    assert_eq!(got, &body[100..=654_321]);
}

#[tokio::test]
async fn missing_runs_are_grouped_into_single_fills() {
    let origin = FixtureOrigin::start(1_000_000, true).await;
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::for_url(store, &origin.url());
    let body = pattern(1_000_000);

    // chunks 1 and 3 cached; runs {0} and {2} each need one fill
    ns.set("1", &body[CHUNK..2 * CHUNK], 3600).expect("seed");
    ns.set("3", &body[3 * CHUNK..], 3600).expect("seed");

    let pipeline = ChunkPipeline::open(
        http_fetcher(),
        &ns,
        &fill_ctx(&origin.url(), 1_000_000),
        0,
        0,
    );
    let got = read_all(pipeline).await;
    assert_eq!(got, body);
    assert_eq!(origin.hit_count(), 2, "one request per missing run");
}

#[tokio::test]
async fn short_tail_chunk_is_flushed() {
    let origin = FixtureOrigin::start(700_000, true).await;
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::for_url(store, &origin.url());
    let body = pattern(700_000);

    // range aligned to the final chunk; the fill ends at the object tail
    let pipeline = ChunkPipeline::open(
        http_fetcher(),
        &ns,
        &fill_ctx(&origin.url(), 700_000),
        2 * CHUNK_SIZE,
        0,
    );
    let got = read_all(pipeline).await;
    assert_eq!(got, &body[2 * CHUNK..]);

    let tail = ns.get("2").expect("get").expect("tail chunk present");
    assert_eq!(tail.len(), 700_000 - 2 * CHUNK);
    assert_eq!(tail, &body[2 * CHUNK..]);
}

#[tokio::test]
async fn cancelled_fill_flushes_its_partial_chunk() {
    let origin = FixtureOrigin::start(1_000_000, true).await;
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::for_url(store, &origin.url());

    let pipeline = ChunkPipeline::open(
        http_fetcher(),
        &ns,
        &fill_ctx(&origin.url(), 1_000_000),
        0,
        0,
    );
    let mut stream = Box::pin(pipeline.into_stream());

    // take a few blocks, then hang up mid-chunk
    let mut taken = Vec::new();
    while taken.len() < 10_000 {
        let block = stream
            .next()
            .await
            .expect("stream still open")
            .expect("pipeline block");
        taken.extend_from_slice(&block);
    }
    assert!(taken.len() < CHUNK, "must stop inside the first chunk");
    drop(stream);

    // the client went away, but the tee buffer was flushed on the way out
    let chunk = ns.get("0").expect("get").expect("partial chunk persisted");
    assert_eq!(chunk, taken);
    assert!(ns.get("1").expect("get").is_none());
}

#[tokio::test]
async fn chunk_expiring_after_planning_shortens_the_read() {
    let (store, _dir) = temp_store();
    let ns = CacheNamespace::new(store.clone(), "racy");
    let body = pattern(700_000);
    seed_chunks(&ns, &body);

    let origin: Arc<dyn Origin> = Arc::new(UnreachableOrigin);
    let pipeline = ChunkPipeline::open(
        origin,
        &ns,
        &fill_ctx("http://origin.invalid/obj", 700_000),
        0,
        0,
    );
    // the middle chunk disappears between planning and read
    remove_chunk(&store, &ns, 1);

    let got = read_all(pipeline).await;
    assert_eq!(got.len(), 700_000 - CHUNK);
}

fn remove_chunk(store: &Arc<Store>, ns: &CacheNamespace, index: u64) {
    let key = format!("{}:{}", ns.prefix(), index);
    store.del(DATA_BUCKET, Some(&[key.as_str()])).expect("del chunk");
}
