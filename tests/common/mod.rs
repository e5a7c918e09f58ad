//! Shared test infrastructure: a throwaway store and an in-process origin
//! server with deterministic, range-capable content.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http::{HeaderMap, StatusCode};
use tempfile::TempDir;

use rangeproxy::{FetchError, FetchResponse, HttpFetcher, Origin, Store};

/// Fresh store in a temp directory. Keep the `TempDir` alive for the test.
pub fn temp_store() -> (Arc<Store>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store = Store::open(dir.path().join("cache.db")).expect("open store");
    (Arc::new(store), dir)
}

/// Deterministic object content; any slice is recognizable by position.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

pub fn http_fetcher() -> Arc<dyn Origin> {
    Arc::new(HttpFetcher::new(reqwest::Client::new()))
}

/// In-process origin serving one object at `/obj`, counting requests.
/// With `ranges` off it ignores `Range` entirely and always answers 200
/// with the full body and no `Content-Range`.
pub struct FixtureOrigin {
    pub addr: SocketAddr,
    pub body: Arc<Vec<u8>>,
    hits: Arc<AtomicUsize>,
}

struct FixtureState {
    body: Arc<Vec<u8>>,
    ranges: bool,
    hits: Arc<AtomicUsize>,
}

impl FixtureOrigin {
    pub async fn start(len: usize, ranges: bool) -> Self {
        let body = Arc::new(pattern(len));
        let hits = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(FixtureState {
            body: body.clone(),
            ranges,
            hits: hits.clone(),
        });
        let app = Router::new().route("/obj", get(serve_object)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture");
        let addr = listener.local_addr().expect("fixture addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, body, hits }
    }

    pub fn url(&self) -> String {
        format!("http://{}/obj", self.addr)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn serve_object(State(state): State<Arc<FixtureState>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let len = state.body.len();
    let mut builder = Response::builder().header(CONTENT_TYPE, "application/octet-stream");
    if state.ranges {
        builder = builder.header(ACCEPT_RANGES, "bytes");
        if let Some(range) = headers.get(RANGE).and_then(|v| v.to_str().ok()) {
            let (start, end) = parse_fixture_range(range, len);
            let slice = state.body[start..=end].to_vec();
            return builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                .header(CONTENT_LENGTH, slice.len())
                .body(Body::from(slice))
                .expect("fixture response");
        }
    }
    builder
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, len)
        .body(Body::from(state.body.as_ref().clone()))
        .expect("fixture response")
}

fn parse_fixture_range(value: &str, len: usize) -> (usize, usize) {
    let pair = value.trim_start_matches("bytes=");
    let (a, b) = pair.split_once('-').unwrap_or((pair, ""));
    let start: usize = a.parse().unwrap_or(0);
    let end: usize = if b.is_empty() {
        len - 1
    } else {
        b.parse().unwrap_or(len - 1)
    };
    (start.min(len - 1), end.min(len - 1))
}

/// Origin that must never be reached; panics the test if it is.
pub struct UnreachableOrigin;

#[async_trait::async_trait]
impl Origin for UnreachableOrigin {
    async fn get(&self, url: &str, _headers: HeaderMap) -> Result<FetchResponse, FetchError> {
        panic!("origin contacted for {url}, expected cache-only serving");
    }
}

/// Origin that always answers with the given error status.
pub struct FailingOrigin(pub StatusCode);

#[async_trait::async_trait]
impl Origin for FailingOrigin {
    async fn get(&self, _url: &str, _headers: HeaderMap) -> Result<FetchResponse, FetchError> {
        Err(FetchError::Status {
            status: self.0,
            headers: Box::new(HeaderMap::new()),
        })
    }
}
