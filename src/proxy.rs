//! Proxy coordinator.
//!
//! Turns one inbound request into: a namespace lookup, a metadata
//! load-or-probe, and either a passthrough, a buffered small-object
//! response, or a chunked pipeline stream — with the client-visible
//! `Content-Length`/`Content-Range` bookkeeping each path requires.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, COOKIE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RANGE, REFERER, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheNamespace;
use crate::fetch::{probe, BodyStream, FetchError, FetchResponse};
use crate::meta::{self, MetaError, ObjectMeta, META_KEY};
use crate::pipeline::{ChunkPipeline, FillContext, CHUNK_SIZE};
use crate::store::Store;
use crate::util::parse_range;
use crate::vhost::ResolvedRoute;

/// Client headers forwarded to the origin.
const FORWARD_HEADERS: [HeaderName; 7] = [
    USER_AGENT,
    ACCEPT,
    ACCEPT_ENCODING,
    ACCEPT_LANGUAGE,
    COOKIE,
    RANGE,
    REFERER,
];

/// Origin headers exposed to the client.
const EXPOSE_HEADERS: [HeaderName; 8] = [
    ACCEPT_RANGES,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    CONTENT_ENCODING,
    CONTENT_RANGE,
    CACHE_CONTROL,
    LAST_MODIFIED,
    ETAG,
];

#[derive(Debug, Error)]
enum ProxyError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("probe body was {got} bytes, expected {want}")]
    ProbeBody { got: usize, want: usize },
}

/// Serve one proxied request. Failures collapse to a 500 whose body names
/// the origin status or transport error for observability.
pub async fn serve(
    store: Arc<Store>,
    route: ResolvedRoute,
    method: &Method,
    req_headers: &HeaderMap,
) -> Response {
    match respond(store, route, method, req_headers).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(%err, "proxy request failed");
            let mut resp = Response::new(Body::from(err.to_string()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

async fn respond(
    store: Arc<Store>,
    route: ResolvedRoute,
    method: &Method,
    req_headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    // Conditional-request shortcut, before any upstream contact.
    if !route.strict_cache
        && (req_headers.contains_key(IF_MODIFIED_SINCE) || req_headers.contains_key(IF_NONE_MATCH))
    {
        return Ok(build(
            StatusCode::NOT_MODIFIED,
            HeaderMap::new(),
            method,
            Body::empty(),
        ));
    }

    let ns = CacheNamespace::for_url(store, &route.url);
    let (start, end) = req_headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map_or((0, 0), parse_range);

    let mut upstream = HeaderMap::new();
    copy_headers(req_headers, &mut upstream, &FORWARD_HEADERS);

    let known = match meta::load_meta(&ns) {
        Ok(m) => m,
        // A record we cannot parse is as good as no record: re-probe and
        // overwrite it.
        Err(MetaError::Malformed(err)) => {
            warn!(%err, ns = ns.prefix(), "discarding unreadable metadata");
            None
        }
        Err(MetaError::Store(err)) => return Err(err.into()),
    };

    let meta = match known {
        Some(m) => {
            ns.has(META_KEY, route.cache_ttl);
            m
        }
        None => match establish_meta(&ns, &route, start, end, &upstream, method).await? {
            Established::Meta(m) => m,
            Established::Direct(resp) => return Ok(resp),
        },
    };

    chunked_response(&ns, &route, &meta, start, end, upstream, method)
}

enum Established {
    Meta(ObjectMeta),
    Direct(Response),
}

/// First contact with an object: probe, then decide between passthrough,
/// the buffered small-object path, and promotion to the chunked cache.
async fn establish_meta(
    ns: &CacheNamespace,
    route: &ResolvedRoute,
    start: u64,
    end: u64,
    upstream: &HeaderMap,
    method: &Method,
) -> Result<Established, ProxyError> {
    let (resp, length) = probe(route.origin.as_ref(), &route.url, upstream).await?;
    let FetchResponse {
        status,
        headers,
        mut body,
    } = resp;

    if length < 1 || status != StatusCode::PARTIAL_CONTENT {
        // Origin ignored the range request. Relay its response unmodified
        // and cache nothing.
        debug!(%status, url = %route.url, "origin does not support ranges, passing through");
        let mut exposed = HeaderMap::new();
        copy_headers(&headers, &mut exposed, &EXPOSE_HEADERS);
        return Ok(Established::Direct(build(
            status,
            exposed,
            method,
            Body::from_stream(body),
        )));
    }

    if length <= CHUNK_SIZE {
        let full = read_up_to(&mut body, usize::try_from(length).unwrap_or(usize::MAX)).await?;
        return Ok(Established::Direct(small_object(
            &headers, full, length, start, end, method,
        )));
    }

    // Chunked case: the probe body is exactly the first chunk. Keep it, then
    // record what we learned about the object.
    let first = read_probe_chunk(&mut body).await?;
    ns.set("0", &first, route.cache_ttl)?;
    let meta = meta::set_meta(ns, length, &headers, route.cache_ttl)?;
    Ok(Established::Meta(meta))
}

/// An object no larger than one chunk never enters the chunked cache: the
/// probe already returned all of it, so answer from the buffer.
fn small_object(
    origin_headers: &HeaderMap,
    full: Bytes,
    length: u64,
    start: u64,
    mut end: u64,
    method: &Method,
) -> Response {
    let mut headers = HeaderMap::new();
    copy_headers(origin_headers, &mut headers, &EXPOSE_HEADERS);

    if (start > 0 || end > 0) && start < length {
        if end == 0 || end > length - 1 {
            end = length - 1;
        }
        let lo = usize::try_from(start).unwrap_or(usize::MAX).min(full.len());
        let hi = usize::try_from(end + 1).unwrap_or(usize::MAX).min(full.len());
        let body = full.slice(lo..hi.max(lo));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{length}")) {
            headers.insert(CONTENT_RANGE, value);
        }
        build(
            StatusCode::PARTIAL_CONTENT,
            headers,
            method,
            Body::from(body),
        )
    } else {
        headers.remove(CONTENT_RANGE);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(full.len()));
        build(StatusCode::OK, headers, method, Body::from(full))
    }
}

/// Metadata in hand: range-check, pick 200 vs 206, open the pipeline.
fn chunked_response(
    ns: &CacheNamespace,
    route: &ResolvedRoute,
    meta: &ObjectMeta,
    start: u64,
    end: u64,
    upstream: HeaderMap,
    method: &Method,
) -> Result<Response, ProxyError> {
    let length = meta.length;
    let mut headers = HeaderMap::new();
    for (name, value) in &meta.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
        .entry(ACCEPT_RANGES)
        .or_insert(HeaderValue::from_static("bytes"));

    if start >= length || end >= length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        return Ok(build(
            StatusCode::RANGE_NOT_SATISFIABLE,
            headers,
            method,
            Body::empty(),
        ));
    }

    let status = if start < 1 && end < 1 {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };
    let end = if end == 0 || end > length - 1 {
        length - 1
    } else {
        end
    };
    let start = start.min(end);

    headers.insert(CONTENT_LENGTH, HeaderValue::from(end - start + 1));
    if status == StatusCode::PARTIAL_CONTENT {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{length}")) {
            headers.insert(CONTENT_RANGE, value);
        }
    }
    if *method == Method::HEAD {
        return Ok(build(status, headers, method, Body::empty()));
    }

    let ctx = FillContext {
        url: route.url.clone(),
        headers: upstream,
        length,
        ttl: route.cache_ttl,
    };
    let pipeline = ChunkPipeline::open(route.origin.clone(), ns, &ctx, start, end);
    Ok(build(
        status,
        headers,
        method,
        Body::from_stream(pipeline.into_stream()),
    ))
}

/// Buffer at most `limit` bytes of a body.
async fn read_up_to(body: &mut BodyStream, limit: usize) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::with_capacity(limit);
    while buf.len() < limit {
        match body.next().await {
            Some(block) => buf.extend_from_slice(&block?),
            None => break,
        }
    }
    buf.truncate(limit);
    Ok(buf.freeze())
}

/// Read exactly one chunk from the probe body. Anything shorter or longer
/// means the origin lied about ranges; nothing gets persisted and the
/// request fails so a later one can retry from scratch.
async fn read_probe_chunk(body: &mut BodyStream) -> Result<Bytes, ProxyError> {
    let want = CHUNK_SIZE as usize;
    let mut buf = BytesMut::with_capacity(want);
    while buf.len() <= want {
        match body.next().await {
            Some(block) => buf.extend_from_slice(&block?),
            None => break,
        }
    }
    if buf.len() != want {
        return Err(ProxyError::ProbeBody {
            got: buf.len(),
            want,
        });
    }
    Ok(buf.freeze())
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, names: &[HeaderName]) {
    for name in names {
        if let Some(value) = from.get(name) {
            to.insert(name.clone(), value.clone());
        }
    }
}

fn build(status: StatusCode, headers: HeaderMap, method: &Method, body: Body) -> Response {
    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        body
    };
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}
