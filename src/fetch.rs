//! Origin access.
//!
//! [`Origin`] is the one capability the read path needs from the outside
//! world: issue a GET, get back status, headers, and a streaming body. The
//! production implementation wraps the per-vhost reqwest client; tests swap
//! in scripted fakes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::header::{CONTENT_RANGE, RANGE};
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;

use crate::pipeline::CHUNK_SIZE;
use crate::util::content_range_total;

/// Single-shot streaming response body. Dropping it closes the connection.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The origin answered outside the 2xx range. The body has already been
    /// closed; status and headers are preserved for the caller.
    #[error("origin returned status {status}")]
    Status {
        status: StatusCode,
        headers: Box<HeaderMap>,
    },
    #[error("origin request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request header: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// Issue a GET with the given headers. Implementations own their copy of
    /// the headers and may mutate it freely. Non-2xx responses come back as
    /// [`FetchError::Status`].
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<FetchResponse, FetchError>;
}

/// Production fetcher over a preconfigured reqwest client (timeouts,
/// redirect policy, and dial overrides are the client's concern).
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Origin for HttpFetcher {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<FetchResponse, FetchError> {
        let resp = self.client.get(url).headers(headers).send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                headers: Box::new(headers),
            });
        }
        let body: BodyStream = Box::pin(resp.bytes_stream().map_err(FetchError::from));
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Ask the origin for the first chunk and learn the object length from its
/// `Content-Range`. A missing or unparseable `Content-Range` reports length
/// 0, which callers read as "this origin does not do ranges".
pub async fn probe(
    origin: &dyn Origin,
    url: &str,
    base_headers: &HeaderMap,
) -> Result<(FetchResponse, u64), FetchError> {
    let mut headers = base_headers.clone();
    let first_chunk = format!("bytes=0-{}", CHUNK_SIZE - 1);
    headers.insert(RANGE, HeaderValue::from_str(&first_chunk)?);
    let resp = origin.get(url, headers).await?;
    let length = resp
        .headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map_or(0, content_range_total);
    Ok((resp, length))
}
