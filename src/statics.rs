//! Static fallback for paths no vhost claims: regular files under
//! `./public`, with the usual index.html try-list.

use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::response::Response;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};

const ROOT: &str = "public";

pub async fn serve(path: &str) -> Response {
    let mut candidates = Vec::new();
    if path == "/" {
        candidates.push(Path::new(ROOT).join("index.html"));
    } else if let Some(rel) = sanitize(path) {
        candidates.push(Path::new(ROOT).join(&rel));
        candidates.push(Path::new(ROOT).join(&rel).join("index.html"));
    }
    for candidate in candidates {
        // read() fails on directories, so only regular files are served.
        if let Ok(data) = tokio::fs::read(&candidate).await {
            let mut resp = Response::new(Body::from(data));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&candidate)));
            return resp;
        }
    }
    let mut resp = Response::new(Body::from("404 page not found"));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Normalize the request path to a relative path with no traversal
/// components.
fn sanitize(path: &str) -> Option<PathBuf> {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(rel.to_path_buf())
    } else {
        None
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
