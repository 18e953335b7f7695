//! HTTP Server - directory browser in front of the drive gateway
//!
//! `/authcallback` finishes the OAuth consent flow; every other path is a
//! browse request answered from listings and the content cache.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, COOKIE, RANGE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::render::{self, InfoView, ListingView, SortKey};
use crate::cache::ListingSnapshot;
use crate::config::Settings;
use crate::gateway::{DriveGateway, FileBody, GatewayError};

/// Upstream headers scoped to the upstream connection
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Cookie set by the info page, marking the browser as an administrator
const ADMIN_COOKIE: &str = "admin";

/// One year
const ADMIN_COOKIE_MAX_AGE: u64 = 365 * 24 * 3600;

/// Largest README inlined under a listing
const README_LIMIT: u64 = 1024 * 1024;

/// Shared handler context
pub struct AppState {
    pub settings: Settings,
    pub gateway: DriveGateway,
    /// OAuth consent URL for `?auth=`
    pub authorize_url: String,
}

type Params = Query<HashMap<String, String>>;

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/authcallback", get(auth_callback))
        .fallback(browse)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listen address")?;
    info!(addr = %addr, "HTTP server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn auth_callback(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing authorization code").into_response();
    };

    match state.gateway.redeem_code(code).await {
        Ok(()) => {
            info!("Account connected");
            Redirect::temporary("/").into_response()
        }
        Err(e) => {
            error!(error = %e, "Authorization code exchange failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

async fn browse(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    let password = state.settings.password.as_str();
    let is_password = |key: &str| !password.is_empty() && params.get(key).map(String::as_str) == Some(password);

    if is_password("auth") {
        info!("Redirecting to OAuth consent page");
        return Redirect::temporary(&state.authorize_url).into_response();
    }
    if is_password("info") {
        return info_response(&state);
    }

    let raw_path = uri.path();
    if !raw_path.ends_with('/') {
        return Redirect::temporary(&format!("{}/", raw_path)).into_response();
    }
    let path = match urlencoding::decode(raw_path) {
        Ok(path) => path.into_owned(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid path encoding"),
    };

    debug!(path = %path, "Browse request");

    let snapshot = state.gateway.list(&path).await;
    if let Some(message) = &snapshot.error {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, message);
    }

    if let Some(name) = params.get("file") {
        if state.settings.is_prefetchable(name) {
            let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
            return match state.gateway.open_file(&path, name).await {
                Ok(body) => file_response(body, name, range).await,
                Err(GatewayError::NotFound(p)) => {
                    error_response(StatusCode::NOT_FOUND, &format!("{} not found", p))
                }
                Err(GatewayError::Unavailable(m)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &m),
            };
        }
    }

    let readme = if state.settings.disable_readme {
        None
    } else {
        load_readme(&state, &path, &snapshot).await
    };

    let view = ListingView {
        snapshot: &snapshot,
        settings: &state.settings,
        key: SortKey::from_query(params.get("c").map(String::as_str)),
        descending: render::descending(params.get("o").map(String::as_str)),
        admin: is_admin(&headers, password),
        readme,
        last_refreshed_at: state.gateway.coordinator().status().last_refreshed_at,
    };
    Html(render::listing_page(&view)).into_response()
}

async fn load_readme(state: &AppState, path: &str, snapshot: &ListingSnapshot) -> Option<String> {
    let (entry, kind) = render::find_readme(snapshot, &state.settings)?;
    if entry.size > README_LIMIT {
        debug!(name = %entry.name, size = entry.size, "README too large to inline");
        return None;
    }

    match state.gateway.read_file(path, &entry.name, README_LIMIT).await {
        Ok(content) => Some(render::readme_html(kind, &content)),
        Err(e) => {
            warn!(path = %path, name = %entry.name, error = %e, "Failed to load README");
            None
        }
    }
}

/// Value of cookie `name` in the request
fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn is_admin(headers: &HeaderMap, password: &str) -> bool {
    if password.is_empty() {
        return false;
    }
    cookie(headers, ADMIN_COOKIE)
        .and_then(|value| urlencoding::decode(value).ok())
        .is_some_and(|value| value == password)
}

fn info_response(state: &AppState) -> Response {
    let content = state.gateway.content();
    let view = InfoView {
        settings: &state.settings,
        status: state.gateway.coordinator().status(),
        listing_stats: state.gateway.listings().stats(),
        content_weight: content.weighted_size(),
        content_budget: content.budget(),
        content_entries: content.entries(),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    let admin = format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly",
        ADMIN_COOKIE,
        urlencoding::encode(&state.settings.password),
        ADMIN_COOKIE_MAX_AGE
    );
    match HeaderValue::from_str(&admin) {
        Ok(value) => {
            headers.insert(SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "Cannot set admin cookie"),
    }

    (headers, render::info_page(&view)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Html(render::error_page(message))).into_response()
}

/// A `Range` request resolved against a file length
#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive byte offsets
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Resolve a single `bytes=` range
///
/// Multiple ranges, other units and malformed values fall back to the
/// whole file.
fn byte_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Full;
    };

    match (first.trim(), last.trim()) {
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if len == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            },
            Err(_) => ByteRange::Full,
        },
        (first, last) => {
            let Ok(start) = first.parse::<u64>() else {
                return ByteRange::Full;
            };
            let end = if last.is_empty() {
                u64::MAX
            } else {
                match last.parse::<u64>() {
                    Ok(end) if end >= start => end,
                    _ => return ByteRange::Full,
                }
            };
            if start >= len {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial {
                start,
                end: end.min(len - 1),
            }
        }
    }
}

/// Copy upstream headers that describe the content
fn forward_headers(upstream: Vec<(String, String)>, headers: &mut HeaderMap) {
    for (name, value) in upstream {
        if HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Dropping unrepresentable upstream header"),
        }
    }
}

async fn file_response(body: FileBody, name: &str, range: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();

    match body {
        FileBody::Cached { mut file, len } => {
            let mime = mime_guess::from_path(name).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                headers.insert(CONTENT_TYPE, value);
            }
            headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

            match byte_range(range, len) {
                ByteRange::Full => {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                    (StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response()
                }
                ByteRange::Partial { start, end } => {
                    if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                        warn!(name = %name, error = %e, "Failed to seek cached file");
                        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read cached file");
                    }
                    let count = end - start + 1;
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(count));
                    if let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, len)) {
                        headers.insert(CONTENT_RANGE, value);
                    }
                    let body = Body::from_stream(ReaderStream::new(file.take(count)));
                    (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
                }
                ByteRange::Unsatisfiable => {
                    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", len)) {
                        headers.insert(CONTENT_RANGE, value);
                    }
                    (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
                }
            }
        }
        FileBody::Remote {
            headers: upstream,
            content_length,
            body,
        } => {
            // Ranges are only honoured once the file is cached
            forward_headers(upstream, &mut headers);
            if let Some(len) = content_length {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            (StatusCode::OK, headers, Body::from_stream(body)).into_response()
        }
    }
}
