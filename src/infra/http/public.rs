use std::time::{Duration, SystemTime};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES, IF_MODIFIED_SINCE,
            IF_NONE_MATCH, LAST_MODIFIED,
        },
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use time::{OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::debug;

use crate::application::{
    assets::{Asset, AssetService},
    error::HttpError,
};

use super::middleware::{log_responses, set_request_context};

/// IMF-fixdate, the only date format HTTP/1.1 senders may generate.
const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[derive(Clone)]
pub struct HttpState {
    pub assets: AssetService,
    /// `0` disables client caching.
    pub cache_seconds: u64,
}

impl HttpState {
    pub fn new(assets: AssetService, cache_seconds: u64) -> Self {
        Self {
            assets,
            cache_seconds,
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/{*path}", get(serve_asset))
        .fallback(fallback)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn fallback() -> Response {
    HttpError::new(
        "infra::http::public::fallback",
        StatusCode::NOT_FOUND,
        "Resource not found",
        "no route matched",
    )
    .into_response()
}

async fn serve_asset(
    State(state): State<HttpState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.assets.get_artifact(&path).await {
        Ok(asset) => asset_response(&asset, &headers, state.cache_seconds, SystemTime::now()),
        Err(err) => HttpError::from(err).into_response(),
    }
}

/// Build a fresh response around the shared asset bytes.
fn asset_response(
    asset: &Asset,
    request: &HeaderMap,
    cache_seconds: u64,
    now: SystemTime,
) -> Response {
    let last_modified = truncate_to_seconds(asset.last_modified());
    let mut headers = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(asset.media_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(value) = http_date(last_modified) {
        headers.insert(LAST_MODIFIED, value);
    }
    if let Some(etag) = asset.etag()
        && let Ok(value) = HeaderValue::from_str(etag)
    {
        headers.insert(ETAG, value);
    }
    insert_cache_headers(&mut headers, cache_seconds, now);

    if not_modified(asset, request, last_modified) {
        debug!(key = asset.key(), "conditional request satisfied");
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        headers.remove(CONTENT_TYPE);
        response.headers_mut().extend(headers);
        return response;
    }

    let content = asset.content();
    if let Ok(value) = HeaderValue::from_str(&content.len().to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    let mut response = Response::new(Body::from(content));
    *response.headers_mut() = headers;
    response
}

fn insert_cache_headers(headers: &mut HeaderMap, cache_seconds: u64, now: SystemTime) {
    if cache_seconds == 0 {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(value) = http_date(now) {
            headers.insert(EXPIRES, value);
        }
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&format!("max-age={cache_seconds}")) {
        headers.insert(CACHE_CONTROL, value);
    }
    if let Some(expires) = now.checked_add(Duration::from_secs(cache_seconds))
        && let Some(value) = http_date(expires)
    {
        headers.insert(EXPIRES, value);
    }
}

/// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted
/// when the request carries no entity tags.
fn not_modified(asset: &Asset, request: &HeaderMap, last_modified: SystemTime) -> bool {
    if let Some(candidates) = request.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        let Some(etag) = asset.etag() else {
            return false;
        };
        return candidates
            .split(',')
            .map(|tag| tag.trim().trim_start_matches("W/"))
            .any(|tag| tag == "*" || tag == etag);
    }

    request
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| last_modified <= since)
}

fn http_date(at: SystemTime) -> Option<HeaderValue> {
    let formatted = OffsetDateTime::from(at).format(HTTP_DATE).ok()?;
    HeaderValue::from_str(&formatted).ok()
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    let parsed = PrimitiveDateTime::parse(value.trim(), HTTP_DATE).ok()?;
    Some(parsed.assume_utc().into())
}

fn truncate_to_seconds(at: SystemTime) -> SystemTime {
    match at.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => SystemTime::UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => at,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn file_asset(modified_secs: u64) -> Asset {
        Asset::File {
            key: "a.txt".into(),
            content: Bytes::from_static(b"hello"),
            media_type: "text/plain; charset=utf-8".into(),
            last_modified: SystemTime::UNIX_EPOCH + Duration::from_millis(modified_secs * 1000 + 250),
        }
    }

    #[test]
    fn formats_imf_fixdate() {
        let value = http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777)).expect("date");
        assert_eq!(value, "Sun, 06 Nov 1994 08:49:37 GMT");
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").expect("parsed");
        assert_eq!(parsed, SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777));
    }

    #[test]
    fn zero_cache_seconds_disables_caching() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut headers = HeaderMap::new();
        insert_cache_headers(&mut headers, 0, now);
        assert_eq!(headers[CACHE_CONTROL], "no-cache");

        let mut headers = HeaderMap::new();
        insert_cache_headers(&mut headers, 60, now);
        assert_eq!(headers[CACHE_CONTROL], "max-age=60");
        assert_eq!(headers[EXPIRES], "Thu, 01 Jan 1970 00:17:40 GMT");
    }

    #[test]
    fn if_modified_since_uses_whole_seconds() {
        let asset = file_asset(100);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(200);
        let since = http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(100)).expect("date");

        let mut request = HeaderMap::new();
        request.insert(IF_MODIFIED_SINCE, since);
        let response = asset_response(&asset, &request, 0, now);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = asset_response(&asset, &HeaderMap::new(), 0, now);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        assert_eq!(response.headers()[LAST_MODIFIED], "Thu, 01 Jan 1970 00:01:40 GMT");
    }

    #[test]
    fn etag_mismatch_on_plain_files_never_short_circuits() {
        let asset = file_asset(100);
        let mut request = HeaderMap::new();
        request.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        let response = asset_response(&asset, &request, 0, SystemTime::now());
        assert_eq!(response.status(), StatusCode::OK);
    }
}
