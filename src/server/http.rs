//! HTTP transport
//!
//! Routes:
//! - `POST /update/{type}/{name}/{value}` plain path update
//! - `POST /update/` single JSON update, `POST /updates/` JSON batch
//! - `POST /value/` JSON query, `GET /value/{type}/{name}` plain-text query
//! - `GET /ping` storage health, `GET /` HTML listing
//!
//! Middleware runs outermost first: trust check on update routes, gzip
//! request/response framing, then RSA body decryption.

use super::ingest::{IngestError, Ingestor};
use crate::metric::{MetricDto, MetricValue};
use crate::observability::request_span;
use crate::security::compression::{accepts_gzip, GZIP};
use crate::security::{compress, decompress, ENCRYPTION_HEADER, ENCRYPTION_SCHEME, ORIGIN_HEADER};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::fmt::Write as _;
use tracing::{error, Instrument};

/// Request bodies larger than this are refused before decoding
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Full router with middleware, state already applied
pub fn router(ingestor: Ingestor) -> Router {
    Router::new()
        .route("/", get(list_metrics))
        .route("/ping", get(ping))
        .route("/update/", post(update_json))
        .route("/updates/", post(update_batch))
        .route("/update/:kind/:name/:value", post(update_path))
        .route("/value/", post(value_json))
        .route("/value/:kind/:name", get(value_path))
        .layer(middleware::from_fn_with_state(ingestor.clone(), decrypt_body))
        .layer(middleware::from_fn(gzip_framing))
        .layer(middleware::from_fn_with_state(ingestor.clone(), trust_guard))
        .with_state(ingestor)
}

fn is_protected(path: &str) -> bool {
    path.starts_with("/update/") || path == "/updates/"
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn trust_guard(State(ingestor): State<Ingestor>, request: Request, next: Next) -> Response {
    if is_protected(request.uri().path()) {
        if let Err(e) = ingestor.admit(header_str(request.headers(), ORIGIN_HEADER)) {
            return e.into_response();
        }
    }
    next.run(request).await
}

async fn read_body(body: Body) -> Result<Bytes, IngestError> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| IngestError::Unreadable(e.to_string()))
}

/// Inflate gzip request bodies; gzip the response when the caller accepts it
async fn gzip_framing(request: Request, next: Next) -> Response {
    let wants_gzip = header_str(request.headers(), header::ACCEPT_ENCODING.as_str())
        .map(accepts_gzip)
        .unwrap_or(false);
    let is_gzipped = header_str(request.headers(), header::CONTENT_ENCODING.as_str())
        .map(|v| v.trim().eq_ignore_ascii_case(GZIP))
        .unwrap_or(false);

    let request = if is_gzipped {
        let (mut parts, body) = request.into_parts();
        let inflated = match read_body(body).await {
            Ok(raw) => decompress(&raw).map_err(IngestError::from),
            Err(e) => Err(e),
        };
        match inflated {
            Ok(plain) => {
                parts.headers.remove(header::CONTENT_ENCODING);
                parts.headers.remove(header::CONTENT_LENGTH);
                Request::from_parts(parts, Body::from(plain))
            }
            Err(e) => return e.into_response(),
        }
    } else {
        request
    };

    let response = next.run(request).await;
    if !wants_gzip || response.headers().contains_key(header::CONTENT_ENCODING) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let raw = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "Failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match compress(&raw) {
        Ok(packed) => {
            parts
                .headers
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static(GZIP));
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(packed))
        }
        Err(e) => {
            error!(error = %e, "Failed to gzip response");
            Response::from_parts(parts, Body::from(raw))
        }
    }
}

/// Open bodies marked `Content-Encryption: rsa-oaep-sha512`
async fn decrypt_body(State(ingestor): State<Ingestor>, request: Request, next: Next) -> Response {
    let scheme = match header_str(request.headers(), ENCRYPTION_HEADER) {
        Some(scheme) => scheme.trim().to_ascii_lowercase(),
        None => return next.run(request).await,
    };
    if scheme != ENCRYPTION_SCHEME {
        return IngestError::Unreadable(format!("unsupported encryption {:?}", scheme))
            .into_response();
    }

    let (mut parts, body) = request.into_parts();
    let opened = match read_body(body).await {
        Ok(sealed) => ingestor.open(&sealed),
        Err(e) => Err(e),
    };
    match opened {
        Ok(plain) => {
            parts.headers.remove(ENCRYPTION_HEADER);
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(e) => e.into_response(),
    }
}

fn plain_value(value: MetricValue) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        value.to_string(),
    )
        .into_response()
}

async fn update_path(
    State(ingestor): State<Ingestor>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<Response, IngestError> {
    let stored = ingestor
        .update_path(&kind, &name, &value)
        .instrument(request_span("http", "/update/{type}/{name}/{value}"))
        .await?;
    let value = stored.metric_value()?;
    Ok(plain_value(value))
}

async fn update_json(
    State(ingestor): State<Ingestor>,
    body: Bytes,
) -> Result<Json<MetricDto>, IngestError> {
    let dto: MetricDto = serde_json::from_slice(&body)?;
    let stored = ingestor
        .update_one(dto)
        .instrument(request_span("http", "/update/"))
        .await?;
    Ok(Json(stored))
}

async fn update_batch(State(ingestor): State<Ingestor>, body: Bytes) -> Result<Response, IngestError> {
    let batch: Vec<MetricDto> = serde_json::from_slice(&body)?;
    let failed = ingestor
        .update_batch(batch)
        .instrument(request_span("http", "/updates/"))
        .await?;
    Ok(Json(failed).into_response())
}

async fn value_json(
    State(ingestor): State<Ingestor>,
    body: Bytes,
) -> Result<Json<MetricDto>, IngestError> {
    let query: MetricDto = serde_json::from_slice(&body)?;
    let found = ingestor
        .value(&query)
        .instrument(request_span("http", "/value/"))
        .await?;
    Ok(Json(found))
}

async fn value_path(
    State(ingestor): State<Ingestor>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, IngestError> {
    let value = ingestor
        .value_path(&kind, &name)
        .instrument(request_span("http", "/value/{type}/{name}"))
        .await?;
    Ok(plain_value(value))
}

async fn ping(State(ingestor): State<Ingestor>) -> Response {
    match ingestor.ping().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_metrics(State(ingestor): State<Ingestor>) -> Result<Html<String>, IngestError> {
    let items = ingestor.get_all().await?;

    let mut page = String::from(
        "<!DOCTYPE html>\n<html><head><title>Metrics</title></head><body>\n\
         <table>\n<tr><th>Type</th><th>Name</th><th>Value</th></tr>\n",
    );
    for item in &items {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            item.kind(),
            escape_html(&item.name),
            item.value
        );
    }
    page.push_str("</table>\n</body></html>\n");
    Ok(Html(page))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_routes() {
        assert!(is_protected("/update/"));
        assert!(is_protected("/update/counter/a/1"));
        assert!(is_protected("/updates/"));
        assert!(!is_protected("/value/"));
        assert!(!is_protected("/ping"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
