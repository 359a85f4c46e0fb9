//! HTTP content gateway.
//!
//! `GET /<hexroot>[/<path>]` serves a swarm's content (or one sub-file of
//! a multi-file swarm), honoring single-range `Range: bytes=…` requests
//! with 206 responses. Every request runs its own cursor over the store;
//! ranges not yet downloaded are polled until they arrive.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use riptide_core::SwarmId;

use crate::engine::{EngineCmd, GwMeta, GwRead};

/// How long one request waits for content to arrive before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_SLICE: usize = 64 * 1024;

#[derive(Clone)]
struct GwState {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
}

pub async fn serve(
    listener: TcpListener,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/{*path}", get(handle_get))
        .with_state(GwState { cmd_tx });
    tracing::info!(addr = %listener.local_addr()?, "http gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get(
    State(state): State<GwState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let path = path.trim_start_matches('/');
    let (hexroot, subpath) = match path.split_once('/') {
        Some((h, s)) if !s.is_empty() => (h, Some(s.to_string())),
        _ => (path, None),
    };
    let Some(root) = riptide_core::parse_swarm_id(hexroot) else {
        return (StatusCode::NOT_FOUND, "unknown swarm\n").into_response();
    };

    // The entity extent; poll while the swarm's size is undiscovered.
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let meta = loop {
        match fetch_meta(&state, root, subpath.clone()).await {
            None => return (StatusCode::NOT_FOUND, "unknown swarm\n").into_response(),
            Some(meta) if meta.total > 0 => break meta,
            Some(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return (StatusCode::GATEWAY_TIMEOUT, "content not available\n")
                        .into_response();
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, meta.total));
    let (first, last, partial) = match range {
        None => (0, meta.total - 1, false),
        Some(Some((first, last))) => (first, last, true),
        Some(None) => {
            let content_range = format!("bytes */{}", meta.total);
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, content_range)],
                "unsatisfiable range\n",
            )
                .into_response();
        }
    };

    let body = match read_span(&state, root, meta, first, last, deadline).await {
        Ok(body) => body,
        Err(status) => return (status, "read failed\n").into_response(),
    };

    let mut response = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::ACCEPT_RANGES, "bytes");
    if partial {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {first}-{last}/{}", meta.total),
        );
    }
    response
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn fetch_meta(state: &GwState, root: SwarmId, subpath: Option<String>) -> Option<GwMeta> {
    let (tx, rx) = oneshot::channel();
    state
        .cmd_tx
        .send(EngineCmd::GwMeta {
            root,
            subpath,
            resp: tx,
        })
        .ok()?;
    rx.await.ok().flatten()
}

/// Sequentially read `[first, last]` of the entity, waiting for chunks the
/// swarm has not downloaded yet.
async fn read_span(
    state: &GwState,
    root: SwarmId,
    meta: GwMeta,
    first: u64,
    last: u64,
    deadline: tokio::time::Instant,
) -> Result<Vec<u8>, StatusCode> {
    let mut body = Vec::with_capacity((last - first + 1) as usize);
    let mut offset = meta.base + first;
    let end = meta.base + last;
    while offset <= end {
        let len = READ_SLICE.min((end - offset + 1) as usize);
        let (tx, rx) = oneshot::channel();
        state
            .cmd_tx
            .send(EngineCmd::GwRead {
                root,
                offset,
                len,
                resp: tx,
            })
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        match rx.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)? {
            GwRead::Data(data) if data.is_empty() => break,
            GwRead::Data(data) => {
                offset += data.len() as u64;
                body.extend_from_slice(&data);
            }
            GwRead::Pending => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(StatusCode::GATEWAY_TIMEOUT);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            GwRead::Gone => return Err(StatusCode::NOT_FOUND),
        }
    }
    Ok(body)
}

/// Parse a single-range `bytes=` header against an entity of `total`
/// bytes. Returns None for unsatisfiable or unsupported forms.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?.trim();
    // Multi-range requests are not required; serve the first part.
    let spec = spec.split(',').next()?.trim();
    if let Some(suffix) = spec.strip_prefix('-') {
        // bytes=-k : final k bytes
        let k: u64 = suffix.parse().ok()?;
        if k == 0 || total == 0 {
            return None;
        }
        let k = k.min(total);
        return Some((total - k, total - 1));
    }
    let (first, last) = spec.split_once('-')?;
    let first: u64 = first.parse().ok()?;
    if first >= total {
        return None;
    }
    let last = if last.is_empty() {
        total - 1
    } else {
        last.parse::<u64>().ok()?.min(total - 1)
    };
    if last < first {
        return None;
    }
    Some((first, last))
}
