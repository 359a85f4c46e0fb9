//! Stats web UI — the small status surface some frontends scrape.
//!
//! `GET /webUI` renders the overview page, `?{"method":"get_speed_info"}`
//! returns aggregate speeds as JSON, and `/webUI/exit` shuts the engine
//! down.

use axum::extract::{RawQuery, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::engine::EngineCmd;

#[derive(Clone)]
struct StatsState {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
}

pub async fn serve(
    listener: TcpListener,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(handle_overview))
        .route("/webUI", get(handle_overview))
        .route("/webUI/exit", get(handle_exit))
        .with_state(StatsState { cmd_tx });
    tracing::info!(addr = %listener.local_addr()?, "stats gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_overview(State(state): State<StatsState>, RawQuery(query): RawQuery) -> Response {
    // The JSON-RPC-ish query arrives percent-encoded in the raw query
    // string; method detection by substring keeps every encoder happy.
    let query = query.unwrap_or_default();
    let decoded = percent_decode(&query);
    if decoded.contains("get_speed_info") {
        let (tx, rx) = oneshot::channel();
        let speeds = match state.cmd_tx.send(EngineCmd::SpeedInfo { resp: tx }) {
            Ok(()) => rx.await.unwrap_or((0.0, 0.0)),
            Err(_) => (0.0, 0.0),
        };
        let body = serde_json::json!({
            "success": true,
            "downspeed": speeds.0 / 1024.0,
            "upspeed": speeds.1 / 1024.0,
        });
        return body.to_string().into_response();
    }
    Html(
        "<!DOCTYPE html>\n<html><head><title>Swift Web Interface</title></head>\n\
         <body><h1>Swift Web Interface</h1>\n\
         <p>riptide engine is running.</p></body></html>\n",
    )
    .into_response()
}

async fn handle_exit(State(state): State<StatsState>) -> Response {
    let _ = state.cmd_tx.send(EngineCmd::Shutdown);
    Html("<html><body>Swift is no longer running</body></html>\n").into_response()
}

/// Minimal percent-decoding, enough for %22-quoted JSON method strings.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_quoted_json() {
        assert_eq!(
            percent_decode("&{%22method%22:%22get_speed_info%22}"),
            "&{\"method\":\"get_speed_info\"}"
        );
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
