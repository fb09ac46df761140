//! Control-plane HTTP surface of the target
//!
//! One endpoint matters here: `POST /v1/txn/{bucket}/{phase}` carrying a
//! JSON action message. Validation failures come back as 4xx with a
//! machine-readable error kind in the body; commit errors additionally name
//! the transaction.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use tessera_common::types::{Namespace, Provider};
use tessera_common::{Bck, Config, Error};
use tessera_txn::{Coordinator, Phase, TxnRequest};

/// Header carrying the calling node's daemon id
pub const CALLER_HEADER: &str = "x-tessera-caller";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<Config>,
}

/// Build the target's control-plane router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/txn/{bucket}/{phase}", post(handle_txn))
        .route("/v1/health", get(handle_health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TxnQuery {
    /// Commit-phase timeout, duration string (e.g. "30s", "1500ms")
    txn_timeout: Option<String>,
    provider: Option<Provider>,
    ns_uuid: Option<String>,
    ns_name: Option<String>,
}

impl TxnQuery {
    fn bck(&self, bucket: String) -> Bck {
        Bck {
            name: bucket,
            provider: self.provider.unwrap_or_default(),
            ns: Namespace {
                uuid: self.ns_uuid.clone().unwrap_or_default(),
                name: self.ns_name.clone().unwrap_or_default(),
            },
        }
    }
}

#[derive(Serialize)]
struct ErrBody<'a> {
    error: ErrInfo<'a>,
}

#[derive(Serialize)]
struct ErrInfo<'a> {
    kind: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    txn_id: Option<String>,
}

fn error_response(err: &Error, txn_id: Option<String>) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrBody {
        error: ErrInfo {
            kind: err.kind(),
            message: err.to_string(),
            txn_id,
        },
    };
    (status, Json(body)).into_response()
}

async fn handle_txn(
    State(state): State<AppState>,
    Path((bucket, phase)): Path<(String, String)>,
    Query(query): Query<TxnQuery>,
    headers: HeaderMap,
    Json(req): Json<TxnRequest>,
) -> Response {
    let Some(phase) = Phase::parse(&phase) else {
        let err = Error::validation(format!("unknown transaction phase {phase:?}"));
        return error_response(&err, Some(req.txn_id));
    };
    let timeout = match &query.txn_timeout {
        Some(s) => match parse_duration(s) {
            Ok(d) => d,
            Err(err) => return error_response(&err, Some(req.txn_id)),
        },
        None => state.config.txn.default_timeout(),
    };
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bck = query.bck(bucket);
    let txn_id = req.txn_id.clone();
    debug!(%bck, phase = phase.as_str(), %txn_id, "txn rpc");

    // the coordinator blocks (filesystem syscalls, BMD waits)
    let coordinator = Arc::clone(&state.coordinator);
    let outcome = tokio::task::spawn_blocking(move || {
        coordinator.dispatch(&bck, phase, &req, timeout, &caller)
    })
    .await;
    match outcome {
        Ok(Ok(())) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
        Ok(Err(err)) => error_response(&err, Some(txn_id)),
        Err(join_err) => {
            let err = Error::validation(format!("transaction handler panicked: {join_err}"));
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({
                "error": { "kind": "ErrInternal", "message": err.to_string(), "txn_id": txn_id }
            })))
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct Health {
    mountpaths: usize,
    cap: tessera_fs::CapStatus,
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let vol = Arc::clone(state.coordinator.volume());
    let health = Health {
        mountpaths: vol.num_available(),
        cap: vol.get_cap_status(),
    };
    (StatusCode::OK, Json(health)).into_response()
}

/// Parse a duration string: bare seconds (`"30"`) or a value with an
/// `ms`/`s`/`m`/`h` suffix.
fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    let bad = || Error::validation(format!("bad duration {s:?}"));
    let (num, mult_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60 * 1000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 60 * 60 * 1000)
    } else {
        (s, 1000)
    };
    let n: u64 = num.trim().parse().map_err(|_| bad())?;
    Ok(Duration::from_millis(n * mult_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration(" 5s ").unwrap(), Duration::from_secs(5));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-3s").is_err());
    }
}
