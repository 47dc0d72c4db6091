//! Query API route handlers.
//!
//! `?s=<unix seconds>` limits results to aircraft or fixes seen after that
//! instant. Aircraft keys in paths are hex ICAO addresses.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use sbs_core::plane::{PlaneDetail, PlaneSummary};
use sbs_core::types::*;

use crate::dispatcher::{DispatcherClosed, PlanesView};
use crate::web::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

// ---------------------------------------------------------------------------
// Query param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SinceParams {
    s: Option<String>,
}

impl SinceParams {
    /// Cutoff time. Anything unparseable means no cutoff.
    fn since(&self) -> Option<DateTime<Utc>> {
        let raw = self.s.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse::<f64>().ok().filter(|v| v.is_finite()) {
            Some(secs) => from_unix_secs(secs),
            None => {
                warn!("ignoring unparseable since parameter {raw:?}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a path key of 1 to 6 hex digits. `000000` is not an aircraft.
fn parse_key(raw: &str) -> Result<Icao, (StatusCode, String)> {
    let bad = || (StatusCode::BAD_REQUEST, format!("invalid aircraft key {raw:?}"));
    if raw.is_empty() || raw.len() > 6 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    match u32::from_str_radix(raw, 16) {
        Ok(0) | Err(_) => Err(bad()),
        Ok(val) => Ok(icao_from_u32(val)),
    }
}

fn unavailable(e: DispatcherClosed) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// GET /active: live aircraft, most recently seen first.
pub async fn api_active(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SinceParams>,
) -> ApiResult<Vec<PlaneSummary>> {
    state
        .dispatcher
        .active(params.since())
        .await
        .map(Json)
        .map_err(unavailable)
}

/// GET /planes: live aircraft plus stored ones no longer live.
pub async fn api_planes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SinceParams>,
) -> ApiResult<PlanesView> {
    state
        .dispatcher
        .planes(params.since())
        .await
        .map(Json)
        .map_err(unavailable)
}

/// GET /planes/:icao: one aircraft with its full trail and history.
pub async fn api_plane_detail(
    State(state): State<Arc<AppState>>,
    Path(icao): Path<String>,
) -> ApiResult<PlaneDetail> {
    let icao = parse_key(&icao)?;
    state
        .dispatcher
        .plane(icao)
        .await
        .map(Json)
        .map_err(unavailable)
}

/// GET /locations/:icao: stored and live fixes in order.
pub async fn api_locations(
    State(state): State<Arc<AppState>>,
    Path(icao): Path<String>,
    Query(params): Query<SinceParams>,
) -> ApiResult<Vec<Location>> {
    let icao = parse_key(&icao)?;
    state
        .dispatcher
        .locations(icao, params.since())
        .await
        .map(Json)
        .map_err(unavailable)
}

/// GET /locations
pub async fn api_locations_missing_key() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "aircraft key required: /locations/<hex>")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use chrono::{TimeDelta, TimeZone};
    use serde_json::Value;
    use tower::ServiceExt;

    use sbs_core::plane::PlaneAggregate;
    use sbs_core::store::{MemoryStore, PlaneStore};

    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::web::build_router;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    /// Store holding 010101 with two fixes and callsign BAW123.
    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut plane = PlaneAggregate::new([1, 1, 1]);
        let mut r = TrackingReport::new([1, 1, 1], 1, t(0));
        r.callsign = Some("BAW123".into());
        plane.apply(&r);
        for (at, lat) in [(1, 51.0), (2, 51.1)] {
            let mut r = TrackingReport::new([1, 1, 1], 3, t(at));
            r.lat = Some(lat);
            r.lon = Some(-0.4);
            plane.apply(&r);
        }
        store.save(&[plane]).unwrap();
        store
    }

    fn test_app(store: Arc<MemoryStore>) -> (Router, tempfile::TempDir) {
        let www = tempfile::tempdir().unwrap();
        std::fs::write(www.path().join("index.html"), "<h1>tracker</h1>").unwrap();

        let (dispatcher, handle, _reports) = Dispatcher::new(store, DispatcherConfig::default());
        tokio::spawn(dispatcher.run(std::future::pending()));
        let app = build_router(Arc::new(AppState { dispatcher: handle }), www.path());
        (app, www)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> Value {
        let (status, body) = get(app, uri).await;
        assert_eq!(status, StatusCode::OK, "GET {uri}");
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("ABCDEF").unwrap(), [0xAB, 0xCD, 0xEF]);
        assert_eq!(parse_key("abcdef").unwrap(), [0xAB, 0xCD, 0xEF]);
        assert_eq!(parse_key("1").unwrap(), [0, 0, 1]);
        assert!(parse_key("000000").is_err());
        assert!(parse_key("").is_err());
        assert!(parse_key("ABCDEF0").is_err());
        assert!(parse_key("XYZ").is_err());
        assert!(parse_key("+1").is_err());
    }

    #[test]
    fn test_since_param() {
        let p = |s: &str| SinceParams { s: Some(s.into()) }.since();
        assert_eq!(p("1717243200"), Some(t(0)));
        assert_eq!(p("1717243200.5"), Some(t(0) + TimeDelta::milliseconds(500)));
        assert_eq!(p("yesterday"), None);
        assert_eq!(p(""), None);
        assert_eq!(SinceParams { s: None }.since(), None);
    }

    #[tokio::test]
    async fn test_plane_detail_fresh_key() {
        let (app, _www) = test_app(Arc::new(MemoryStore::new()));
        let json = get_json(app, "/planes/ABCDEF").await;
        assert_eq!(json["icao"], "ABCDEF");
        assert!(json["last_seen"].is_null());
        assert_eq!(json["locations"].as_array().unwrap().len(), 0);
        assert_eq!(json["history"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_plane_detail_from_store() {
        let (app, _www) = test_app(seeded_store());
        let json = get_json(app, "/planes/10101").await;
        assert_eq!(json["icao"], "010101");
        assert_eq!(json["callsign"], "BAW123");
        assert_eq!(json["locations"].as_array().unwrap().len(), 2);
        assert_eq!(json["history"][0]["icao"], "010101");
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (app, _www) = test_app(Arc::new(MemoryStore::new()));
        for uri in ["/planes/XYZ", "/planes/000000", "/locations/GGGGGG", "/locations"] {
            let (status, _) = get(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "GET {uri}");
        }
    }

    #[tokio::test]
    async fn test_planes_current_and_past() {
        let (app, _www) = test_app(seeded_store());
        let json = get_json(app, "/planes").await;
        assert_eq!(json["current"].as_array().unwrap().len(), 0);
        assert_eq!(json["past"][0]["icao"], "010101");
        assert_eq!(json["past"][0]["callsigns"][0], "BAW123");
    }

    #[tokio::test]
    async fn test_active_ignores_bad_since() {
        let (app, _www) = test_app(Arc::new(MemoryStore::new()));
        let json = get_json(app, "/active?s=later").await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_locations_since() {
        let (app, _www) = test_app(seeded_store());
        let all = get_json(app.clone(), "/locations/010101").await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let uri = format!("/locations/010101?s={}", t(1).timestamp());
        let recent = get_json(app, &uri).await;
        assert_eq!(recent.as_array().unwrap().len(), 1);
        assert_eq!(recent[0]["lat"], 51.1);
    }

    #[tokio::test]
    async fn test_favicon_and_static_fallback() {
        let (app, _www) = test_app(Arc::new(MemoryStore::new()));
        let (status, _) = get(app.clone(), "/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get(app, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<h1>tracker</h1>");
    }

    #[tokio::test]
    async fn test_dispatcher_gone() {
        let (dispatcher, handle, _reports) =
            Dispatcher::new(Arc::new(MemoryStore::new()), DispatcherConfig::default());
        drop(dispatcher);
        let app = build_router(Arc::new(AppState { dispatcher: handle }), "www");

        let (status, _) = get(app, "/active").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
