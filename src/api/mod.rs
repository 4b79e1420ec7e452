use axum::extract::{ConnectInfo, Query, State};
use axum::routing::get;
use axum::{middleware, Json, Router};
use tokio::task;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::db::query::{load_exceedances, ExceedanceRecord, FrequencyAgg};
use crate::db::DbPool;
use crate::error::ApiError;

pub mod params;
pub mod rate_limit;

use params::RawExceedanceParams;
use rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub agg: FrequencyAgg,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    // The dashboard is served from arbitrary origins, same as before.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/noise-exceedances", get(get_exceedances))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce,
        ))
        .layer(cors)
        .with_state(state)
}

async fn get_exceedances(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(raw): Query<RawExceedanceParams>,
) -> Result<Json<Vec<ExceedanceRecord>>, ApiError> {
    log::info!("exceedance request from {addr}: {raw:?}");

    let query = match raw.validate() {
        Ok(query) => query,
        Err(e) => {
            log::warn!("rejected exceedance request: {e}");
            return Err(e);
        }
    };

    // Diesel is synchronous; the pooled connection is scoped to the blocking
    // closure and returns to the pool on every exit path.
    let agg = state.agg;
    let pool = state.pool.clone();
    let result = task::spawn_blocking(move || -> Result<Vec<ExceedanceRecord>, ApiError> {
        let mut conn = pool.get()?;
        load_exceedances(&mut conn, agg, &query)
    })
    .await
    .map_err(ApiError::from)?;

    match result {
        Ok(records) => {
            log::info!("exceedance request served, {} records", records.len());
            Ok(Json(records))
        }
        Err(e) => {
            log::error!("exceedance request failed: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    use crate::db::{self, testing};

    async fn test_router(rate_limit: u32) -> Router {
        let dir = tempfile::tempdir().unwrap();
        let (db_path, mut conn) = testing::seeded_db(&dir);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        testing::insert_measurement(&mut conn, 1, t0, 100_000_000, -20);
        testing::insert_measurement(&mut conn, 1, t0, 101_000_000, -30);
        testing::insert_measurement(&mut conn, 2, t0, 200_000_000, -90);
        drop(conn);

        let pool = db::build_pool(db_path.to_str().unwrap(), 2).unwrap();
        let agg = FrequencyAgg::detect(&mut pool.get().unwrap());
        let state = AppState {
            pool,
            agg,
            limiter: Arc::new(RateLimiter::new(rate_limit)),
        };

        // Keep the database file alive for the duration of the test.
        std::mem::forget(dir);

        router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn valid_request_returns_grouped_records() {
        let app = test_router(100).await;
        let (status, body) = fetch(
            app,
            "/api/noise-exceedances?start_datetime=2024-06-01T10:00:00\
             &end_datetime=2024-06-01T11:00:00&rssi_threshold=-50",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let records = body.as_array().unwrap();
        // Device B's -90 reading is below the threshold; only A's group survives.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["device_name"], "A");
        assert_eq!(records[0]["timestamp"], "2024-06-01T10:00:00");
        let mut frequencies: Vec<i64> = records[0]["frequencies"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f.as_i64().unwrap())
            .collect();
        frequencies.sort_unstable();
        assert_eq!(frequencies, vec![100_000_000, 101_000_000]);
    }

    #[tokio::test]
    async fn empty_window_returns_200_with_empty_array() {
        let app = test_router(100).await;
        let (status, body) = fetch(
            app,
            "/api/noise-exceedances?start_datetime=2030-01-01T00:00:00\
             &end_datetime=2030-01-02T00:00:00&rssi_threshold=-50",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn missing_parameters_return_422_with_field_details() {
        let app = test_router(100).await;
        let (status, body) = fetch(app, "/api/noise-exceedances").await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let detail = body["detail"].as_array().unwrap();
        assert_eq!(detail.len(), 3);
        assert_eq!(detail[0]["field"], "start_datetime");
    }

    #[tokio::test]
    async fn inverted_window_returns_422_naming_the_ordering_rule() {
        let app = test_router(100).await;
        let (status, body) = fetch(
            app,
            "/api/noise-exceedances?start_datetime=2024-06-01T11:00:00\
             &end_datetime=2024-06-01T10:00:00&rssi_threshold=-50",
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let detail = body["detail"].as_array().unwrap();
        assert_eq!(detail[0]["field"], "end_datetime");
        assert!(detail[0]["message"]
            .as_str()
            .unwrap()
            .contains("must be after"));
    }

    #[tokio::test]
    async fn exhausted_rate_limit_returns_429() {
        let app = test_router(1).await;
        let uri = "/api/noise-exceedances?start_datetime=2024-06-01T10:00:00\
                   &end_datetime=2024-06-01T11:00:00&rssi_threshold=-50";

        let (status, _) = fetch(app.clone(), uri).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = fetch(app, uri).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["detail"], "rate limit exceeded");
    }
}
