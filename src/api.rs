//! Viewer-facing query API
//!
//! JSON routes over the analytics engine. `{context}` is either `shared` or a
//! numeric owner id; `{channel}` is a channel id such as `V0`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use matrixon_analytics::{
    Alert, AnalyticsEngine, AnomalyRecord, ChannelProfile, DataPoint, EnergyReport, Insight, Prediction,
    RollingStatistics, Severity,
};
use matrixon_common::{ChannelId, OwnerContext};
use matrixon_iot::Broadcaster;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

/// Default number of anomalies returned by list endpoints
pub const DEFAULT_ANOMALY_LIMIT: usize = 10;
/// Default number of points returned by `recent`
pub const DEFAULT_RECENT_COUNT: usize = 50;

#[derive(Clone)]
pub struct ApiState {
    pub analytics: Arc<AnalyticsEngine>,
    pub broadcaster: Arc<Broadcaster>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn context(raw: &str) -> Result<OwnerContext, ApiError> {
    raw.parse().map_err(|err: matrixon_common::MatrixonError| ApiError::BadRequest(err.to_string()))
}

fn channel(raw: &str) -> Result<ChannelId, ApiError> {
    raw.parse().map_err(|err: matrixon_common::MatrixonError| ApiError::BadRequest(err.to_string()))
}

fn severity(raw: Option<&str>) -> Result<Option<Severity>, ApiError> {
    raw.map(|raw| raw.parse::<Severity>().map_err(|err| ApiError::BadRequest(err.to_string())))
        .transpose()
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/analytics/:context/channels", get(channels))
        .route("/api/v1/analytics/:context/channels/:channel/stats", get(stats))
        .route("/api/v1/analytics/:context/channels/:channel/trend", get(trend))
        .route("/api/v1/analytics/:context/channels/:channel/recent", get(recent))
        .route("/api/v1/analytics/:context/channels/:channel/prediction", get(prediction))
        .route("/api/v1/analytics/:context/anomalies", get(anomalies).delete(clear_anomalies))
        .route("/api/v1/analytics/:context/alerts", get(alerts))
        .route("/api/v1/analytics/:context/sensitivity", put(set_sensitivity).get(sensitivity))
        .route("/api/v1/analytics/:context/insights", post(insights))
        .route("/api/v1/analytics/:context/energy", post(energy))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "viewers": state.broadcaster.viewer_count(),
        "deviceConnected": state.broadcaster.device_connected(),
    }))
}

async fn channels(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResult<Vec<ChannelId>> {
    Ok(Json(state.analytics.channels(context(&raw)?).await))
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    window_ms: Option<u64>,
}

async fn stats(
    State(state): State<ApiState>,
    Path((raw_context, raw_channel)): Path<(String, String)>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<RollingStatistics> {
    let window = query.window_ms.map(Duration::from_millis);
    let stats = state
        .analytics
        .stats(context(&raw_context)?, channel(&raw_channel)?, window)
        .await;
    Ok(Json(stats))
}

#[derive(Debug, Default, Deserialize)]
struct TrendQuery {
    window: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TrendResponse {
    channel: ChannelId,
    trend: f64,
}

async fn trend(
    State(state): State<ApiState>,
    Path((raw_context, raw_channel)): Path<(String, String)>,
    Query(query): Query<TrendQuery>,
) -> ApiResult<TrendResponse> {
    let channel = channel(&raw_channel)?;
    let window = query.window.unwrap_or(matrixon_analytics::stats::DEFAULT_TREND_WINDOW);
    let trend = state.analytics.trend(context(&raw_context)?, channel, window).await;
    Ok(Json(TrendResponse { channel, trend }))
}

#[derive(Debug, Default, Deserialize)]
struct RecentQuery {
    count: Option<usize>,
}

async fn recent(
    State(state): State<ApiState>,
    Path((raw_context, raw_channel)): Path<(String, String)>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Vec<DataPoint>> {
    let count = query.count.unwrap_or(DEFAULT_RECENT_COUNT);
    let points = state
        .analytics
        .recent(context(&raw_context)?, channel(&raw_channel)?, count)
        .await;
    Ok(Json(points))
}

async fn prediction(
    State(state): State<ApiState>,
    Path((raw_context, raw_channel)): Path<(String, String)>,
) -> ApiResult<Prediction> {
    let channel = channel(&raw_channel)?;
    state
        .analytics
        .predict(context(&raw_context)?, channel)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("not enough history on {channel} for a prediction")))
}

#[derive(Debug, Default, Deserialize)]
struct AnomalyQuery {
    limit: Option<usize>,
    channel: Option<String>,
    severity: Option<String>,
}

#[instrument(level = "debug", skip(state))]
async fn anomalies(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Query(query): Query<AnomalyQuery>,
) -> ApiResult<Vec<AnomalyRecord>> {
    let context = context(&raw)?;
    let limit = query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);
    let wanted = severity(query.severity.as_deref())?;

    let records = match query.channel.as_deref() {
        Some(raw_channel) => {
            let mut records = state.analytics.anomalies_for_channel(context, channel(raw_channel)?).await;
            records.truncate(limit);
            records
        }
        None => state.analytics.recent_anomalies(context, limit).await,
    };
    let records = records
        .into_iter()
        .filter(|record| wanted.map_or(true, |wanted| record.severity == wanted))
        .collect();
    Ok(Json(records))
}

async fn clear_anomalies(State(state): State<ApiState>, Path(raw): Path<String>) -> Result<StatusCode, ApiError> {
    state.analytics.clear_anomalies(context(&raw)?).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
    severity: Option<String>,
}

async fn alerts(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Vec<Alert>> {
    let wanted = severity(query.severity.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);
    let alerts = state
        .analytics
        .alerts(context(&raw)?, &[], limit, wanted, Utc::now())
        .await;
    Ok(Json(alerts))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SensitivityBody {
    pub value: f64,
}

async fn sensitivity(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResult<SensitivityBody> {
    let value = state.analytics.sensitivity(context(&raw)?).await;
    Ok(Json(SensitivityBody { value }))
}

async fn set_sensitivity(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Json(body): Json<SensitivityBody>,
) -> ApiResult<SensitivityBody> {
    if !body.value.is_finite() {
        return Err(ApiError::BadRequest("sensitivity must be a finite number".to_string()));
    }
    let value = state.analytics.set_sensitivity(context(&raw)?, body.value).await;
    Ok(Json(SensitivityBody { value }))
}

/// Channel profile plus its latest value, as posted by viewers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReading {
    #[serde(flatten)]
    pub profile: ChannelProfile,
    pub current: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReadings {
    pub channels: Vec<ChannelReading>,
}

impl ChannelReadings {
    fn into_pairs(self) -> Vec<(ChannelProfile, f64)> {
        self.channels
            .into_iter()
            .map(|reading| (reading.profile, reading.current))
            .collect()
    }
}

async fn insights(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Json(body): Json<ChannelReadings>,
) -> ApiResult<Vec<Insight>> {
    let context = context(&raw)?;
    debug!("🔍 Composing insights for {} channels of {}", body.channels.len(), context);
    Ok(Json(state.analytics.insights(context, body.into_pairs(), Utc::now()).await))
}

async fn energy(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Json(body): Json<ChannelReadings>,
) -> ApiResult<EnergyReport> {
    let context = context(&raw)?;
    Ok(Json(state.analytics.energy_report(context, body.into_pairs(), Utc::now()).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use matrixon_common::OwnerId;
    use matrixon_iot::Topology;
    use tower::ServiceExt;

    const OWNER: OwnerContext = OwnerContext::Owner(OwnerId(7));
    const V0: ChannelId = ChannelId::new(0);

    async fn state_with_history() -> ApiState {
        let analytics = Arc::new(AnalyticsEngine::default());
        let start = Utc::now() - ChronoDuration::seconds(60);
        for (i, value) in [10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 15.0]
            .iter()
            .enumerate()
        {
            analytics
                .ingest(OWNER, V0, *value, start + ChronoDuration::seconds(i as i64))
                .await;
        }
        ApiState {
            analytics,
            broadcaster: Arc::new(Broadcaster::new(Topology::PerOwner)),
        }
    }

    async fn call(state: ApiState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(state_with_history().await, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["deviceConnected"], false);
    }

    #[tokio::test]
    async fn test_channels_and_stats() {
        let state = state_with_history().await;

        let (status, body) = call(state.clone(), get("/api/v1/analytics/7/channels")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["V0"]));

        let (_, body) = call(state.clone(), get("/api/v1/analytics/7/channels/V0/stats")).await;
        assert_eq!(body["count"], 11);
        assert_eq!(body["max"], 15.0);

        let (_, body) = call(state.clone(), get("/api/v1/analytics/shared/channels/V0/stats")).await;
        assert_eq!(body["count"], 0);

        let (_, body) = call(state, get("/api/v1/analytics/7/channels/V0/recent?count=2")).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[1]["value"], 15.0);
    }

    #[tokio::test]
    async fn test_bad_path_parameters() {
        let state = state_with_history().await;

        let (status, body) = call(state.clone(), get("/api/v1/analytics/nobody/channels")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("owner context"));

        let (status, _) = call(state, get("/api/v1/analytics/7/channels/X9/stats")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_prediction_requires_history() {
        let state = state_with_history().await;

        let (status, body) = call(state.clone(), get("/api/v1/analytics/7/channels/V0/prediction")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], "V0");

        let (status, _) = call(state, get("/api/v1/analytics/7/channels/V1/prediction")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_anomaly_listing_and_clearing() {
        let state = state_with_history().await;

        let (_, body) = call(state.clone(), get("/api/v1/analytics/7/anomalies?severity=critical")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["severity"], "critical");

        let (_, body) = call(state.clone(), get("/api/v1/analytics/7/alerts")).await;
        assert_eq!(body[0]["label"], "V0");

        let (status, _) = call(state.clone(), get("/api/v1/analytics/7/anomalies?severity=extreme")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/analytics/7/anomalies")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(state.clone(), request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(state, get("/api/v1/analytics/7/anomalies")).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_sensitivity_is_clamped() {
        let state = state_with_history().await;

        let (status, body) = call(
            state.clone(),
            send("PUT", "/api/v1/analytics/7/sensitivity", json!({"value": 9.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], 3.5);

        let (_, body) = call(state, get("/api/v1/analytics/7/sensitivity")).await;
        assert_eq!(body["value"], 3.5);
    }

    #[tokio::test]
    async fn test_insights_and_energy() {
        let state = state_with_history().await;
        let readings = json!({
            "channels": [{"channel": "V0", "label": "Temperature", "max": 50.0, "current": 15.0}]
        });

        let (status, body) = call(
            state.clone(),
            send("POST", "/api/v1/analytics/7/insights", readings.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let insights = body.as_array().unwrap();
        assert!(!insights.is_empty());
        assert!(insights.iter().any(|i| i["text"].as_str().unwrap().contains("Temperature")));

        let (status, body) = call(state, send("POST", "/api/v1/analytics/7/energy", readings)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["dailyKwh"].as_f64().is_some());
        assert!(body["efficiencyScore"].as_u64().unwrap() <= 100);
    }
}
