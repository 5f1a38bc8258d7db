use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use itinerary_api::{
    ItineraryPlannerApi, MergeTripRequest, PlanExport, PlanExportFormat, SaveTripRequest,
    UpdateItemRequest, API_CONTRACT_VERSION,
};
use itinerary_core::{ItemId, ItemPatch, Itinerary, ItineraryId, ItineraryItem, TripSuggestion};
use itinerary_store_sqlite::{SavedTrip, StoreError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// Identifies the requesting traveler. Session auth lives in the outer
/// gateway; this service trusts the forwarded identity header.
const OWNER_HEADER: &str = "x-owner-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ItineraryPlannerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RenameRequest {
    title: String,
}

#[derive(Debug, Clone, Serialize)]
struct TripDeleted {
    itinerary_id: ItineraryId,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ItemDeleted {
    item_id: ItemId,
    itinerary_id: ItineraryId,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ResequenceResult {
    itinerary_id: ItineraryId,
    rewritten_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
struct PlanRefreshed {
    itinerary_id: ItineraryId,
    refreshed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "itinerary-service")]
#[command(about = "Local HTTP service for trip itineraries")]
struct Args {
    #[arg(long, default_value = "./itineraries.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn service_error(status: StatusCode, message: impl Into<String>) -> ServiceError {
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: message.into(),
        status,
    }
}

fn map_store_error(err: StoreError) -> ServiceError {
    match err {
        // One opaque message for both cases, so a requester cannot probe
        // whether another traveler's itinerary exists.
        StoreError::NotFoundOrForbidden => service_error(StatusCode::NOT_FOUND, "not found"),
        StoreError::Validation(message) => service_error(StatusCode::BAD_REQUEST, message),
        StoreError::Storage(message) => {
            tracing::error!(error = %message, "storage failure");
            service_error(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
        }
    }
}

fn owner_id(headers: &HeaderMap) -> Result<String, ServiceError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            service_error(StatusCode::BAD_REQUEST, format!("missing {OWNER_HEADER} header"))
        })
}

fn parse_itinerary_id(raw: &str) -> Result<ItineraryId, ServiceError> {
    ItineraryId::parse(raw)
        .ok_or_else(|| service_error(StatusCode::BAD_REQUEST, format!("invalid itinerary id: {raw}")))
}

fn parse_item_id(raw: &str) -> Result<ItemId, ServiceError> {
    ItemId::parse(raw)
        .ok_or_else(|| service_error(StatusCode::BAD_REQUEST, format!("invalid item id: {raw}")))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/itineraries", get(trips_list))
        .route("/v1/itineraries/save", post(trip_save))
        .route("/v1/itineraries/:itinerary_id", get(trip_show).delete(trip_delete))
        .route("/v1/itineraries/:itinerary_id/merge", post(trip_merge))
        .route("/v1/itineraries/:itinerary_id/resequence", post(trip_resequence))
        .route("/v1/itineraries/:itinerary_id/plan/refresh", post(plan_refresh))
        .route("/v1/itineraries/:itinerary_id/title", put(trip_rename))
        .route("/v1/itineraries/:itinerary_id/export/:format", get(plan_export))
        .route("/v1/itinerary-items/:item_id", put(item_update).delete(item_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let state = ServiceState { api: ItineraryPlannerApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "itinerary service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<itinerary_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(map_store_error)?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<itinerary_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(map_store_error)?;
    Ok(Json(envelope(result)))
}

async fn trips_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<SavedTrip>>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let trips = state.api.list_trips(&owner).map_err(map_store_error)?;
    Ok(Json(envelope(trips)))
}

async fn trip_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(itinerary_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SavedTrip>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    let trip = state.api.get_trip(&owner, itinerary_id).map_err(map_store_error)?;
    Ok(Json(envelope(trip)))
}

async fn trip_save(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(suggestion): Json<TripSuggestion>,
) -> Result<Json<ServiceEnvelope<SavedTrip>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let trip = state
        .api
        .save_trip(SaveTripRequest { owner_id: owner, suggestion })
        .map_err(map_store_error)?;
    Ok(Json(envelope(trip)))
}

async fn trip_merge(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(itinerary_id): Path<String>,
    Json(suggestion): Json<TripSuggestion>,
) -> Result<Json<ServiceEnvelope<SavedTrip>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    let trip = state
        .api
        .merge_trip(MergeTripRequest { owner_id: owner, itinerary_id, suggestion })
        .map_err(map_store_error)?;
    Ok(Json(envelope(trip)))
}

async fn trip_resequence(
    State(state): State<ServiceState>,
    Path(itinerary_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ResequenceResult>>, ServiceError> {
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    let rewritten_rows = state.api.resequence(itinerary_id).map_err(map_store_error)?;
    Ok(Json(envelope(ResequenceResult { itinerary_id, rewritten_rows })))
}

async fn plan_refresh(
    State(state): State<ServiceState>,
    Path(itinerary_id): Path<String>,
) -> Result<Json<ServiceEnvelope<PlanRefreshed>>, ServiceError> {
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    state.api.refresh_plan(itinerary_id).map_err(map_store_error)?;
    Ok(Json(envelope(PlanRefreshed { itinerary_id, refreshed: true })))
}

async fn trip_rename(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(itinerary_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<ServiceEnvelope<Itinerary>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    let itinerary =
        state.api.rename_trip(&owner, itinerary_id, &request.title).map_err(map_store_error)?;
    Ok(Json(envelope(itinerary)))
}

async fn trip_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(itinerary_id): Path<String>,
) -> Result<Json<ServiceEnvelope<TripDeleted>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    state.api.delete_trip(&owner, itinerary_id).map_err(map_store_error)?;
    Ok(Json(envelope(TripDeleted { itinerary_id, deleted: true })))
}

async fn plan_export(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((itinerary_id, format)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<PlanExport>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let itinerary_id = parse_itinerary_id(&itinerary_id)?;
    let format = PlanExportFormat::parse(&format).ok_or_else(|| {
        service_error(StatusCode::BAD_REQUEST, format!("unsupported export format: {format}"))
    })?;
    let export = state.api.export_plan(&owner, itinerary_id, format).map_err(map_store_error)?;
    Ok(Json(envelope(export)))
}

async fn item_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
    Json(patch): Json<ItemPatch>,
) -> Result<Json<ServiceEnvelope<ItineraryItem>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let item_id = parse_item_id(&item_id)?;
    let item = state
        .api
        .update_item(UpdateItemRequest { owner_id: owner, item_id, patch })
        .map_err(map_store_error)?;
    Ok(Json(envelope(item)))
}

async fn item_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ItemDeleted>>, ServiceError> {
    let owner = owner_id(&headers)?;
    let item_id = parse_item_id(&item_id)?;
    let itinerary_id = state.api.delete_item(&owner, item_id).map_err(map_store_error)?;
    Ok(Json(envelope(ItemDeleted { item_id, itinerary_id, deleted: true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("itinerary-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: &std::path::Path) -> Router {
        app(ServiceState { api: ItineraryPlannerApi::new(db_path.to_path_buf()) })
    }

    fn suggestion_payload() -> serde_json::Value {
        serde_json::json!({
            "destination": "Lisbon",
            "country": "Portugal",
            "description": "A week of tiles and pastries",
            "best_time_to_visit": "April to June",
            "estimated_budget": { "low": 800, "high": 1500 },
            "highlights": ["Alfama Walking Tour", "Fado Dinner Show", "Tram 28 Ride", "Belem Tower"],
            "travel_style": ["food", "culture"],
            "duration": "5 days",
            "real_places": []
        })
    }

    fn get_request(uri: &str, owner: Option<&str>) -> Request<axum::body::Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        match builder.body(axum::body::Body::empty()) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    fn json_request(
        method: &str,
        uri: &str,
        owner: &str,
        payload: &serde_json::Value,
    ) -> Request<axum::body::Body> {
        match Request::builder()
            .uri(uri)
            .method(method)
            .header(OWNER_HEADER, owner)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(payload.to_string()))
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn data_str<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
        value.pointer(pointer).and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let response = send(test_router(&db_path), get_request("/v1/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let db_path = unique_temp_db_path();
        let response = send(test_router(&db_path), get_request("/v1/openapi", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/itineraries/save"));
        assert!(body.contains("/v1/itinerary-items/{item_id}"));
    }

    #[tokio::test]
    async fn save_and_show_round_trip() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let save_response = send(
            router.clone(),
            json_request("POST", "/v1/itineraries/save", "owner-1", &suggestion_payload()),
        )
        .await;
        assert_eq!(save_response.status(), StatusCode::OK);
        let saved = response_json(save_response).await;
        assert_eq!(data_str(&saved, "/data/itinerary/title"), Some("Lisbon, Portugal"));
        let itinerary_id = match data_str(&saved, "/data/itinerary/itinerary_id") {
            Some(id) => id.to_string(),
            None => panic!("missing itinerary id in response: {saved}"),
        };

        let show_response = send(
            router,
            get_request(&format!("/v1/itineraries/{itinerary_id}"), Some("owner-1")),
        )
        .await;
        assert_eq!(show_response.status(), StatusCode::OK);
        let shown = response_json(show_response).await;
        assert_eq!(
            shown.pointer("/data/item_count").and_then(serde_json::Value::as_u64),
            Some(4)
        );
        assert_eq!(
            shown.pointer("/data/day_count").and_then(serde_json::Value::as_u64),
            Some(2)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn foreign_owner_sees_an_opaque_not_found() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let save_response = send(
            router.clone(),
            json_request("POST", "/v1/itineraries/save", "owner-1", &suggestion_payload()),
        )
        .await;
        let saved = response_json(save_response).await;
        let itinerary_id = match data_str(&saved, "/data/itinerary/itinerary_id") {
            Some(id) => id.to_string(),
            None => panic!("missing itinerary id in response: {saved}"),
        };

        let show_response = send(
            router,
            get_request(&format!("/v1/itineraries/{itinerary_id}"), Some("intruder")),
        )
        .await;
        assert_eq!(show_response.status(), StatusCode::NOT_FOUND);
        let body = response_json(show_response).await;
        assert_eq!(body.get("error").and_then(serde_json::Value::as_str), Some("not found"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn missing_owner_header_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let response = send(test_router(&db_path), get_request("/v1/itineraries", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn item_update_validation_failure_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let save_response = send(
            router.clone(),
            json_request("POST", "/v1/itineraries/save", "owner-1", &suggestion_payload()),
        )
        .await;
        let saved = response_json(save_response).await;
        let item_id = match data_str(&saved, "/data/items/0/item_id") {
            Some(id) => id.to_string(),
            None => panic!("missing item id in response: {saved}"),
        };

        let patch = serde_json::json!({ "day_index": 0 });
        let response = send(
            router,
            json_request("PUT", &format!("/v1/itinerary-items/{item_id}"), "owner-1", &patch),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn merge_extends_the_trip_and_delete_item_resequences() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let save_response = send(
            router.clone(),
            json_request("POST", "/v1/itineraries/save", "owner-1", &suggestion_payload()),
        )
        .await;
        let saved = response_json(save_response).await;
        let itinerary_id = match data_str(&saved, "/data/itinerary/itinerary_id") {
            Some(id) => id.to_string(),
            None => panic!("missing itinerary id in response: {saved}"),
        };

        let merge_response = send(
            router.clone(),
            json_request(
                "POST",
                &format!("/v1/itineraries/{itinerary_id}/merge"),
                "owner-1",
                &suggestion_payload(),
            ),
        )
        .await;
        assert_eq!(merge_response.status(), StatusCode::OK);
        let merged = response_json(merge_response).await;
        assert_eq!(
            merged.pointer("/data/item_count").and_then(serde_json::Value::as_u64),
            Some(8)
        );
        assert_eq!(
            merged.pointer("/data/day_count").and_then(serde_json::Value::as_u64),
            Some(4)
        );

        let item_id = match data_str(&merged, "/data/items/0/item_id") {
            Some(id) => id.to_string(),
            None => panic!("missing item id in response: {merged}"),
        };
        let delete_request = match Request::builder()
            .uri(format!("/v1/itinerary-items/{item_id}"))
            .method("DELETE")
            .header(OWNER_HEADER, "owner-1")
            .body(axum::body::Body::empty())
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build delete request: {err}"),
        };
        let delete_response = send(router.clone(), delete_request).await;
        assert_eq!(delete_response.status(), StatusCode::OK);

        let show_response = send(
            router,
            get_request(&format!("/v1/itineraries/{itinerary_id}"), Some("owner-1")),
        )
        .await;
        let shown = response_json(show_response).await;
        assert_eq!(
            shown.pointer("/data/item_count").and_then(serde_json::Value::as_u64),
            Some(7)
        );
        // Day 1 lost its first stop; the survivors close to positions 0 and 1.
        assert_eq!(
            shown.pointer("/data/items/0/position").and_then(serde_json::Value::as_u64),
            Some(0)
        );
        assert_eq!(
            shown.pointer("/data/items/1/position").and_then(serde_json::Value::as_u64),
            Some(1)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn export_endpoint_rejects_unknown_formats() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let save_response = send(
            router.clone(),
            json_request("POST", "/v1/itineraries/save", "owner-1", &suggestion_payload()),
        )
        .await;
        let saved = response_json(save_response).await;
        let itinerary_id = match data_str(&saved, "/data/itinerary/itinerary_id") {
            Some(id) => id.to_string(),
            None => panic!("missing itinerary id in response: {saved}"),
        };

        let bad = send(
            router.clone(),
            get_request(&format!("/v1/itineraries/{itinerary_id}/export/xml"), Some("owner-1")),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let csv = send(
            router,
            get_request(&format!("/v1/itineraries/{itinerary_id}/export/csv"), Some("owner-1")),
        )
        .await;
        assert_eq!(csv.status(), StatusCode::OK);
        let value = response_json(csv).await;
        assert!(data_str(&value, "/data/digest").is_some_and(|digest| digest.starts_with("sha256:")));

        let _ = std::fs::remove_file(&db_path);
    }
}
