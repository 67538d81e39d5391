//! Axum JSON API over slot templates, date overrides and the provisioning scheduler.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;
use slotcap_core::{CapacityTemplate, DateCapacity, SlotLimit, YearMonth};
use slotcap_provision::{CapacityScheduler, Provisioner};
use tokio::net::TcpListener;
use tracing::info;

mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "slotcap-web";

/// Per-date slot limits as posted by operators: `{"2024-01-02": {"morning": 5}}`.
type DateLimitsBody = BTreeMap<NaiveDate, BTreeMap<String, u32>>;

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Provisioner,
    pub scheduler: Arc<CapacityScheduler>,
}

impl AppState {
    pub fn new(provisioner: Provisioner, scheduler: Arc<CapacityScheduler>) -> Self {
        Self {
            provisioner,
            scheduler,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SpecialQuery {
    month: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AutoAddQuery {
    add: Option<String>,
    cover: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/get-timeslot", get(get_timeslot_handler))
        .route("/add-timeslot", post(add_timeslot_handler))
        .route("/update-timeslot", put(update_timeslot_handler))
        .route("/get-special", get(get_special_handler))
        .route("/add-special", post(add_special_handler))
        .route("/add-order", put(add_order_handler))
        .route("/auto-add", post(auto_add_handler))
        .route("/start-scheduler", post(start_scheduler_handler))
        .route("/stop-scheduler", post(stop_scheduler_handler))
        .route("/scheduler-status", get(scheduler_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_timeslot_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let template = CapacityTemplate::from_limits(state.provisioner.templates().list_defaults().await?);
    Ok(Json(template).into_response())
}

async fn add_timeslot_handler(
    State(state): State<Arc<AppState>>,
    Json(limit): Json<SlotLimit>,
) -> Result<Response, ApiError> {
    if limit.slot.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_slot", "time_slot must not be empty"));
    }
    state.provisioner.templates().insert_default(&limit).await?;
    Ok((StatusCode::CREATED, Json(limit)).into_response())
}

async fn update_timeslot_handler(
    State(state): State<Arc<AppState>>,
    Json(limits): Json<BTreeMap<String, u32>>,
) -> Result<Response, ApiError> {
    let unknown = state.provisioner.templates().update_defaults(&limits).await?;
    Ok(Json(json!({ "result": "updated", "unknownSlots": unknown })).into_response())
}

async fn get_special_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SpecialQuery>,
) -> Result<Response, ApiError> {
    let today = Local::now().date_naive();
    let calendar = state.provisioner.dates().list_overrides_from(today).await?;

    if let Some(raw) = query.date.as_deref().filter(|s| !s.is_empty()) {
        let date: NaiveDate = raw
            .parse()
            .map_err(|_| ApiError::bad_request("invalid_date", format!("invalid date {raw:?}, expected YYYY-MM-DD")))?;
        return match calendar.slots_for(date) {
            Some(slots) => Ok(Json(json!({ date.to_string(): slots })).into_response()),
            None => Err(ApiError::not_found("date_not_found", format!("no capacity configured for {date}"))),
        };
    }

    if let Some(raw) = query.month.as_deref().filter(|s| !s.is_empty()) {
        let month: YearMonth = raw
            .parse()
            .map_err(|err: slotcap_core::YearMonthParseError| ApiError::bad_request("invalid_month", err.to_string()))?;
        return match calendar.month(month) {
            Some(dates) => Ok(Json(dates).into_response()),
            None => Err(ApiError::not_found("month_not_found", format!("no capacity configured for {month}"))),
        };
    }

    Ok(Json(calendar).into_response())
}

async fn add_special_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DateLimitsBody>,
) -> Result<Response, ApiError> {
    for (date, slots) in &body {
        let capacity = DateCapacity {
            date: *date,
            slots: slots.clone(),
        };
        state.provisioner.dates().write_date_capacity(&capacity).await?;
    }
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// Adjust limits of slots that already exist on a date; unknown slots are rejected up front.
async fn add_order_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DateLimitsBody>,
) -> Result<Response, ApiError> {
    let Some(earliest) = body.keys().next().copied() else {
        return Ok(Json(json!({ "result": "updated" })).into_response());
    };
    let store = state.provisioner.dates();
    let calendar = store.list_overrides_from(earliest).await?;
    for (date, slots) in &body {
        let existing = calendar.slots_for(*date);
        if existing.is_none() && !store.date_exists(*date).await? {
            return Err(ApiError::not_found(
                "date_not_found",
                format!("no capacity configured for {date}"),
            ));
        }
        if let Some(slot) = slots
            .keys()
            .find(|slot| !existing.is_some_and(|e| e.contains_key(*slot)))
        {
            return Err(ApiError::not_found(
                "slot_not_found",
                format!("no time slot {slot:?} configured for {date}"),
            ));
        }
    }

    for (date, slots) in &body {
        for (slot, limit) in slots {
            if !store.update_existing_slot_limit(*date, slot, *limit).await? {
                return Err(ApiError::not_found(
                    "slot_not_found",
                    format!("no time slot {slot:?} configured for {date}"),
                ));
            }
        }
    }
    Ok(Json(json!({ "result": "updated" })).into_response())
}

async fn auto_add_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AutoAddQuery>,
) -> Result<Response, ApiError> {
    let overwrite = query.cover.as_deref() == Some("true");
    let summary = state.provisioner.trigger(query.add.as_deref(), overwrite).await?;
    Ok(Json(json!({ "message": "capacity provisioned", "summary": summary })).into_response())
}

async fn start_scheduler_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.scheduler.start().await?;
    Ok(Json(json!({ "message": "scheduler started" })).into_response())
}

async fn stop_scheduler_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.scheduler.stop().await?;
    Ok(Json(json!({ "message": "scheduler stopped" })).into_response())
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use slotcap_provision::SchedulerConfig;
    use slotcap_storage::MemoryCapacityStore;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Arc<MemoryCapacityStore>) {
        let store = Arc::new(MemoryCapacityStore::with_template([
            SlotLimit::new("morning", 10),
            SlotLimit::new("evening", 8),
        ]));
        let provisioner = Provisioner::from_store(store.clone());
        let scheduler = Arc::new(CapacityScheduler::new(provisioner.clone(), SchedulerConfig::default()));
        (AppState::new(provisioner, scheduler), store)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn tomorrow() -> NaiveDate {
        Local::now().date_naive().succ_opt().unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_timeslot() {
        let (state, _) = test_state();
        let resp = app(state).oneshot(request("GET", "/get-timeslot", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["morning"], 10);
        assert_eq!(body["evening"], 8);
    }

    #[tokio::test]
    async fn add_timeslot_rejects_duplicates() {
        let (state, _) = test_state();
        let app = app(state);
        let created = app
            .clone()
            .oneshot(request("POST", "/add-timeslot", Some(json!({"time_slot": "noon", "limit_count": 4}))))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let dup = app
            .oneshot(request("POST", "/add-timeslot", Some(json!({"time_slot": "noon", "limit_count": 4}))))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(dup).await["code"], "slot_exists");
    }

    #[tokio::test]
    async fn auto_add_defaults_to_two_months_and_rejects_unknown_periods() {
        let (state, store) = test_state();
        let app = app(state);

        let resp = app.clone().oneshot(request("POST", "/auto-add", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["summary"]["period"], "twoMonths");
        let writes = store.mutation_count().await;

        let resp = app
            .oneshot(request("POST", "/auto-add?add=nextCentury&cover=true", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_period");
        assert_eq!(store.mutation_count().await, writes);
    }

    #[tokio::test]
    async fn special_dates_round_trip_through_the_api() {
        let (state, _) = test_state();
        let app = app(state);
        let date = tomorrow();

        let resp = app
            .clone()
            .oneshot(request("POST", "/add-special", Some(json!({ date.to_string(): {"morning": 3} }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/get-special?date={date}"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await[date.to_string()]["morning"], 3);

        let month = YearMonth::of(date);
        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/get-special?month={month}"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(request("GET", "/get-special?date=1999-01-01", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_order_only_updates_existing_slots() {
        let (state, store) = test_state();
        let date = tomorrow();
        store.seed_date(DateCapacity::new(date).with_slot("morning", 5)).await;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                "/add-order",
                Some(json!({ date.to_string(): {"morning": 4, "evening": 1} })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(store.date_capacity(date).await.unwrap()["morning"], 5);

        let resp = app
            .oneshot(request("PUT", "/add-order", Some(json!({ date.to_string(): {"morning": 4} }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.date_capacity(date).await.unwrap()["morning"], 4);
    }

    #[tokio::test]
    async fn add_order_reports_missing_dates_separately_from_missing_slots() {
        let (state, store) = test_state();
        let date = tomorrow();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(request("PUT", "/add-order", Some(json!({ date.to_string(): {"morning": 4} }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["code"], "date_not_found");

        store.seed_date(DateCapacity::new(date)).await;
        let resp = app
            .oneshot(request("PUT", "/add-order", Some(json!({ date.to_string(): {"morning": 4} }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["code"], "slot_not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_endpoints_follow_the_lifecycle() {
        let (state, _) = test_state();
        let app = app(state);

        let status = app.clone().oneshot(request("GET", "/scheduler-status", None)).await.unwrap();
        assert_eq!(json_body(status).await["schedulerActive"], false);

        let stop = app.clone().oneshot(request("POST", "/stop-scheduler", None)).await.unwrap();
        assert_eq!(stop.status(), StatusCode::CONFLICT);

        let start = app.clone().oneshot(request("POST", "/start-scheduler", None)).await.unwrap();
        assert_eq!(start.status(), StatusCode::OK);
        let again = app.clone().oneshot(request("POST", "/start-scheduler", None)).await.unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(again).await["code"], "already_active");

        let status = app.clone().oneshot(request("GET", "/scheduler-status", None)).await.unwrap();
        assert_eq!(json_body(status).await["schedulerActive"], true);

        let stop = app.oneshot(request("POST", "/stop-scheduler", None)).await.unwrap();
        assert_eq!(stop.status(), StatusCode::OK);
    }
}
