use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_core::stream::Stream;
use ledgersync_core::{
    credentials::{CredentialMetadata, DecryptedCredential},
    sync::SyncMode,
};
use ledgersync_exchanges::{DefaultAdapterFactory, TimeWindow};
use ledgersync_sync::SyncStatusView;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    main_lib::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentialRequest {
    pub exchange_id: String,
    pub region: Option<String>,
    pub product_variant: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    pub credential: DecryptedCredential,
}

async fn store_credential(
    Path(account_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StoreCredentialRequest>,
) -> ApiResult<(StatusCode, Json<CredentialMetadata>)> {
    let exchange_id = body.exchange_id.trim().to_ascii_uppercase();
    if !DefaultAdapterFactory::supported_exchanges()
        .iter()
        .any(|id| *id == exchange_id)
    {
        return Err(ApiError::BadRequest(format!(
            "Unsupported exchange '{}'",
            body.exchange_id
        )));
    }

    let mut metadata = CredentialMetadata::new(exchange_id).with_testnet(body.testnet);
    if let Some(region) = body.region {
        metadata = metadata.with_region(region);
    }
    if let Some(variant) = body.product_variant {
        metadata = metadata.with_product_variant(variant);
    }

    let stored = state
        .vault
        .store(&account_id, metadata, &body.credential)?;
    tracing::info!(
        "Stored {} credential for account {}",
        stored.exchange_id,
        account_id
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn delete_credential(
    Path(account_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<StatusCode> {
    if state.sync_service.is_running(&account_id) {
        return Err(ApiError::Conflict(format!(
            "Account '{}' has a sync in flight",
            account_id
        )));
    }
    state.vault.remove(&account_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRequest {
    pub account_id: String,
    #[serde(default)]
    pub mode: SyncMode,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
}

impl StartSyncRequest {
    fn range(&self) -> ApiResult<Option<TimeWindow>> {
        match (self.range_start, self.range_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Ok(Some(TimeWindow::new(start, end))),
            _ => Err(ApiError::BadRequest(
                "rangeStart and rangeEnd must be given together".into(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncResponse {
    pub run_id: String,
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartSyncRequest>,
) -> ApiResult<(StatusCode, Json<StartSyncResponse>)> {
    let range = body.range()?;
    let run_id = state
        .sync_service
        .start_sync_with_range(&body.account_id, body.mode, range)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartSyncResponse { run_id })))
}

async fn get_sync_status(
    Path(run_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SyncStatusView>> {
    Ok(Json(state.sync_service.get_sync_status(&run_id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSyncResponse {
    pub run_id: String,
    /// False when the run had already finished.
    pub cancelled: bool,
}

async fn cancel_sync(
    Path(run_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CancelSyncResponse>> {
    let cancelled = state.sync_service.cancel_sync(&run_id).await?;
    Ok(Json(CancelSyncResponse { run_id, cancelled }))
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = BroadcastStream::new(state.event_bus.subscribe());
    let stream = tokio_stream::StreamExt::filter_map(receiver, |event| match event {
        Ok(evt) => {
            let sse_event = SseEvent::default().event(evt.name);
            let sse_event = if let Some(payload) = evt.payload {
                match sse_event.json_data(payload) {
                    Ok(ev) => ev,
                    Err(err) => {
                        tracing::error!(
                            "Failed to serialize SSE payload for {}: {}",
                            evt.name,
                            err
                        );
                        return None;
                    }
                }
            } else {
                sse_event.data("null")
            };
            Some(Ok(sse_event))
        }
        Err(BroadcastStreamRecvError::Lagged(_)) => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = if config.cors_allow.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins = config
            .cors_allow
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(origin) => Some(origin),
                Err(_) => {
                    tracing::warn!("Ignoring invalid CORS origin {}", o);
                    None
                }
            })
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(origins)
    };
    cors.allow_methods(Any).allow_headers(Any)
}

pub fn app_router(state: Arc<AppState>, config: &Config) -> Router {
    let api = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/accounts/{id}/credentials",
            post(store_credential).delete(delete_credential),
        )
        .route("/sync", post(start_sync))
        .route("/sync/{run_id}", get(get_sync_status))
        .route("/sync/{run_id}/cancel", post(cancel_sync))
        .route("/events/stream", get(stream_events));

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(cors_layer(config))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}
