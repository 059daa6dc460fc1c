//! HTTP surface: the three-step stream handshake plus health and publish.

use crate::config::{AllowedOrigins, MAX_HEARTBEAT_INTERVAL};
use crate::connection::{Connection, ConnectionRegistry, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::manager::{SubscriptionManager, SubscriptionRequest};
use crate::protocol::{
    connected_event, ping_event, HealthResponse, OperationRequest, PublishRequest,
    PublishResponse, StreamFrame, StreamQuery, UnregisterQuery, STREAM_TOKEN_HEADER,
};
use crate::publisher::EventPublisher;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use metrics::gauge;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

/// Events buffered between the stream task and the HTTP body.
const SSE_CHANNEL_SIZE: usize = 16;

/// Request headers passed through to the execution engine.
const FORWARDED_HEADERS: [HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub manager: SubscriptionManager,
    /// Present when the publish endpoint is enabled.
    pub publisher: Option<EventPublisher>,
    pub heartbeat_interval: Duration,
}

impl AppState {
    /// Complete every operation, then close every stream.
    pub async fn shutdown(&self) {
        let completed = self.manager.shutdown().await;
        let closed = self.registry.close_all().await;
        info!(
            "Completed {} subscriptions and closed {} connections",
            completed, closed
        );
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>, origins: &AllowedOrigins) -> Router {
    let mut router = Router::new()
        .route(
            "/stream",
            get(open_stream_handler)
                .put(reserve_handler)
                .post(register_handler)
                .delete(unregister_handler),
        )
        .route("/health", get(health_handler));

    if state.publisher.is_some() {
        router = router.route("/publish", post(publish_handler));
    }

    router.with_state(state).layer(cors_layer(origins))
}

pub fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    match origins {
        AllowedOrigins::Any => CorsLayer::permissive(),
        AllowedOrigins::List(list) => {
            let origins: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Ignoring invalid allowed origin {:?}", origin);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    HeaderName::from_static(STREAM_TOKEN_HEADER),
                ])
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.count(),
        subscriptions: state.manager.subscription_count(),
        topics: state.manager.topic_count(),
    })
}

/// `PUT /stream`: issue a reservation token.
async fn reserve_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = state.registry.reserve();
    (StatusCode::OK, connection.token().to_string())
}

/// `POST /stream`: register an operation on a reserved or streaming token.
async fn register_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let token = stream_token(&headers)?;
    let request: OperationRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;
    let operation_id = request
        .extensions
        .operation_id
        .ok_or_else(|| GatewayError::InvalidOperationId("extensions.operationId is required".into()))?;

    let subscription = SubscriptionRequest {
        query: request.query,
        variables: request.variables.unwrap_or_default(),
        operation_name: request.operation_name,
        headers: forwarded_headers(&headers),
    };
    state
        .registry
        .register_operation(&token, &operation_id, subscription)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// `DELETE /stream?operationId=`: stop one operation.
async fn unregister_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UnregisterQuery>,
) -> Result<StatusCode> {
    let token = stream_token(&headers)?;
    let operation_id = query
        .operation_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::InvalidOperationId("operationId is required".into()))?;

    if !state
        .registry
        .unregister_operation(&token, &operation_id)
        .await?
    {
        debug!("Unregister of unknown operation {}", operation_id);
    }
    Ok(StatusCode::OK)
}

/// `GET /stream?token=`: open the event stream.
async fn open_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<ReceiverStream<std::result::Result<Event, Infallible>>>> {
    let token = query
        .token
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::MissingToken)?;
    let (connection, frames) = state.registry.open_stream(&token)?;

    let (tx, rx) = mpsc::channel(SSE_CHANNEL_SIZE);
    tokio::spawn(run_stream(
        state.registry.clone(),
        connection,
        frames,
        tx,
        state.heartbeat_interval,
    ));
    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// `POST /publish`: ingest a domain event.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    let publisher = state
        .publisher
        .as_ref()
        .ok_or_else(|| GatewayError::Internal("publishing is disabled".into()))?;
    let request: PublishRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;

    let topics = publisher
        .publish_event(&request.event, &request.args, &request.payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { topics })))
}

fn stream_token(headers: &HeaderMap) -> Result<String> {
    headers
        .get(STREAM_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::MissingToken)
}

fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Pump frames and heartbeats into the SSE body until the client leaves
/// or the connection is closed, then release the connection.
async fn run_stream(
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    mut frames: mpsc::Receiver<StreamFrame>,
    out: mpsc::Sender<std::result::Result<Event, Infallible>>,
    heartbeat: Duration,
) {
    gauge!("gateway_active_streams").increment(1.0);
    let cancel = connection.cancel_token().clone();

    let final_state = if out.send(Ok(connected_event())).await.is_err() {
        ConnectionState::Disconnected
    } else {
        let heartbeat = heartbeat.min(MAX_HEARTBEAT_INTERVAL);
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // Deliver the complete frames queued by shutdown.
                    while let Ok(frame) = frames.try_recv() {
                        if out.send(Ok(frame.to_event())).await.is_err() {
                            break;
                        }
                    }
                    break ConnectionState::Disconnected;
                }

                _ = out.closed() => break ConnectionState::Disconnected,

                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break ConnectionState::Disconnected;
                    };
                    if out.send(Ok(frame.to_event())).await.is_err() {
                        warn!("Failed to write frame to connection {}", connection.id());
                        break ConnectionState::Error;
                    }
                }

                _ = ticker.tick() => {
                    if out.send(Ok(ping_event())).await.is_err() {
                        break ConnectionState::Error;
                    }
                }
            }
        }
    };

    registry.close(connection.token(), final_state).await;
    gauge!("gateway_active_streams").decrement(1.0);
}
