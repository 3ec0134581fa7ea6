//! HTTP control surface: health plus the user actions a chat front end drives.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::core::health::{HealthStatus, ServiceStatus};
use crate::core::{HealthChecker, MessageId, TrackerError, UserId};
use crate::tracking::{MetricsSnapshot, Tracker};

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Clone)]
pub struct ControlState {
    pub tracker: Arc<Tracker>,
    pub health: HealthChecker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct CredentialsBody {
    login: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct TrackingQuery {
    message_id: Option<MessageId>,
}

#[derive(Serialize)]
struct ServiceHealth {
    #[serde(flatten)]
    status: HealthStatus,
    active_jobs: usize,
    tracking: MetricsSnapshot,
}

pub fn routes(state: ControlState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(health_handler);

    let credentials = warp::path!("users" / UserId / "credentials")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(credentials_handler);

    let enable = warp::path!("users" / UserId / "tracking")
        .and(warp::post())
        .and(warp::query::<TrackingQuery>())
        .and(with_state(state.clone()))
        .and_then(enable_handler);

    let disable = warp::path!("users" / UserId / "tracking")
        .and(warp::delete())
        .and(warp::query::<TrackingQuery>())
        .and(with_state(state))
        .and_then(disable_handler);

    health.or(credentials).or(enable).or(disable)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: ControlState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let (addr, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown)?;
    tracing::info!("✅ Control API listening on {}", addr);

    server.await;
    Ok(())
}

fn with_state(state: ControlState) -> impl Filter<Extract = (ControlState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn health_handler(state: ControlState) -> Result<WithStatus<Json>, Rejection> {
    let body = ServiceHealth {
        status: state.health.get_status().await,
        active_jobs: state.tracker.active_jobs().await,
        tracking: state.tracker.metrics().snapshot(),
    };
    let code = match body.status.status {
        ServiceStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), code))
}

async fn credentials_handler(
    user_id: UserId,
    body: CredentialsBody,
    state: ControlState,
) -> Result<WithStatus<Json>, Rejection> {
    let result = state
        .tracker
        .authenticate(user_id, &body.login, &body.password)
        .await;
    Ok(respond(result))
}

async fn enable_handler(
    user_id: UserId,
    query: TrackingQuery,
    state: ControlState,
) -> Result<WithStatus<Json>, Rejection> {
    let result = state
        .tracker
        .enable_tracking(user_id, query.message_id)
        .await;
    Ok(respond(result))
}

async fn disable_handler(
    user_id: UserId,
    query: TrackingQuery,
    state: ControlState,
) -> Result<WithStatus<Json>, Rejection> {
    let result = state
        .tracker
        .disable_tracking(user_id, query.message_id)
        .await;
    Ok(respond(result.map(|_| ())))
}

fn respond(result: crate::core::Result<()>) -> WithStatus<Json> {
    match result {
        Ok(()) => warp::reply::with_status(
            warp::reply::json(&ControlResponse {
                success: true,
                error: None,
            }),
            StatusCode::OK,
        ),
        Err(err) => {
            let status = error_status(&err);
            if status.is_server_error() {
                tracing::error!("Control request failed: {}", err);
            }
            warp::reply::with_status(
                warp::reply::json(&ControlResponse {
                    success: false,
                    error: Some(public_message(&err)),
                }),
                status,
            )
        }
    }
}

fn error_status(err: &TrackerError) -> StatusCode {
    match err {
        TrackerError::Auth(_) => StatusCode::UNAUTHORIZED,
        TrackerError::NotAuthenticated(_) | TrackerError::Decryption(_) => StatusCode::CONFLICT,
        TrackerError::Network(_) => StatusCode::BAD_GATEWAY,
        TrackerError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Marketplace rejections are passed through verbatim.
fn public_message(err: &TrackerError) -> String {
    match err {
        TrackerError::Auth(reason) => reason.clone(),
        other => other.to_string(),
    }
}
