use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::actuator::ACTUATORS;
use crate::controller::{Command, CommandSender, Outcome};
use crate::mode::Mode;
use crate::scheduler;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub commands: CommandSender,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/mode", post(api_mode))
        .route("/api/motors/on", post(api_motors_on))
        .route("/api/motors/off", post(api_motors_off))
        .route("/api/motors/{n}/toggle", post(api_toggle))
        .route("/api/timer", post(api_timer))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct ModeBody {
    mode: String,
}

#[derive(Deserialize)]
struct TimerBody {
    hours: u64,
}

async fn api_mode(
    State(state): State<AppState>,
    body: Result<Json<ModeBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let mode: Mode = body
        .mode
        .parse()
        .map_err(|e: crate::mode::UnknownMode| ApiError::bad_request(e.to_string()))?;
    dispatch(&state, Command::SetMode(mode)).await
}

async fn api_toggle(
    State(state): State<AppState>,
    Path(n): Path<String>,
) -> Result<Response, ApiError> {
    let index = motor_index(&n)
        .ok_or_else(|| ApiError::bad_request(format!("motor must be 1..={ACTUATORS}, got '{n}'")))?;
    dispatch(&state, Command::Toggle(index)).await
}

async fn api_motors_on(State(state): State<AppState>) -> Result<Response, ApiError> {
    dispatch(&state, Command::MotorsOn).await
}

async fn api_motors_off(State(state): State<AppState>) -> Result<Response, ApiError> {
    dispatch(&state, Command::MotorsOff).await
}

async fn api_timer(
    State(state): State<AppState>,
    body: Result<Json<TimerBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let hours = scheduler::period_hours(body.hours).ok_or_else(|| {
        ApiError::bad_request(format!("hours must be 1..=24, got {}", body.hours))
    })?;
    dispatch(&state, Command::SelectHours(hours)).await
}

/// Parse a 1-based motor number from the path into an index.
fn motor_index(n: &str) -> Option<usize> {
    n.parse::<usize>()
        .ok()
        .filter(|n| (1..=ACTUATORS).contains(n))
        .map(|n| n - 1)
}

async fn dispatch(state: &AppState, command: Command) -> Result<Response, ApiError> {
    let outcome = state.commands.send(command).await.map_err(|e| ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: format!("{e:#}"),
    })?;
    let status = match outcome {
        Outcome::Applied => StatusCode::OK,
        Outcome::Ignored(_) => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve the API until `shutdown` flips. With the `tls` feature and both
/// `TLS_CERT` and `TLS_KEY` set, serves HTTPS instead.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    #[cfg(feature = "tls")]
    {
        if let (Ok(cert), Ok(key)) = (std::env::var("TLS_CERT"), std::env::var("TLS_KEY")) {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
                .await
                .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
            tracing::info!("web api listening on https://{addr}");
            return axum_server::bind_rustls(addr, tls)
                .handle(shutdown_handle(shutdown))
                .serve(app.into_make_service())
                .await
                .context("web server error");
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    tracing::info!("web api listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("web server error")
}

/// Server handle that starts a graceful shutdown once `shutdown` flips (or
/// its sender is dropped).
#[cfg(feature = "tls")]
fn shutdown_handle(mut shutdown: watch::Receiver<bool>) -> axum_server::Handle {
    let handle = axum_server::Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        trigger.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });
    handle
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Thresholds;
    use crate::scheduler::TimerState;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    /// An app whose controller records every command and applies all of them
    /// except toggles.
    fn app() -> (Router, Arc<Mutex<Vec<Command>>>) {
        let shared = Arc::new(RwLock::new(SystemState::new(
            "memory",
            Thresholds::default(),
            TimerState::new(1),
        )));
        let (commands, mut rx) = CommandSender::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                log.lock().unwrap().push(req.command);
                let outcome = match req.command {
                    Command::Toggle(_) => Outcome::Ignored("not in Manual".into()),
                    _ => Outcome::Applied,
                };
                let _ = req.reply.send(outcome);
            }
        });

        (router(AppState { shared, commands }), seen)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn status_returns_view() {
        let (app, _) = app();
        let (status, body) = call(app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "Manual");
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["timer"]["remaining"], "0:00:00");
    }

    #[tokio::test]
    async fn set_mode_dispatches_parsed_mode() {
        let (app, seen) = app();
        let (status, body) = call(app, "POST", "/api/mode", Some(json!({"mode": "auto"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(*seen.lock().unwrap(), vec![Command::SetMode(Mode::Auto)]);
    }

    #[tokio::test]
    async fn unknown_mode_is_bad_request() {
        let (app, seen) = app();
        let (status, body) = call(app, "POST", "/api/mode", Some(json!({"mode": "Eco"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Eco"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (app, _) = app();
        let (status, body) = call(app, "POST", "/api/mode", Some(json!({"mood": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn toggle_maps_one_based_motor() {
        let (app, seen) = app();
        let (status, body) = call(app, "POST", "/api/motors/2/toggle", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["outcome"], "ignored");
        assert_eq!(body["reason"], "not in Manual");
        assert_eq!(*seen.lock().unwrap(), vec![Command::Toggle(1)]);
    }

    #[tokio::test]
    async fn toggle_rejects_bad_motor_numbers() {
        for n in ["0", "5", "pump"] {
            let (app, _) = app();
            let (status, _) = call(app, "POST", &format!("/api/motors/{n}/toggle"), None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "motor {n}");
        }
    }

    #[tokio::test]
    async fn motors_on_and_off() {
        let (app, seen) = app();
        let (on, _) = call(app.clone(), "POST", "/api/motors/on", None).await;
        let (off, _) = call(app, "POST", "/api/motors/off", None).await;
        assert_eq!((on, off), (StatusCode::OK, StatusCode::OK));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Command::MotorsOn, Command::MotorsOff]
        );
    }

    #[tokio::test]
    async fn timer_validates_hours() {
        let (app, seen) = app();
        let (ok, _) = call(app.clone(), "POST", "/api/timer", Some(json!({"hours": 6}))).await;
        let (bad, _) = call(app, "POST", "/api/timer", Some(json!({"hours": 25}))).await;
        assert_eq!(ok, StatusCode::OK);
        assert_eq!(bad, StatusCode::BAD_REQUEST);
        assert_eq!(*seen.lock().unwrap(), vec![Command::SelectHours(6)]);
    }

    #[tokio::test]
    async fn stopped_controller_is_unavailable() {
        let shared = Arc::new(RwLock::new(SystemState::new(
            "memory",
            Thresholds::default(),
            TimerState::new(1),
        )));
        let (commands, rx) = CommandSender::channel(1);
        drop(rx);
        let app = router(AppState { shared, commands });

        let (status, body) = call(app, "POST", "/api/motors/off", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[test]
    fn motor_index_is_one_based() {
        assert_eq!(motor_index("1"), Some(0));
        assert_eq!(motor_index("4"), Some(3));
        assert_eq!(motor_index("0"), None);
        assert_eq!(motor_index("-1"), None);
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn axum_server_stops_when_shutdown_flips() {
        let (stop, stop_rx) = watch::channel(false);
        let handle = shutdown_handle(stop_rx);
        let (app, _) = app();
        let server = tokio::spawn(
            axum_server::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );
        assert!(handle.listening().await.is_some());

        stop.send(true).unwrap();
        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), server).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))), "server still running");
    }
}
