//! HTTP surface: `POST /run`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, Method, header};
use axum::routing::post;
use serde_json::Value;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assembler::AssemblyError;
use crate::config::Config;
use crate::executor::Executor;
use crate::queue::JobQueue;
use crate::report::Report;
use crate::types::{ExecutionRequest, ExecutionResult};

/// Shared handler state, built once at startup
#[derive(Debug, Clone)]
pub struct AppState {
    queue: Arc<JobQueue>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(queue: Arc<JobQueue>, request_timeout: Duration) -> Self {
        Self {
            queue,
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let queue = JobQueue::new(Executor::new(config), &config.pool);
        Self::new(Arc::new(queue), config.server.request_timeout())
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

/// Router with CORS for `allowed_origins` and request tracing
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/run", post(run_sketch))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
}

/// CORS policy for the IDE front end
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn run_sketch(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Report {
    let request = match payload {
        Ok(Json(value)) => parse_request(value),
        Err(rejection) => Err(AssemblyError::MalformedRequest(rejection.body_text())),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "bad run request");
            return Report::assembly_error(&e);
        }
    };

    match tokio::time::timeout(state.request_timeout, state.queue.submit(&request.code)).await {
        Ok(result) => result.into(),
        Err(_) => {
            warn!(
                timeout_secs = state.request_timeout.as_secs_f64(),
                "request timed out, job cancelled"
            );
            ExecutionResult::timeout().into()
        }
    }
}

fn parse_request(value: Value) -> Result<ExecutionRequest, AssemblyError> {
    if value.get("code").is_none_or(Value::is_null) {
        return Err(AssemblyError::MissingCode);
    }
    serde_json::from_value(value).map_err(|e| AssemblyError::MalformedRequest(e.to_string()))
}

/// Serve the API until ctrl-c
pub async fn serve(config: &Config, bind: SocketAddr) -> std::io::Result<()> {
    let state = AppState::from_config(config);
    let app = router(state, &config.server.allowed_origins);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}
