//! HTTP surface: plugin management endpoints and the SSE terminal stream.

use crate::config::AppConfig;
use crate::host::{HostControl, ProcessHost};
use crate::install::{HostLayout, InstallError, Installer};
use crate::sql::{NullSqlExecutor, SqlExecutor, SqliteExecutor};
use crate::terminal::{
    CommandTable, ExecRequest, HostDirs, Terminal, TerminalMessage, TokenAuthorizer,
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub installer: Arc<Installer>,
    pub terminal: Terminal,
}

impl AppState {
    /// Wire up installer, host control and terminal from configuration.
    /// `shutdown` is the channel the host's stop-all signals.
    pub fn from_config(
        config: AppConfig,
        shutdown: Option<watch::Sender<bool>>,
    ) -> anyhow::Result<Self> {
        let sql: Arc<dyn SqlExecutor> = match &config.database.path {
            Some(path) => Arc::new(SqliteExecutor::open(path)?),
            None => Arc::new(NullSqlExecutor),
        };

        let mut host = ProcessHost::new(config.host.restart_mode, config.host.supervisor_pid);
        if let Some(tx) = shutdown {
            host = host.with_shutdown(tx);
        }
        let host: Arc<dyn HostControl> = Arc::new(host);

        let installer = Arc::new(Installer::new(HostLayout::from_config(&config), sql, host));

        let table = CommandTable::default_table().with_overrides(&config.terminal.commands);
        let mut terminal = Terminal::new(table, HostDirs::from_config(&config))
            .with_installer(installer.clone())
            .with_poll_interval(Duration::from_millis(config.terminal.poll_interval_ms));
        if config.auth.is_configured() {
            terminal = terminal.with_authorizer(Arc::new(TokenAuthorizer::new(
                config.auth.admin_tokens.clone(),
                config.auth.user_tokens.clone(),
            )));
        } else if config.terminal.auth_required {
            warn!("Terminal auth is required but no tokens are configured; commands will be rejected");
        }

        Ok(Self {
            config: Arc::new(config),
            installer,
            terminal,
        })
    }
}

// ---------------------------------------------------------------------------
// Errors and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Install(InstallError::Validation(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Install(InstallError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Install(InstallError::Integrity(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Install(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "code": status.as_u16(),
            "message": self.to_string(),
            "data": Value::Null,
        });
        (status, Json(body)).into_response()
    }
}

fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "code": 200,
        "message": "ok",
        "data": data,
    }))
}

/// Run a blocking installer call off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    // Leave headroom over the configured upload size so oversized files get a
    // readable error instead of a bare 413
    let body_limit = state.config.upload.max_size.saturating_mul(2).max(1024 * 1024);
    Router::new()
        .route("/health", get(health_check))
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/upload", post(upload_plugin))
        .route("/api/plugins/install", post(install_plugin))
        .route("/api/plugins/uninstall", post(uninstall_plugin))
        .route("/api/plugins/reload", post(reload_host))
        .route("/api/terminal", get(terminal_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "plugwright",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_plugins(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let installer = state.installer.clone();
    let plugins = blocking(move || Ok(installer.installed_list())).await?;

    let mut versions = serde_json::Map::new();
    versions.insert("plugwright".to_string(), json!(env!("CARGO_PKG_VERSION")));
    for tool in ["node", "npm", "pnpm", "yarn"] {
        let key = format!("version.{}", tool);
        if state.terminal.table().get(&key).is_none() {
            continue;
        }
        let version = state.terminal.capture(&key).await.unwrap_or_default();
        versions.insert(tool.to_string(), json!(version));
    }

    Ok(success(json!({
        "version": versions,
        "data": plugins,
    })))
}

fn has_allowed_extension(file_name: &str, allowed: &[String]) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

async fn upload_plugin(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload = &state.config.upload;
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        file = Some((name, bytes));
        break;
    }
    let Some((name, bytes)) = file else {
        return Err(ApiError::BadRequest("no file uploaded".to_string()));
    };

    if !has_allowed_extension(&name, &upload.allowed_extensions) {
        return Err(ApiError::BadRequest(format!(
            "unsupported file type, allowed: {}",
            upload.allowed_extensions.join(", ")
        )));
    }
    if bytes.len() > upload.max_size {
        return Err(ApiError::BadRequest(format!(
            "file too large (max {} bytes)",
            upload.max_size
        )));
    }

    let install_dir = state.installer.layout().install_dir.clone();
    tokio::fs::create_dir_all(&install_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let staged = install_dir.join(format!("incoming-{}.zip", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&staged, &bytes)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(file = %name, size = bytes.len(), "Received plugin upload");
    let installer = state.installer.clone();
    let result = blocking(move || installer.upload(&staged)).await;
    Ok(success(result?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    #[serde(default)]
    pub app_name: String,
}

fn require_app(request: &AppRequest) -> Result<String, ApiError> {
    let app = request.app_name.trim();
    if app.is_empty() {
        return Err(ApiError::BadRequest("invalid parameters".to_string()));
    }
    Ok(app.to_string())
}

async fn install_plugin(
    State(state): State<AppState>,
    Json(request): Json<AppRequest>,
) -> Result<Json<Value>, ApiError> {
    let app = require_app(&request)?;
    let installer = state.installer.clone();
    let outcome = blocking(move || installer.install(&app)).await?;
    Ok(success(outcome))
}

async fn uninstall_plugin(
    State(state): State<AppState>,
    Json(request): Json<AppRequest>,
) -> Result<Json<Value>, ApiError> {
    let app = require_app(&request)?;
    let installer = state.installer.clone();
    let backup = blocking(move || installer.uninstall(&app)).await?;
    Ok(success(json!({ "backup": backup })))
}

async fn reload_host(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let installer = state.installer.clone();
    let graceful = blocking(move || Ok(installer.host().restart())).await?;
    Ok(success(json!({ "graceful": graceful })))
}

/// Terminal stream query parameters
#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub extend: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn message_event(message: &TerminalMessage) -> Event {
    let data = serde_json::to_string(message)
        .unwrap_or_else(|_| json!({"error": "JSON encode error"}).to_string());
    Event::default().event("message").data(data)
}

fn terminal_events(
    rx: mpsc::UnboundedReceiver<TerminalMessage>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let start = stream::once(async { Ok(Event::default().event("message").data("start")) });
    let messages = stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        Some((Ok(message_event(&message)), rx))
    });
    start.chain(messages)
}

async fn terminal_stream(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> impl IntoResponse {
    let request = ExecRequest {
        command: query.command,
        uuid: query.uuid,
        extend: query.extend,
        token: query.token,
        auth: state.config.terminal.auth_required,
    };
    info!(key = %request.command, uuid = %request.uuid, "Terminal stream opened");
    let rx = state.terminal.exec(request);
    let sse = Sse::new(terminal_events(rx)).keep_alive(KeepAlive::default());
    (
        [
            (
                header::HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        sse,
    )
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Start the server. Stops when the host requests stop-all.
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let (_tx, rx) = watch::channel(false);
    start_server_with_shutdown(config, rx).await
}

/// Start the server with an external shutdown signal
pub async fn start_server_with_shutdown(
    config: AppConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (host_tx, mut host_rx) = watch::channel(false);

    let state = AppState::from_config(config, Some(host_tx))?;
    let app = create_router(state);

    info!(address = %addr, "Starting plugwright server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = wait_for_signal(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping server...");
                }
                _ = wait_for_signal(&mut host_rx) => {
                    info!("Host stop requested, stopping server...");
                }
            }
        })
        .await?;

    Ok(())
}

async fn wait_for_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // sender gone; never resolve
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(root: &Path) -> AppState {
        let base = root.join("server");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(root.join("web")).unwrap();
        let mut config = AppConfig::default();
        config.paths = PathsConfig {
            base_dir: base,
            ..Default::default()
        };
        config.host.restart_mode = crate::host::RestartMode::None;
        config.terminal.auth_required = false;
        AppState::from_config(config, None).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(state(tmp.path()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_install_missing_app_name() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(state(tmp.path()));
        let response = app
            .oneshot(
                Request::post("/api/plugins/install")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 400);
    }

    #[tokio::test]
    async fn test_uninstall_not_installed_is_conflict() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(state(tmp.path()));
        let response = app
            .oneshot(
                Request::post("/api/plugins/uninstall")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"appName":"shop"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_terminal_stream_rejects_unknown_command() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(state(tmp.path()));
        let response = app
            .oneshot(
                Request::get("/api/terminal?command=rm.rf&uuid=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let start = text.find("data: start").unwrap();
        let rejected = text.find("not allowed").unwrap();
        let completed = text.find("exec-completed").unwrap();
        assert!(start < rejected && rejected < completed);
        assert!(text.contains("\"uuid\":\"abc\""));
    }

    #[tokio::test]
    async fn test_terminal_stream_requires_token_by_default() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("server");
        fs::create_dir_all(&base).unwrap();
        let mut config = AppConfig::default();
        config.paths = PathsConfig {
            base_dir: base,
            ..Default::default()
        };
        config.host.restart_mode = crate::host::RestartMode::None;
        assert!(config.terminal.auth_required);
        assert!(!config.auth.is_configured());
        let state = AppState::from_config(config, None).unwrap();

        let mut rx = state.terminal.exec(ExecRequest {
            command: "version.node".to_string(),
            uuid: "u-1".to_string(),
            auth: true,
            ..Default::default()
        });
        let mut data = Vec::new();
        while let Some(message) = rx.recv().await {
            data.push(message.data);
        }
        assert_eq!(
            data,
            vec![
                crate::terminal::MSG_AUTH_FAILED,
                crate::terminal::EXEC_ERROR,
                crate::terminal::EXEC_COMPLETED
            ]
        );

        let response = create_router(state)
            .oneshot(
                Request::get("/api/terminal?command=version.node&uuid=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Authentication failed"));
        assert!(!text.contains("connection-success"));
    }

    #[test]
    fn test_allowed_extension() {
        let allowed = vec!["zip".to_string()];
        assert!(has_allowed_extension("shop.ZIP", &allowed));
        assert!(!has_allowed_extension("shop.tar.gz", &allowed));
        assert!(!has_allowed_extension("shop", &allowed));
    }
}
