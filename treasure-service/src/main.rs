// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod game;
mod notify;
mod store;

use std::{
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use treasure_common::{
    AlreadyVisitedResponse, GameState, ResetResponse, RouteCatalog, RouteConfig, VisitRequest,
    VisitResponse, expand_env_vars,
};

use crate::{
    game::VisitError,
    notify::{
        DEFAULT_TELEGRAM_API_BASE_URL, Notifier, TelegramNotifier, TelegramSettings, VisitNotice,
        format_visit_notification, spawn_notification,
    },
    store::{ProgressStore, SqliteProgressStore},
};

const DATABASE_FILE_NAME: &str = "game.db";
const CONTAINER_DATA_DIR: &str = "/app/data";

#[derive(Clone)]
struct AppState {
    store: Arc<dyn ProgressStore>,
    catalog: Arc<RouteCatalog>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    bind_addr: SocketAddr,
    data_dir: PathBuf,
    busy_timeout: Duration,
    catalog_path: Option<String>,
    telegram: TelegramSettings,
}

impl ServiceConfig {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = normalize_optional_string(std::env::var("DATA_DIR").ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                if FsPath::new(CONTAINER_DATA_DIR).is_dir() {
                    PathBuf::from(CONTAINER_DATA_DIR)
                } else {
                    PathBuf::from("data")
                }
            });

        Ok(Self {
            bind_addr: parse_bind_addr("TREASURE_SERVICE_BIND", "0.0.0.0:8080")?,
            data_dir,
            busy_timeout: Duration::from_millis(
                std::env::var("STORE_BUSY_TIMEOUT_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(5000)
                    .max(1),
            ),
            catalog_path: normalize_optional_string(std::env::var("ROUTE_CATALOG_PATH").ok()),
            telegram: TelegramSettings {
                api_base_url: std::env::var("TELEGRAM_API_BASE_URL")
                    .ok()
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE_URL.to_string()),
                bot_token: normalize_optional_string(std::env::var("TELEGRAM_BOT_TOKEN").ok()),
                chat_id: normalize_optional_string(std::env::var("TELEGRAM_CHAT_ID").ok()),
            },
        })
    }

    fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }
}

#[derive(Debug, Deserialize)]
struct RouteCatalogFile {
    routes: Vec<RouteConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "treasure_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    let catalog = Arc::new(load_route_catalog(config.catalog_path.as_deref()));

    ensure_data_dir(&config.data_dir)?;
    let database_path = config.database_path();
    let store = SqliteProgressStore::open(&database_path, config.busy_timeout)?;
    info!(path = %database_path.display(), "progress database opened");
    game::bootstrap(&store, &catalog).await?;

    if std::env::args().nth(1).as_deref() == Some("init-db") {
        info!("database initialized; exiting");
        return Ok(());
    }

    let state = AppState {
        store: Arc::new(store),
        catalog,
        notifier: Arc::new(TelegramNotifier::new(config.telegram.clone())?),
    };

    let app = build_router(state);

    info!(bind_addr = %config.bind_addr, "treasure-service listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/game", get(get_game_handler))
        .route("/game/visit", post(visit_handler))
        .route("/admin/reset", post(reset_handler))
        .route("/routes", get(list_routes_handler))
        .route("/routes/{route_id}", get(get_route_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

const DATA_DIR_WRITE_CHECK: &str = ".write-check";

/// The database directory must exist and be writable before the store opens.
fn ensure_data_dir(dir: &FsPath) -> anyhow::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create data directory {}", dir.display()))?;
        info!(path = %dir.display(), "created data directory");
    }

    let metadata = std::fs::metadata(dir)
        .with_context(|| format!("cannot inspect data directory {}", dir.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("data path {} is not a directory", dir.display());
    }

    let marker = dir.join(DATA_DIR_WRITE_CHECK);
    std::fs::write(&marker, b"")
        .with_context(|| format!("data directory {} is not writable", dir.display()))?;
    std::fs::remove_file(&marker).with_context(|| {
        format!("cannot remove {} after write check", marker.display())
    })?;
    Ok(())
}

fn load_route_catalog(path: Option<&str>) -> RouteCatalog {
    let Some(path) = path else {
        return RouteCatalog::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read route catalog file");
            return RouteCatalog::default();
        }
    };

    if raw.trim().is_empty() {
        warn!(path = %path, "route catalog file is empty");
        return RouteCatalog::default();
    }

    let parsed = match serde_yaml::from_str::<RouteCatalogFile>(&expand_env_vars(&raw)) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse route catalog yaml");
            return RouteCatalog::default();
        }
    };

    match RouteCatalog::new(parsed.routes) {
        Ok(catalog) => {
            info!(path = %path, routes = catalog.route_count(), "loaded route catalog");
            catalog
        }
        Err(error) => {
            warn!(path = %path, error = %error, "invalid route catalog; using built-in routes");
            RouteCatalog::default()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "treasure-service"}))
}

async fn get_game_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let game_state = load_game_state(&state).await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store, max-age=0")],
        Json(game_state),
    )
        .into_response())
}

async fn visit_handler(
    State(state): State<AppState>,
    payload: Result<Json<VisitRequest>, JsonRejection>,
) -> Result<Json<VisitResponse>, ApiError> {
    let route_id = validate_visit_request(payload)?;

    let outcome = match game::visit(state.store.as_ref(), &route_id).await {
        Ok(outcome) => outcome,
        Err(VisitError::AlreadyVisited { route_id, points }) => {
            let game_state = load_game_state(&state).await?;
            return Err(ApiError::already_visited(route_id, points, game_state));
        }
        Err(VisitError::RouteNotFound(route_id)) => {
            return Err(ApiError::not_found(format!("route {route_id} not found")));
        }
        Err(VisitError::Storage(error)) => {
            return Err(ApiError::internal(format!(
                "failed to visit route {route_id}: {error:#}"
            )));
        }
    };

    let game_state = load_game_state(&state).await?;
    let completed_now =
        match game::record_completion(state.store.as_ref(), &game_state, outcome.visited_at).await {
            Ok(recorded) => recorded,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to record completion");
                false
            }
        };

    let route_name = state
        .catalog
        .get_route_by_id(&outcome.route_id)
        .map(|route| route.name.as_str())
        .unwrap_or(outcome.route_id.as_str());
    let message = format_visit_notification(&VisitNotice {
        route_name,
        route_id: &outcome.route_id,
        points: outcome.points,
        state: &game_state,
        completed_now,
        at: outcome.visited_at,
    });
    spawn_notification(state.notifier.clone(), outcome.route_id.clone(), message);

    Ok(Json(VisitResponse {
        success: true,
        points: outcome.points,
        state: game_state,
    }))
}

fn validate_visit_request(
    payload: Result<Json<VisitRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(request) = payload
        .map_err(|rejection| ApiError::bad_request(format!("invalid request body: {rejection}")))?;

    // Blank ids are rejected, but a non-blank id is matched exactly as sent.
    request
        .route_id
        .filter(|route_id| !route_id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Route ID is required"))
}

async fn reset_handler(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    game::reset(state.store.as_ref())
        .await
        .map_err(|error| ApiError::internal(format!("failed to reset game: {error:#}")))?;
    Ok(Json(ResetResponse { success: true }))
}

async fn list_routes_handler(State(state): State<AppState>) -> Json<Vec<RouteConfig>> {
    Json(state.catalog.routes().to_vec())
}

async fn get_route_handler(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> Result<Json<RouteConfig>, ApiError> {
    state
        .catalog
        .get_route_by_id(&route_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("route {route_id} not found")))
}

async fn load_game_state(state: &AppState) -> Result<GameState, ApiError> {
    game::get_state(state.store.as_ref())
        .await
        .map_err(|error| ApiError::internal(format!("failed to fetch game state: {error:#}")))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    body: Option<serde_json::Value>,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            body: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            body: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            body: None,
        }
    }

    fn already_visited(route_id: String, points: u32, state: GameState) -> Self {
        let message = "Route already visited".to_string();
        let body = serde_json::to_value(AlreadyVisitedResponse {
            error: message.clone(),
            already_visited: true,
            route_id,
            points,
            state,
        })
        .ok();
        Self {
            status: StatusCode::CONFLICT,
            message,
            body,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, message = %self.message, "request failed");
        } else {
            info!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = self
            .body
            .unwrap_or_else(|| serde_json::json!({"error": self.message}));
        (self.status, Json(body)).into_response()
    }
}
