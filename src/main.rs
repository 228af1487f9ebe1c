mod checkpoint;
mod config;
mod error;
mod game;
mod session;
mod store;
mod tasks;
mod types;
mod wordset;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::checkpoint::ChannelWriter;
use crate::error::ApiError;
use crate::game::GameOptions;
use crate::session::{SessionHandle, Sessions, Wake};
use crate::store::{DiscardStore, RocksStore, Store};
use crate::tasks::{COMPLETED_PREFIX, ServerStats};
use crate::types::*;
use crate::wordset::WordSets;

const CHECKPOINT_CHUNKS: usize = 8;

#[derive(Clone)]
struct AppState {
    sessions: Arc<Sessions>,
    word_sets: Arc<WordSets>,
    stats: Arc<ServerStats>,
    config: Arc<ServerConfig>,
}

// ─── Helpers ──────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Error decoding request body: {}", e)))
}

fn write_game(handle: &SessionHandle) -> Result<Response, ApiError> {
    let body = handle.to_json().map_err(ApiError::internal)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Run engine work (fsync writes, snapshots) off the reactor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(ApiError::internal)
}

fn require_game_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() {
        return Err(ApiError::BadRequest("Missing game_id".to_string()));
    }
    Ok(())
}

// ─── Routes ───────────────────────────────────────────────────────

/// POST /game-state
///
/// Answers at once for an unknown game or a stale `state_id`; otherwise holds
/// the request until the game changes, is replaced, or the poll times out.
/// A client disconnect drops this future and nothing is written.
async fn game_state(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: GameStateRequest = decode(&body)?;
    require_game_id(&req.game_id)?;

    let Some(handle) = state.sessions.get(&req.game_id) else {
        let sessions = state.sessions.clone();
        let handle = blocking(move || sessions.get_or_create(&req.game_id)).await?;
        return write_game(&handle);
    };

    let waiters = handle.wait_handles(req.state_id.as_deref());
    match waiters.wait(state.config.poll_timeout()).await {
        Wake::Updated => write_game(&handle),
        Wake::TimedOut => {
            tracing::debug!(game_id = %req.game_id, state_id = %handle.current_version(), "Long poll timed out");
            write_game(&handle)
        }
        // Replaced by the next game, or evicted: answer with whatever the id maps to now.
        Wake::Replaced => {
            let sessions = state.sessions.clone();
            let handle = blocking(move || sessions.get_or_create(&req.game_id)).await?;
            write_game(&handle)
        }
    }
}

/// POST /guess
async fn guess(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: GuessRequest = decode(&body)?;
    let handle = state
        .sessions
        .get(&req.game_id)
        .ok_or_else(|| ApiError::NotFound("No such game".to_string()))?;

    let target = handle.clone();
    let result = blocking(move || {
        target.update(|g| match g.guess(req.index) {
            Ok(()) => (true, Ok(())),
            Err(e) => (false, Err(e)),
        })
    })
    .await?;
    result?;
    write_game(&handle)
}

/// POST /end-turn
///
/// A stale round or finished game leaves the game as is; the current state is
/// returned either way.
async fn end_turn(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: EndTurnRequest = decode(&body)?;
    let handle = state
        .sessions
        .get(&req.game_id)
        .ok_or_else(|| ApiError::NotFound("No such game".to_string()))?;

    let target = handle.clone();
    blocking(move || target.update(|g| (g.next_turn(req.current_round), ()))).await?;
    write_game(&handle)
}

/// POST /next-game
async fn next_game(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: NextGameRequest = decode(&body)?;
    require_game_id(&req.game_id)?;

    // No words means keep playing the current pool, or the default one for a new game.
    let (set_id, words) = state.word_sets.canonicalize(&req.word_set)?;
    let custom = if words.is_empty() {
        None
    } else {
        tracing::debug!(game_id = %req.game_id, word_set = %set_id, interned = state.word_sets.len(), "Custom word set");
        Some(words)
    };
    let options = GameOptions {
        timer_duration_ms: req.timer_duration_ms,
        enforce_timer: req.enforce_timer,
    };

    let sessions = state.sessions.clone();
    let handle = blocking(move || match sessions.get(&req.game_id) {
        None => {
            let words = custom.unwrap_or_else(|| sessions.default_words().clone());
            sessions.create_with(&req.game_id, words, options)
        }
        Some(current) if req.create_new => {
            let words = custom.unwrap_or_else(|| current.read(|g| g.deal.word_set.clone()));
            sessions.advance(&req.game_id, &current, words, options)
        }
        Some(current) => current,
    })
    .await?;
    write_game(&handle)
}

/// GET /stats
async fn stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let table = state.sessions.stats(Utc::now());

    let store = state.sessions.store().clone();
    let on_disk = blocking(move || store.get_counter(COMPLETED_PREFIX))
        .await?
        .map_err(ApiError::internal)?;
    let in_memory = state.stats.games_completed.load(Ordering::Relaxed);

    let resp = StatsResponse {
        games_completed: on_disk + in_memory,
        mem_games_total: table.total,
        mem_games_in_progress: table.in_progress,
        mem_games_created_one_hour: table.created_last_hour,
        requests_total: state.stats.requests_total.load(Ordering::Relaxed),
        requests_in_flight: state.stats.requests_in_flight.load(Ordering::Relaxed),
    };
    Ok(axum::Json(resp).into_response())
}

fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

/// GET /checkpoint
///
/// Streams a snapshot of the whole store for a replica to bootstrap from.
/// Failures before the first chunk answer 500; later ones abort the body.
async fn get_checkpoint(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let expected = &state.config.checkpoint_password;
    match basic_auth_password(&headers) {
        Some(password) if !expected.is_empty() && password == *expected => {}
        _ => return Err(ApiError::Unauthorized),
    }

    let (tx, mut rx) = mpsc::channel(CHECKPOINT_CHUNKS);
    let store = state.sessions.store().clone();
    tokio::task::spawn_blocking(move || {
        let mut sink = ChannelWriter::new(tx.clone());
        if let Err(e) = store.checkpoint(&mut sink) {
            tracing::error!("Streaming checkpoint: {}", e);
            let _ = tx.blocking_send(Err(std::io::Error::other(e.to_string())));
        }
    });

    let first = match rx.recv().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return Err(ApiError::internal(e)),
        None => return Err(ApiError::Internal("checkpoint task exited".to_string())),
    };
    let rest = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let body = Body::from_stream(stream::iter([Ok(first)]).chain(rest));

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/gzip")], body).into_response())
}

struct InFlight<'a>(&'a AtomicI64);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn count_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    state.stats.requests_in_flight.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight(&state.stats.requests_in_flight);
    next.run(req).await
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/game-state", post(game_state))
        .route("/guess", post(guess))
        .route("/end-turn", post(end_turn))
        .route("/next-game", post(next_game))
        .route("/stats", get(stats))
        .route("/checkpoint", get(get_checkpoint))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Bootstrap ────────────────────────────────────────────────────

/// Copy a running peer's database into `dir`, which must be empty.
async fn bootstrap_from_peer(url: &str, password: &str, dir: &Path) -> anyhow::Result<usize> {
    let endpoint = format!("{}/checkpoint", url.trim_end_matches('/'));
    tracing::info!("Bootstrapping from {}", endpoint);

    let resp = reqwest::Client::new()
        .get(&endpoint)
        .basic_auth("admin", Some(password))
        .send()
        .await
        .context("Requesting checkpoint")?;
    if resp.status() != reqwest::StatusCode::OK {
        anyhow::bail!("checkpoint returned {} status code", resp.status());
    }
    let body = resp.bytes().await.context("Downloading checkpoint")?;

    let dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || checkpoint::bootstrap(&body[..], &dir)).await??;
    Ok(files)
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config::init()?;
    let server_config = config::load_server_config()?;
    let db_dir = config::db_dir();

    if let Some(url) = config::bootstrap_url() {
        let Some(db_dir) = db_dir else {
            anyhow::bail!("BOOTSTRAP_URL requires a DB_DIR");
        };
        let files = bootstrap_from_peer(&url, &server_config.checkpoint_password, &db_dir)
            .await
            .with_context(|| format!("Bootstrapping from {:?}", url))?;
        tracing::info!(files, "Bootstrapped from {:?} into {}", url, db_dir.display());
        return Ok(());
    }

    let store: Arc<dyn Store> = match db_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).with_context(|| format!("Creating {}", dir.display()))?;
            tracing::info!("Opening rocksdb from directory: {}", dir.display());
            Arc::new(RocksStore::open(&dir).context("Opening rocksdb")?)
        }
        None => {
            tracing::warn!("DB_DIR is empty, games will not be persisted");
            Arc::new(DiscardStore)
        }
    };

    store
        .delete_expired(Utc::now() - server_config.retention())
        .context("Deleting expired games")?;

    let word_sets = Arc::new(WordSets::new());
    let default_words = config::load_default_words(&word_sets)?;

    let stats = Arc::new(ServerStats::default());
    let sessions = Sessions::new(store, default_words, tasks::completion_hooks(stats.clone()));
    let restored = sessions.restore_all().context("Restoring games")?;
    tracing::info!("Restored {} games from disk", restored);

    tasks::spawn_all(sessions.clone(), stats.clone(), &server_config);

    let state = AppState {
        sessions,
        word_sets,
        stats,
        config: Arc::new(server_config),
    };
    let app = router(state);

    let port = config::port()?;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind")?;

    tracing::info!("Codeboard server running on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn app_with(config: ServerConfig) -> (Router, AppState) {
        let word_sets = Arc::new(WordSets::new());
        let words: Vec<String> = (0..100).map(|i| format!("WORD{i:03}")).collect();
        let (_, default_words) = word_sets.canonicalize(&words).unwrap();
        let stats = Arc::new(ServerStats::default());
        let sessions = Sessions::new(Arc::new(DiscardStore), default_words, tasks::completion_hooks(stats.clone()));
        let state = AppState {
            sessions,
            word_sets,
            stats,
            config: Arc::new(config),
        };
        (router(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with(ServerConfig {
            poll_timeout_ms: 100,
            checkpoint_password: "secret".to_string(),
            ..ServerConfig::default()
        })
    }

    async fn call(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn cell(game: &Value, team: &str) -> usize {
        game["layout"].as_array().unwrap().iter().position(|t| t == team).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_game_is_created_on_first_poll() {
        let (app, state) = app();
        let (status, game) = call(&app, "/game-state", json!({"game_id": "fresh-lobby"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(game["id"], "fresh-lobby");
        assert_eq!(game["words"].as_array().unwrap().len(), 25);
        assert!(game["state_id"].is_string());
        assert!(state.sessions.get("fresh-lobby").is_some());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let (app, _) = app();
        let (status, _) = call(&app, "/guess", json!({"game_id": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "/game-state", json!({"game_id": ""})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_guess_flow() {
        let (app, _) = app();
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;
        let neutral = cell(&game, "neutral");

        let (status, after) = call(&app, "/guess", json!({"game_id": "g", "index": neutral})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(after["revealed"][neutral], true);
        assert_eq!(after["round"], 1);
        assert_ne!(after["state_id"], game["state_id"]);

        let (status, _) = call(&app, "/guess", json!({"game_id": "g", "index": neutral})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "/guess", json!({"game_id": "g", "index": 25})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "/guess", json!({"game_id": "missing", "index": 0})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_end_turn_ignores_stale_round() {
        let (app, _) = app();
        call(&app, "/game-state", json!({"game_id": "g"})).await;

        let (status, game) = call(&app, "/end-turn", json!({"game_id": "g", "current_round": 0})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(game["round"], 1);

        let (status, again) = call(&app, "/end-turn", json!({"game_id": "g", "current_round": 0})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["round"], 1);
        assert_eq!(again["state_id"], game["state_id"]);
    }

    #[tokio::test]
    async fn test_long_poll_times_out_with_unchanged_game() {
        let (app, _) = app();
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;
        let (status, polled) = call(&app, "/game-state", json!({"game_id": "g", "state_id": game["state_id"]})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["state_id"], game["state_id"]);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_update() {
        let (app, _) = app_with(ServerConfig {
            poll_timeout_ms: 10_000,
            ..ServerConfig::default()
        });
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;

        let poller = {
            let app = app.clone();
            let state_id = game["state_id"].clone();
            tokio::spawn(async move { call(&app, "/game-state", json!({"game_id": "g", "state_id": state_id})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        call(&app, "/end-turn", json!({"game_id": "g"})).await;

        let (status, polled) = tokio::time::timeout(Duration::from_secs(5), poller).await.unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["round"], 1);
        assert_ne!(polled["state_id"], game["state_id"]);
    }

    #[tokio::test]
    async fn test_long_poll_follows_replacement() {
        let (app, _) = app_with(ServerConfig {
            poll_timeout_ms: 10_000,
            ..ServerConfig::default()
        });
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;

        let poller = {
            let app = app.clone();
            let state_id = game["state_id"].clone();
            tokio::spawn(async move { call(&app, "/game-state", json!({"game_id": "g", "state_id": state_id})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, next) = call(&app, "/next-game", json!({"game_id": "g", "create_new": true})).await;

        let (_, polled) = tokio::time::timeout(Duration::from_secs(5), poller).await.unwrap().unwrap();
        assert_eq!(polled["words"], next["words"]);
        assert_ne!(polled["words"], game["words"]);
    }

    #[tokio::test]
    async fn test_next_game() {
        let (app, _) = app();
        let custom: Vec<String> = (0..60).map(|i| format!("custom{i}")).collect();
        let (status, first) = call(
            &app,
            "/next-game",
            json!({"game_id": "g", "word_set": custom, "timer_duration_ms": 60000, "enforce_timer": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(first["words"].as_array().unwrap().iter().all(|w| w.as_str().unwrap().starts_with("CUSTOM")));
        assert_eq!(first["timer_duration_ms"], 60000);
        assert_eq!(first["enforce_timer"], true);

        // Without create_new the existing game is returned.
        let (_, same) = call(&app, "/next-game", json!({"game_id": "g"})).await;
        assert_eq!(same["state_id"], first["state_id"]);

        let (_, next) = call(&app, "/next-game", json!({"game_id": "g", "word_set": custom, "create_new": true})).await;
        assert_eq!(next["seed"], first["seed"]);
        assert_eq!(next["seed_index"], 50);

        let (status, _) = call(&app, "/next-game", json!({"game_id": "g", "word_set": ["a", "b"]})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_next_game_keeps_current_pool() {
        let (app, _) = app();
        let custom: Vec<String> = (0..60).map(|i| format!("custom{i}")).collect();
        let (_, first) = call(&app, "/next-game", json!({"game_id": "g", "word_set": custom})).await;

        let (status, next) = call(&app, "/next-game", json!({"game_id": "g", "create_new": true})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(next["seed"], first["seed"]);
        assert_eq!(next["seed_index"], 50);
        assert!(next["words"].as_array().unwrap().iter().all(|w| w.as_str().unwrap().starts_with("CUSTOM")));
        assert_eq!(next["word_set"].as_array().unwrap().len(), 60);
    }

    #[tokio::test]
    async fn test_long_poll_on_evicted_game_gets_fresh_game() {
        let (app, state) = app_with(ServerConfig {
            poll_timeout_ms: 10_000,
            ..ServerConfig::default()
        });
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;

        let poller = {
            let app = app.clone();
            let state_id = game["state_id"].clone();
            tokio::spawn(async move { call(&app, "/game-state", json!({"game_id": "g", "state_id": state_id})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = Utc::now() + chrono::TimeDelta::hours(13);
        assert_eq!(state.sessions.evict(later, crate::session::Eviction::default()), 1);

        let (status, polled) = tokio::time::timeout(Duration::from_secs(5), poller).await.unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["id"], "g");
        assert_ne!(polled["state_id"], game["state_id"]);
    }

    #[tokio::test]
    async fn test_stats_counts_games_and_completions() {
        let (app, _) = app();
        let (_, game) = call(&app, "/game-state", json!({"game_id": "g"})).await;
        call(&app, "/game-state", json!({"game_id": "h"})).await;
        let black = cell(&game, "black");
        let (_, done) = call(&app, "/guess", json!({"game_id": "g", "index": black})).await;
        assert!(done["winning_team"].is_string());

        let req = Request::builder().uri("/stats").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let stats: StatsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats.games_completed, 1);
        assert_eq!(stats.mem_games_total, 2);
        assert_eq!(stats.mem_games_in_progress, 0);
        assert_eq!(stats.requests_total, 4);
        assert_eq!(stats.requests_in_flight, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_password() {
        let (app, _) = app();
        let req = Request::builder().uri("/checkpoint").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let wrong = format!("Basic {}", STANDARD.encode("admin:nope"));
        let req = Request::builder().uri("/checkpoint").header(header::AUTHORIZATION, wrong).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::UNAUTHORIZED);

        let right = format!("Basic {}", STANDARD.encode("admin:secret"));
        let req = Request::builder().uri("/checkpoint").header(header::AUTHORIZATION, right).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(checkpoint::unpack(&bytes[..], tmp.path()).unwrap(), 0);
    }
}
