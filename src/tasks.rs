//! Background maintenance: in-memory eviction, durable expiry, and
//! flushing the completed-games counter to storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::game::{Game, Hooks};
use crate::session::Sessions;
use crate::store::Store;
use crate::types::ServerConfig;

pub const COMPLETED_PREFIX: &str = "games/completed/";

/// Process-lifetime counters shared by handlers and background tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Completions not yet flushed to storage.
    pub games_completed: AtomicI64,
    pub requests_total: AtomicI64,
    pub requests_in_flight: AtomicI64,
}

/// Hook run when a game first gets a winner.
pub fn completion_hooks(stats: Arc<ServerStats>) -> Hooks {
    Hooks {
        on_complete: Some(Arc::new(move |game: &Game| {
            stats.games_completed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                game_id = %game.id,
                created_at = %game.created_at,
                completed_at = %Utc::now(),
                rounds_played = game.round,
                "game_completed"
            );
        })),
    }
}

/// Move the in-memory completion count into the hourly storage counter.
///
/// Only the amount read is subtracted, so completions racing with the flush
/// are kept for the next one. A failed write puts the amount back.
pub fn flush_completed(counter: &AtomicI64, store: &dyn Store, now: DateTime<Utc>) -> i64 {
    let v = counter.load(Ordering::SeqCst);
    if v <= 0 {
        return 0;
    }
    counter.fetch_sub(v, Ordering::SeqCst);

    let key = format!("{COMPLETED_PREFIX}{}utc", now.format("%y%m%d%H"));
    if let Err(e) = store.counter_add(&key, v) {
        tracing::error!(key = %key, "Unable to flush completed games counter: {}", e);
        counter.fetch_add(v, Ordering::SeqCst);
        return 0;
    }
    v
}

fn every(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

pub fn spawn_all(sessions: Arc<Sessions>, stats: Arc<ServerStats>, config: &ServerConfig) {
    let eviction = config.eviction();
    let table = sessions.clone();
    let mut ticker = every(config.eviction_interval_secs);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let removed = table.evict(Utc::now(), eviction);
            tracing::debug!(removed, remaining = table.len(), "Eviction sweep");
        }
    });

    let retention = config.retention();
    let store = sessions.store().clone();
    let mut ticker = every(config.expiry_interval_secs);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || store.delete_expired(Utc::now() - retention)).await;
            match result {
                Ok(Err(e)) => tracing::error!("Deleting expired games: {}", e),
                Err(e) => tracing::error!("Expiry task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    });

    let store = sessions.store().clone();
    let mut ticker = every(config.counter_flush_interval_secs);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            flush_in_background(stats.clone(), store.clone()).await;
        }
    });
}

/// Run [`flush_completed`] on the blocking pool. Returns the amount flushed.
async fn flush_in_background(stats: Arc<ServerStats>, store: Arc<dyn Store>) -> i64 {
    let result = tokio::task::spawn_blocking(move || {
        flush_completed(&stats.games_completed, store.as_ref(), Utc::now())
    })
    .await;
    match result {
        Ok(flushed) => flushed,
        Err(e) => {
            tracing::error!("Counter flush task failed: {}", e);
            0
        }
    }
}
