use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::game::{DealState, Game, GameOptions, Hooks};
use crate::store::Store;

/// A single-use broadcast: waiters subscribe, and firing drops the sender,
/// which wakes every subscriber at once.
struct Signal(watch::Sender<()>);

impl Signal {
    fn new() -> Self {
        Self(watch::channel(()).0)
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.0.subscribe()
    }
}

fn fired() -> watch::Receiver<()> {
    watch::channel(()).1
}

/// What a long-poll waits on. Obtained atomically with the version check in
/// [`SessionHandle::wait_handles`], so no update can slip in between.
pub struct Waiters {
    pub updated: watch::Receiver<()>,
    pub replaced: watch::Receiver<()>,
}

/// Why [`Waiters::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Updated,
    Replaced,
    TimedOut,
}

impl Waiters {
    pub async fn wait(self, timeout: Duration) -> Wake {
        let Waiters { mut updated, mut replaced } = self;
        // A replaced handle never updates again, so replacement wins ties.
        tokio::select! {
            biased;
            _ = replaced.changed() => Wake::Replaced,
            _ = updated.changed() => Wake::Updated,
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        }
    }
}

struct HandleInner {
    game: Game,
    marshaled: Option<Bytes>,
    updated: Signal,
    replaced: Option<Signal>,
}

/// Guards one game against concurrent mutation and broadcasts its changes.
pub struct SessionHandle {
    store: Arc<dyn Store>,
    inner: Mutex<HandleInner>,
}

#[derive(Serialize)]
struct GameView<'a> {
    #[serde(flatten)]
    game: &'a Game,
    state_id: String,
}

impl SessionHandle {
    /// Wrap a freshly dealt game and persist it.
    pub fn new(game: Game, store: Arc<dyn Store>) -> Arc<Self> {
        if let Err(e) = store.save(&game) {
            tracing::error!(game_id = %game.id, "Unable to write new game to disk: {}", e);
        }
        Self::restored(game, store)
    }

    /// Wrap a game read back from storage without writing it again.
    pub fn restored(game: Game, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            inner: Mutex::new(HandleInner {
                game,
                marshaled: None,
                updated: Signal::new(),
                replaced: Some(Signal::new()),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `transition` under the lock. If it reports a change the cached
    /// JSON is dropped, the game is saved, and current waiters are woken.
    /// A save failure is logged; the in-memory change stands.
    pub fn update<T>(&self, transition: impl FnOnce(&mut Game) -> (bool, T)) -> T {
        let mut inner = self.lock();
        let (changed, out) = transition(&mut inner.game);
        if !changed {
            return out;
        }

        inner.marshaled = None;
        if let Err(e) = self.store.save(&inner.game) {
            tracing::error!(game_id = %inner.game.id, "Unable to write updated game to disk: {}", e);
        }

        // Swap before firing so later subscribers wait for the next update.
        let old = std::mem::replace(&mut inner.updated, Signal::new());
        drop(old);
        out
    }

    /// Read-only access to the game under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&Game) -> T) -> T {
        f(&self.lock().game)
    }

    pub fn current_version(&self) -> String {
        self.lock().game.state_id()
    }

    /// The game as response JSON with its `state_id`, memoized until the next change.
    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        let mut inner = self.lock();
        if let Some(cached) = &inner.marshaled {
            return Ok(cached.clone());
        }
        let view = GameView {
            game: &inner.game,
            state_id: inner.game.state_id(),
        };
        let bytes = Bytes::from(serde_json::to_vec(&view)?);
        inner.marshaled = Some(bytes.clone());
        Ok(bytes)
    }

    /// Signals to wait on for a client that last saw `last_known`.
    ///
    /// A missing or stale version returns an already-fired signal so the
    /// caller answers immediately.
    /// Once the handle has left the table its "replaced" signal stays fired,
    /// so a caller that looked the handle up just before the swap still wakes.
    pub fn wait_handles(&self, last_known: Option<&str>) -> Waiters {
        let inner = self.lock();
        let replaced = inner.replaced.as_ref().map_or_else(fired, Signal::subscribe);
        let current = last_known.is_some_and(|v| v == inner.game.state_id());
        let updated = if current { inner.updated.subscribe() } else { fired() };
        Waiters { updated, replaced }
    }

    // Taken under the table lock, fired (dropped) after it is released.
    // Later subscribers see it as already fired.
    fn take_replaced(&self) -> Option<Signal> {
        self.lock().replaced.take()
    }
}

/// Counts kept for `/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub total: usize,
    pub in_progress: usize,
    pub created_last_hour: usize,
}

/// How long games stay in memory.
#[derive(Debug, Clone, Copy)]
pub struct Eviction {
    pub completed_grace: chrono::TimeDelta,
    pub max_age: chrono::TimeDelta,
}

impl Default for Eviction {
    fn default() -> Self {
        Self {
            completed_grace: chrono::TimeDelta::hours(3),
            max_age: chrono::TimeDelta::hours(12),
        }
    }
}

/// All live games, keyed by id.
pub struct Sessions {
    games: dashmap::DashMap<String, Arc<SessionHandle>>,
    store: Arc<dyn Store>,
    default_words: Arc<[String]>,
    hooks: Hooks,
}

impl Sessions {
    pub fn new(store: Arc<dyn Store>, default_words: Arc<[String]>, hooks: Hooks) -> Arc<Self> {
        Arc::new(Self {
            games: dashmap::DashMap::new(),
            store,
            default_words,
            hooks,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn default_words(&self) -> &Arc<[String]> {
        &self.default_words
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.games.get(id).map(|h| h.value().clone())
    }

    /// The handle for `id`, dealing and persisting a new game if none exists.
    pub fn get_or_create(&self, id: &str) -> Arc<SessionHandle> {
        if let Some(handle) = self.get(id) {
            return handle;
        }
        self.create_with(id, self.default_words.clone(), GameOptions::default())
    }

    /// The handle for `id`, creating it from `words` and `options` if none exists.
    pub fn create_with(&self, id: &str, words: Arc<[String]>, options: GameOptions) -> Arc<SessionHandle> {
        self.games
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(game_id = %id, "Game created");
                let game = Game::new(id, DealState::random(words), options, self.hooks.clone());
                SessionHandle::new(game, self.store.clone())
            })
            .value()
            .clone()
    }

    /// Replace `expected`, the handle the caller last saw for `id`, with the
    /// next game dealt from its deal state.
    ///
    /// The identity check and the swap happen under one table lock, so racing
    /// callers advance once: the losers get the winner's handle back. The
    /// outgoing handle's "replaced" signal fires after the lock is released.
    pub fn advance(
        &self,
        id: &str,
        expected: &Arc<SessionHandle>,
        words: Arc<[String]>,
        options: GameOptions,
    ) -> Arc<SessionHandle> {
        let (handle, replaced) = {
            let Some(mut slot) = self.games.get_mut(id) else {
                return self.create_with(id, words, options);
            };
            if !Arc::ptr_eq(slot.value(), expected) {
                return slot.value().clone();
            }
            let deal = slot.read(|g| g.deal.next(words));
            let next = SessionHandle::new(Game::new(id, deal, options, self.hooks.clone()), self.store.clone());
            let outgoing = std::mem::replace(slot.value_mut(), next.clone());
            (next, outgoing.take_replaced())
        };
        drop(replaced);
        tracing::info!(game_id = %id, "Next game dealt");
        handle
    }

    /// Load every persisted game into the table. Call before serving traffic.
    pub fn restore_all(&self) -> Result<usize, crate::store::StoreError> {
        let games = self.store.restore()?;
        let count = games.len();
        for (id, mut game) in games {
            game.hooks = self.hooks.clone();
            self.games.insert(id, SessionHandle::restored(game, self.store.clone()));
        }
        Ok(count)
    }

    /// Drop finished games past the grace window and any game past the
    /// maximum age. Storage is untouched. Pollers parked on a removed game
    /// are woken through its "replaced" signal.
    pub fn evict(&self, now: DateTime<Utc>, policy: Eviction) -> usize {
        let mut removed = Vec::new();
        self.games.retain(|id, handle| {
            let keep = handle.read(|g| {
                if g.is_completed() && g.created_at + policy.completed_grace < now {
                    tracing::info!(game_id = %id, "Removed completed game");
                    false
                } else if g.created_at + policy.max_age < now {
                    tracing::info!(game_id = %id, "Removed expired game");
                    false
                } else {
                    true
                }
            });
            if !keep {
                removed.push(handle.take_replaced());
            }
            keep
        });
        let count = removed.len();
        drop(removed);
        count
    }

    pub fn stats(&self, now: DateTime<Utc>) -> TableStats {
        let hour_ago = now - chrono::TimeDelta::hours(1);
        let mut stats = TableStats::default();
        for entry in self.games.iter() {
            stats.total += 1;
            entry.value().read(|g| {
                if !g.is_completed() && g.any_revealed() {
                    stats.in_progress += 1;
                }
                if g.created_at > hour_ago {
                    stats.created_last_hour += 1;
                }
            });
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }
}
