//! Durable game storage on an embedded RocksDB instance.
//!
//! Key layout:
//!
//! ```text
//! /games/{19-digit created-at unix seconds}/{game id}   -> game JSON
//! /stats/counters/{name}                                -> zig-zag varint, merged by addition
//! ```
//!
//! Zero-padded timestamps make key order chronological, so restoring is one
//! prefix scan and expiry is one range delete.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{DB, Direction, IteratorMode, MergeOperands, Options, WriteBatch, WriteOptions};

use crate::checkpoint::ArchiveWriter;
use crate::game::Game;

const GAMES_PREFIX: &str = "/games/";
const COUNTERS_PREFIX: &str = "/stats/counters/";
const COUNTER_MERGE: &str = "counter_add";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Engine(#[from] rocksdb::Error),

    #[error("encoding game {id}: {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("bootstrap target {0} is not empty")]
    TargetNotEmpty(PathBuf),

    #[error("refusing checkpoint entry {0:?}")]
    UnsafePath(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract used by the session layer and background tasks.
pub trait Store: Send + Sync {
    /// Write `game` durably under its creation-time key.
    fn save(&self, game: &Game) -> Result<()>;

    /// Load every persisted game, keyed by id. A later record for the same
    /// id wins.
    fn restore(&self) -> Result<HashMap<String, Game>>;

    /// Drop every game created before `before`.
    fn delete_expired(&self, before: DateTime<Utc>) -> Result<()>;

    /// Add `delta` to the counter `name` without reading it.
    fn counter_add(&self, name: &str, delta: i64) -> Result<()>;

    /// Sum of every counter whose name starts with `prefix`.
    fn get_counter(&self, prefix: &str) -> Result<i64>;

    /// Stream a consistent snapshot of the whole store into `sink`.
    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()>;
}

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_merge_operator_associative(COUNTER_MERGE, add_counters);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        // Same filesystem as the engine so checkpoint files are hard links.
        let parent = self
            .path()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Ok(tempfile::Builder::new().prefix(".checkpoint-").tempdir_in(parent)?)
    }
}

impl Store for RocksStore {
    fn save(&self, game: &Game) -> Result<()> {
        let value = serde_json::to_vec(game).map_err(|source| StoreError::Encode {
            id: game.id.clone(),
            source,
        })?;
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(game_key(game.created_at.timestamp(), &game.id), value, &opts)?;
        Ok(())
    }

    fn restore(&self) -> Result<HashMap<String, Game>> {
        let mut games = HashMap::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(GAMES_PREFIX.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(GAMES_PREFIX.as_bytes()) {
                break;
            }
            let corrupt = |reason: String| StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason,
            };
            let game: Game = serde_json::from_slice(&value).map_err(|e| corrupt(e.to_string()))?;
            if !game.is_well_formed() {
                return Err(corrupt("malformed board".to_string()));
            }
            games.insert(game.id.clone(), game);
        }
        Ok(games)
    }

    fn delete_expired(&self, before: DateTime<Utc>) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete_range(game_key(0, ""), game_key(before.timestamp(), ""));
        self.db.write(batch)?;
        Ok(())
    }

    fn counter_add(&self, name: &str, delta: i64) -> Result<()> {
        let key = format!("{COUNTERS_PREFIX}{name}");
        self.db.merge(key, encode_counter(delta))?;
        Ok(())
    }

    fn get_counter(&self, prefix: &str) -> Result<i64> {
        let prefix = format!("{COUNTERS_PREFIX}{prefix}");
        let mut sum = 0i64;
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let v = decode_counter(&value).ok_or_else(|| StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: "unreadable counter value".to_string(),
            })?;
            sum = sum.wrapping_add(v);
        }
        Ok(sum)
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        self.db.compact_range::<&[u8], &[u8]>(None, None);

        let scratch = self.scratch_dir()?;
        let dir = scratch.path().join("checkpoint");
        Checkpoint::new(&self.db)?.create_checkpoint(&dir)?;

        let mut archive = ArchiveWriter::new(sink);
        archive.add_dir(&dir)?;
        let files = archive.finish()?;
        tracing::info!(files, "Streamed checkpoint");
        Ok(())
    }
}

/// Store that keeps nothing, for runs without a database directory.
pub struct DiscardStore;

impl Store for DiscardStore {
    fn save(&self, _: &Game) -> Result<()> {
        Ok(())
    }

    fn restore(&self) -> Result<HashMap<String, Game>> {
        Ok(HashMap::new())
    }

    fn delete_expired(&self, _: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn counter_add(&self, _: &str, _: i64) -> Result<()> {
        Ok(())
    }

    fn get_counter(&self, _: &str) -> Result<i64> {
        Ok(0)
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        ArchiveWriter::new(sink).finish()?;
        Ok(())
    }
}

fn game_key(unix_secs: i64, id: &str) -> String {
    format!("{GAMES_PREFIX}{:019}/{id}", unix_secs.max(0))
}

fn encode_counter(v: i64) -> Vec<u8> {
    postcard::to_stdvec(&v).unwrap_or_default()
}

fn decode_counter(raw: &[u8]) -> Option<i64> {
    postcard::from_bytes(raw).ok()
}

// Associative merge: operands are deltas, the result is their sum.
fn add_counters(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut sum = match existing {
        Some(raw) => decode_counter(raw)?,
        None => 0,
    };
    for op in operands.iter() {
        sum = sum.wrapping_add(decode_counter(op)?);
    }
    Some(encode_counter(sum))
}
