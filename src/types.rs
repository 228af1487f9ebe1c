use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::session::Eviction;

/// Server configuration loaded from server.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Basic-auth password guarding `/checkpoint`. Empty disables the endpoint.
    pub checkpoint_password: String,
    pub retention_hours: i64,
    pub completed_grace_hours: i64,
    pub max_age_hours: i64,
    pub poll_timeout_ms: u64,
    pub eviction_interval_secs: u64,
    pub expiry_interval_secs: u64,
    pub counter_flush_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            checkpoint_password: String::new(),
            retention_hours: 24,
            completed_grace_hours: 3,
            max_age_hours: 12,
            poll_timeout_ms: 15_000,
            eviction_interval_secs: 600,
            expiry_interval_secs: 3600,
            counter_flush_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::hours(self.retention_hours)
    }

    pub fn eviction(&self) -> Eviction {
        Eviction {
            completed_grace: TimeDelta::hours(self.completed_grace_hours),
            max_age: TimeDelta::hours(self.max_age_hours),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Long-poll request. Without `state_id` the current game is returned at once.
#[derive(Debug, Clone, Deserialize)]
pub struct GameStateRequest {
    pub game_id: String,
    #[serde(default)]
    pub state_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuessRequest {
    pub game_id: String,
    pub index: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndTurnRequest {
    pub game_id: String,
    #[serde(default)]
    pub current_round: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NextGameRequest {
    pub game_id: String,
    #[serde(default)]
    pub word_set: Vec<String>,
    #[serde(default)]
    pub create_new: bool,
    #[serde(default)]
    pub timer_duration_ms: i64,
    #[serde(default)]
    pub enforce_timer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub games_completed: i64,
    pub mem_games_total: usize,
    pub mem_games_in_progress: usize,
    #[serde(rename = "mem_games_created_1h")]
    pub mem_games_created_one_hour: usize,
    #[serde(rename = "requests_total_process_lifetime")]
    pub requests_total: i64,
    pub requests_in_flight: i64,
}
