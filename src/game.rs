use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const WORDS_PER_GAME: usize = 25;

/// Owner of a board cell. Red and Blue are the playing teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Neutral,
    Red,
    Blue,
    Black,
}

impl Team {
    /// The opposing team. Neutral and Black have no opponent and map to themselves.
    pub fn other(self) -> Team {
        match self {
            Team::Red => Team::Blue,
            Team::Blue => Team::Red,
            t => t,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Red => write!(f, "red"),
            Self::Blue => write!(f, "blue"),
            Self::Black => write!(f, "black"),
        }
    }
}

/// Rejections raised by the board transitions. None of them change the game.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("index {0} is invalid")]
    InvalidIndex(i64),
    #[error("cell has already been revealed")]
    AlreadyRevealed,
    #[error("game is already over")]
    GameOver,
}

/// Word generation state carried from one game to the next.
///
/// The pool is permuted deterministically by `seed` and consumed in blocks of
/// [`WORDS_PER_GAME`] starting at `perm_index`, so consecutive games sharing a
/// seed never repeat a word until the pool runs out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealState {
    pub seed: i64,
    #[serde(rename = "seed_index")]
    pub perm_index: usize,
    pub word_set: Arc<[String]>,
}

impl DealState {
    /// A fresh seed over `word_set`, starting at the top of the permutation.
    pub fn random(word_set: Arc<[String]>) -> Self {
        Self {
            seed: rand::rng().random(),
            perm_index: 0,
            word_set,
        }
    }

    /// Deal state for the game following this one. Keeps the seed when the pool
    /// is unchanged; a different pool starts over with a new seed.
    pub fn next(&self, word_set: Arc<[String]>) -> Self {
        if Arc::ptr_eq(&self.word_set, &word_set) || self.word_set == word_set {
            self.clone()
        } else {
            Self::random(word_set)
        }
    }

    fn exhausted(&self) -> bool {
        self.perm_index + WORDS_PER_GAME > self.word_set.len()
    }
}

/// Per-game timer settings chosen when the game is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOptions {
    #[serde(default)]
    pub timer_duration_ms: i64,
    #[serde(default)]
    pub enforce_timer: bool,
}

pub type CompletionHook = Arc<dyn Fn(&Game) + Send + Sync>;

/// Callbacks attached to a live game. Never persisted.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_complete: Option<CompletionHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// The full state of one game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub starting_team: Team,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_team: Option<Team>,
    pub round: u32,
    pub words: Vec<String>,
    pub layout: Vec<Team>,
    pub revealed: Vec<bool>,
    #[serde(flatten)]
    pub deal: DealState,
    #[serde(flatten)]
    pub options: GameOptions,
    #[serde(skip)]
    pub hooks: Hooks,
}

impl Game {
    /// Deal a new board for `id`, drawing the next block of words from `deal`.
    ///
    /// When the next block would run past the end of the pool a fresh seed is
    /// drawn first. Callers guarantee the pool holds at least [`WORDS_PER_GAME`] words.
    pub fn new(id: impl Into<String>, deal: DealState, options: GameOptions, hooks: Hooks) -> Self {
        let mut deal = deal;
        if deal.exhausted() {
            deal = DealState::random(deal.word_set);
        }

        let perm = permutation(deal.seed, deal.word_set.len());
        let words = perm[deal.perm_index..deal.perm_index + WORDS_PER_GAME]
            .iter()
            .map(|&i| deal.word_set[i].clone())
            .collect();
        deal.perm_index += WORDS_PER_GAME;

        let mut rng = rand::rng();
        let starting_team = if rng.random_bool(0.5) { Team::Red } else { Team::Blue };

        let mut layout = Vec::with_capacity(WORDS_PER_GAME);
        layout.extend([Team::Red; 8]);
        layout.extend([Team::Blue; 8]);
        layout.extend([Team::Neutral; 7]);
        layout.push(Team::Black);
        layout.push(starting_team);
        layout.shuffle(&mut rng);

        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            starting_team,
            winning_team: None,
            round: 0,
            words,
            layout,
            revealed: vec![false; WORDS_PER_GAME],
            deal,
            options,
            hooks,
        }
    }

    /// Monotonic token for this version of the game, a fixed-width hex
    /// encoding of `updated_at` so string order matches time order.
    pub fn state_id(&self) -> String {
        let nanos = self.updated_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        format!("{:016x}", nanos)
    }

    /// Team whose turn it is, a pure function of `round`.
    pub fn current_team(&self) -> Team {
        if self.round % 2 == 0 {
            self.starting_team
        } else {
            self.starting_team.other()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.winning_team.is_some()
    }

    pub fn any_revealed(&self) -> bool {
        self.revealed.iter().any(|&r| r)
    }

    /// Structural checks applied to records read back from storage.
    pub fn is_well_formed(&self) -> bool {
        self.words.len() == WORDS_PER_GAME
            && self.layout.len() == WORDS_PER_GAME
            && self.revealed.len() == WORDS_PER_GAME
            && self.deal.word_set.len() >= WORDS_PER_GAME
    }

    /// Reveal the cell at `index`.
    ///
    /// Revealing Black hands the game to the team not on turn. Otherwise a team
    /// that has every one of its cells revealed wins, and revealing a cell that
    /// isn't the current team's color ends the turn.
    pub fn guess(&mut self, index: i64) -> Result<(), GameError> {
        if self.is_completed() {
            return Err(GameError::GameOver);
        }
        let idx = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.layout.len())
            .ok_or(GameError::InvalidIndex(index))?;
        if self.revealed[idx] {
            return Err(GameError::AlreadyRevealed);
        }

        self.revealed[idx] = true;
        self.touch();

        let team = self.current_team();
        let cell = self.layout[idx];
        if cell == Team::Black {
            self.complete(team.other());
            return Ok(());
        }

        self.check_exhaustion();
        if cell != team {
            self.round += 1;
        }
        Ok(())
    }

    /// End the current turn. Returns false, leaving the game untouched, when the
    /// game is over or `expected_round` is stale.
    pub fn next_turn(&mut self, expected_round: Option<u32>) -> bool {
        if self.is_completed() {
            return false;
        }
        if expected_round.is_some_and(|r| r != self.round) {
            return false;
        }
        self.round += 1;
        self.touch();
        true
    }

    fn check_exhaustion(&mut self) {
        for team in [Team::Red, Team::Blue] {
            let remaining = self
                .layout
                .iter()
                .zip(&self.revealed)
                .any(|(&t, &revealed)| t == team && !revealed);
            if !remaining {
                self.complete(team);
            }
        }
    }

    // Every path to a winner goes through here; the hook fires once.
    fn complete(&mut self, winner: Team) {
        if self.winning_team.is_some() {
            return;
        }
        self.winning_team = Some(winner);
        if let Some(hook) = self.hooks.on_complete.clone() {
            hook(self);
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + TimeDelta::nanoseconds(1)
        };
    }
}

fn permutation(seed: i64, n: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed as u64);
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut rng);
    perm
}
