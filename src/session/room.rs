//! Room state machine: roster, lifecycle, scores and the round timer.
//!
//! A `Room` is plain state plus rule checks. It never talks to sockets or
//! storage; the room loop owns one instance, applies operations and turns
//! the results into wire effects. Timer handles pass through here as opaque
//! values so a started round always has at most one countdown task.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{PlayerSnapshot, RoomSnapshot};

use super::player::{Player, PlayerRole, PlayerStatus};

/// Where a room is in its game cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Waiting,
    InProgress,
    Ended,
}

/// Host-tunable room configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub name: String,
    pub capacity: usize,
    pub min_players_to_start: usize,
    pub round_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
}

/// Partial update for [`RoomSettings`]; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_players_to_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
}

/// Opaque handle for a running round countdown task.
#[derive(Debug)]
pub struct RoundTimer {
    handle: JoinHandle<()>,
}

impl RoundTimer {
    pub fn new(handle: JoinHandle<()>) -> Self {
        RoundTimer { handle }
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Result of a successful `start_game`.
///
/// `stale_timer` is a leftover countdown from an earlier round and must be
/// cancelled by the caller before it installs the new one.
#[derive(Debug)]
pub struct StartedRound {
    pub epoch: u64,
    pub ends_at: u64,
    pub stale_timer: Option<RoundTimer>,
}

/// Test-only equality; the timer handle is opaque, so only its presence
/// takes part in the comparison.
#[cfg(test)]
impl PartialEq for StartedRound {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
            && self.ends_at == other.ends_at
            && self.stale_timer.is_some() == other.stale_timer.is_some()
    }
}

/// How an admin score update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreChange {
    Absolute(u32),
    Delta(i64),
}

pub struct Room {
    pub id: String,
    pub settings: RoomSettings,
    pub lifecycle: Lifecycle,
    /// Latched when the first host joins; never cleared for the room's lifetime.
    pub host_seen: bool,
    /// Incremented on every game start; timer messages carry the epoch they
    /// belong to so ticks from a cancelled round are ignored.
    pub round_epoch: u64,
    pub started_at: Option<u64>,
    pub ends_at: Option<u64>,
    pub ended_at: Option<u64>,
    players: HashMap<String, Player>,
    timer: Option<RoundTimer>,
}

impl Room {
    pub fn new(id: String, settings: RoomSettings) -> Self {
        Room {
            id,
            settings,
            lifecycle: Lifecycle::Waiting,
            host_seen: false,
            round_epoch: 0,
            started_at: None,
            ends_at: None,
            ended_at: None,
            players: HashMap::new(),
            timer: None,
        }
    }

    // ------------------------------------------------------------------
    // Roster
    // ------------------------------------------------------------------

    /// Adds a new player, rejecting full rooms and duplicate stable ids.
    pub fn add_player(&mut self, player: Player) -> Result<(), SessionError> {
        if self.players.len() >= self.settings.capacity {
            return Err(SessionError::RoomFull {
                capacity: self.settings.capacity,
            });
        }
        if self.players.contains_key(&player.stable_id) {
            return Err(SessionError::DuplicateIdentity(player.stable_id.clone()));
        }
        self.players.insert(player.stable_id.clone(), player);
        Ok(())
    }

    /// Removes a player entirely, e.g. on kick. Returns the removed entry.
    pub fn remove_player(&mut self, stable_id: &str) -> Result<Player, SessionError> {
        self.players
            .remove(stable_id)
            .ok_or_else(|| SessionError::PlayerMissing(stable_id.to_string()))
    }

    /// Reattaches a known player to a fresh connection.
    ///
    /// Returns the previous connection id so the caller can close a socket
    /// that is still open, which keeps one player on exactly one connection.
    pub fn reconnect_player(
        &mut self,
        stable_id: &str,
        connection_id: Uuid,
    ) -> Result<Uuid, SessionError> {
        let in_progress = self.lifecycle == Lifecycle::InProgress;
        let player = self
            .players
            .get_mut(stable_id)
            .ok_or_else(|| SessionError::PlayerMissing(stable_id.to_string()))?;
        let previous = player.connection_id;
        player.connection_id = connection_id;
        player.status = match player.role {
            PlayerRole::Host => PlayerStatus::Controlling,
            PlayerRole::Contestant if in_progress => PlayerStatus::Playing,
            PlayerRole::Contestant => PlayerStatus::Waiting,
        };
        Ok(previous)
    }

    pub fn find(&self, stable_id: &str) -> Option<&Player> {
        self.players.get(stable_id)
    }

    pub fn find_mut(&mut self, stable_id: &str) -> Option<&mut Player> {
        self.players.get_mut(stable_id)
    }

    pub fn player_by_connection(&self, connection_id: Uuid) -> Option<&Player> {
        self.players
            .values()
            .find(|p| p.connection_id == connection_id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Resolves the caller behind a connection and requires the host role.
    pub fn require_host(&self, connection_id: Uuid) -> Result<&Player, SessionError> {
        let player = self
            .player_by_connection(connection_id)
            .ok_or_else(|| SessionError::PlayerMissing(connection_id.to_string()))?;
        if !player.is_host() {
            return Err(SessionError::NotHost);
        }
        Ok(player)
    }

    /// Makes `stable_id` the room's host, demoting any previous host, and
    /// latches `host_seen`.
    pub fn assign_host(&mut self, stable_id: &str) -> Result<(), SessionError> {
        if !self.players.contains_key(stable_id) {
            return Err(SessionError::PlayerMissing(stable_id.to_string()));
        }
        for player in self.players.values_mut() {
            if player.stable_id == stable_id {
                player.role = PlayerRole::Host;
                player.status = PlayerStatus::Controlling;
            } else if player.is_host() {
                player.role = PlayerRole::Contestant;
                player.status = PlayerStatus::Waiting;
            }
        }
        self.host_seen = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts a round. Host only, from `Waiting`, with enough players.
    pub fn start_game(
        &mut self,
        caller_stable_id: &str,
        now_ms: u64,
    ) -> Result<StartedRound, SessionError> {
        let caller = self
            .players
            .get(caller_stable_id)
            .ok_or_else(|| SessionError::PlayerMissing(caller_stable_id.to_string()))?;
        if !caller.is_host() {
            return Err(SessionError::NotHost);
        }
        if self.lifecycle != Lifecycle::Waiting {
            return Err(SessionError::InvalidLifecycle {
                expected: Lifecycle::Waiting,
                actual: self.lifecycle,
            });
        }
        if self.players.len() < self.settings.min_players_to_start {
            return Err(SessionError::NotEnoughPlayers {
                required: self.settings.min_players_to_start,
                current: self.players.len(),
            });
        }

        self.round_epoch += 1;
        self.lifecycle = Lifecycle::InProgress;
        self.started_at = Some(now_ms);
        self.ends_at = Some(now_ms + self.settings.round_duration_ms);
        self.ended_at = None;
        for player in self.players.values_mut() {
            player.last_similarity = None;
            if player.status != PlayerStatus::Disconnected {
                player.status = match player.role {
                    PlayerRole::Host => PlayerStatus::Controlling,
                    PlayerRole::Contestant => PlayerStatus::Playing,
                };
            }
        }

        Ok(StartedRound {
            epoch: self.round_epoch,
            ends_at: now_ms + self.settings.round_duration_ms,
            stale_timer: self.timer.take(),
        })
    }

    /// Ends the running round and hands back the countdown for cancellation.
    pub fn end_game(&mut self, now_ms: u64) -> Result<Option<RoundTimer>, SessionError> {
        if self.lifecycle != Lifecycle::InProgress {
            return Err(SessionError::InvalidLifecycle {
                expected: Lifecycle::InProgress,
                actual: self.lifecycle,
            });
        }
        self.lifecycle = Lifecycle::Ended;
        self.ended_at = Some(now_ms);
        for player in self.players.values_mut() {
            if player.status != PlayerStatus::Disconnected {
                player.status = match player.role {
                    PlayerRole::Host => PlayerStatus::Controlling,
                    PlayerRole::Contestant => PlayerStatus::Waiting,
                };
            }
        }
        Ok(self.timer.take())
    }

    // ------------------------------------------------------------------
    // Scores and rewards
    // ------------------------------------------------------------------

    /// Applies a score change and returns the new total.
    ///
    /// Deltas saturate at zero, a penalty can never make a score negative.
    pub fn update_score(
        &mut self,
        stable_id: &str,
        change: ScoreChange,
    ) -> Result<u32, SessionError> {
        let player = self
            .players
            .get_mut(stable_id)
            .ok_or_else(|| SessionError::PlayerMissing(stable_id.to_string()))?;
        player.score = match change {
            ScoreChange::Absolute(score) => score,
            ScoreChange::Delta(delta) => {
                let next = i64::from(player.score) + delta;
                next.clamp(0, i64::from(u32::MAX)) as u32
            }
        };
        Ok(player.score)
    }

    /// Records a solved challenge, refusing a second reward for the same one.
    pub fn mark_challenge_passed(
        &mut self,
        stable_id: &str,
        challenge_id: &str,
    ) -> Result<(), SessionError> {
        let player = self
            .players
            .get_mut(stable_id)
            .ok_or_else(|| SessionError::PlayerMissing(stable_id.to_string()))?;
        if player.passed.contains(challenge_id) {
            return Err(SessionError::DuplicateReward(challenge_id.to_string()));
        }
        player.passed.insert(challenge_id.to_string());
        Ok(())
    }

    pub fn has_passed(&self, stable_id: &str, challenge_id: &str) -> bool {
        self.players
            .get(stable_id)
            .map(|p| p.passed.contains(challenge_id))
            .unwrap_or(false)
    }

    /// Zeroes all scores, keeping passed-challenge history.
    pub fn reset_scores(&mut self) {
        for player in self.players.values_mut() {
            player.score = 0;
            player.last_similarity = None;
        }
    }

    /// Full reset: clears every player's progress and returns the room to
    /// `Waiting` so a new game can start. Hands back a running countdown,
    /// if any, for cancellation.
    pub fn reset_all_players(&mut self) -> Option<RoundTimer> {
        for player in self.players.values_mut() {
            player.score = 0;
            player.passed.clear();
            player.last_similarity = None;
            if player.status != PlayerStatus::Disconnected {
                player.status = match player.role {
                    PlayerRole::Host => PlayerStatus::Controlling,
                    PlayerRole::Contestant => PlayerStatus::Waiting,
                };
            }
        }
        self.lifecycle = Lifecycle::Waiting;
        self.started_at = None;
        self.ends_at = None;
        self.ended_at = None;
        self.timer.take()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Merges a settings patch and returns the result.
    ///
    /// Shrinking capacity below the current roster does not evict anyone;
    /// it only blocks further joins.
    pub fn apply_settings(&mut self, patch: SettingsPatch) -> RoomSettings {
        if let Some(name) = patch.name {
            self.settings.name = name;
        }
        if let Some(capacity) = patch.capacity {
            self.settings.capacity = capacity;
        }
        if let Some(min) = patch.min_players_to_start {
            self.settings.min_players_to_start = min;
        }
        if let Some(duration) = patch.round_duration_ms {
            self.settings.round_duration_ms = duration;
        }
        if let Some(welcome) = patch.welcome_message {
            self.settings.welcome_message = Some(welcome);
        }
        self.settings.clone()
    }

    // ------------------------------------------------------------------
    // Timer plumbing
    // ------------------------------------------------------------------

    pub fn set_timer(&mut self, timer: RoundTimer) {
        debug_assert!(self.timer.is_none(), "round timer installed twice");
        self.timer = Some(timer);
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Roster snapshots ordered by score descending, then by name.
    pub fn snapshots(&self) -> Vec<PlayerSnapshot> {
        let mut players: Vec<PlayerSnapshot> = self.players.values().map(Player::snapshot).collect();
        players.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        players
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            settings: self.settings.clone(),
            lifecycle: self.lifecycle,
            host_present: self.host_seen,
            players: self.snapshots(),
            started_at: self.started_at,
            ends_at: self.ends_at,
            ended_at: self.ended_at,
        }
    }
}
