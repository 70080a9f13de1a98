//! Player identity and per-player game state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::PlayerSnapshot;

/// Role inside a room. The host controls the game, contestants play it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerRole {
    Host,
    Contestant,
}

/// Coarse activity state, broadcast with every roster snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Waiting,
    Controlling,
    Playing,
    Submitted,
    Disconnected,
}

/// One participant of a room.
///
/// `stable_id` survives reconnects and is the key for scores and rewards;
/// `connection_id` identifies the current socket and is replaced every time
/// the same player connects again.
#[derive(Debug, Clone)]
pub struct Player {
    pub connection_id: Uuid,
    pub stable_id: String,
    pub name: String,
    pub role: PlayerRole,
    pub status: PlayerStatus,
    pub score: u32,
    pub passed: HashSet<String>,
    /// Similarity of the most recent judged submission, cleared on game start.
    pub last_similarity: Option<f64>,
}

impl Player {
    pub fn new(connection_id: Uuid, stable_id: String, name: String, role: PlayerRole) -> Self {
        let status = match role {
            PlayerRole::Host => PlayerStatus::Controlling,
            PlayerRole::Contestant => PlayerStatus::Waiting,
        };
        Player {
            connection_id,
            stable_id,
            name,
            role,
            status,
            score: 0,
            passed: HashSet::new(),
            last_similarity: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == PlayerRole::Host
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let mut passed: Vec<String> = self.passed.iter().cloned().collect();
        passed.sort();
        PlayerSnapshot {
            player_id: self.stable_id.clone(),
            name: self.name.clone(),
            role: self.role,
            status: self.status,
            score: self.score,
            passed,
            last_similarity: self.last_similarity,
        }
    }
}
