//! JSON and text file persistence under the data directory.
//!
//! Layout:
//!
//! ```text
//! accounts.json              registered users with credential digests
//! room_settings.json         host-tuned settings, survive restarts
//! session/<player>.json      per-player score and reward records
//! shapes/shape<ID>.txt       challenge targets, "rows cols difficulty" header
//! results/<ts>-<room>.json   final scoreboard of every finished game
//! leaderboard.json           most recently written leaderboard
//! ```
//!
//! Reads treat a missing file as absence, not an error; writes create parent
//! directories as needed.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::protocol::{ChallengeInfo, PlayerSnapshot};
use crate::session::room::RoomSettings;
use crate::shape::Shape;

const ACCOUNTS_FILE: &str = "accounts.json";
const SETTINGS_FILE: &str = "room_settings.json";
const LEADERBOARD_FILE: &str = "leaderboard.json";
const SESSION_DIR: &str = "session";
const SHAPES_DIR: &str = "shapes";
const RESULTS_DIR: &str = "results";

/// A registered user. `digest` is the base64 HMAC-SHA1 of the password
/// under the server's auth secret, never the password itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub digest: String,
    #[serde(default)]
    pub host: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountsFile {
    users: Vec<Account>,
}

/// Durable per-player state, written on every score change so scores and
/// rewards survive reconnects and server restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub stable_id: String,
    pub name: String,
    pub score: u32,
    pub passed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    settings: RoomSettings,
}

/// A challenge target loaded from its shape file.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: String,
    pub difficulty: u32,
    pub target: Shape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub player_id: String,
    pub name: String,
    pub score: u32,
}

/// Final scoreboard of one finished game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResults {
    pub room_id: String,
    pub started_at: Option<u64>,
    pub ended_at: u64,
    pub players: Vec<PlayerSnapshot>,
}

pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Store {
            data_dir: data_dir.into(),
        }
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Looks up an account by username, case-insensitively.
    pub async fn load_account(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let path = self.data_dir.join(ACCOUNTS_FILE);
        let file: Option<AccountsFile> = self.read_json(&path).await?;
        Ok(file.and_then(|f| {
            f.users
                .into_iter()
                .find(|u| u.username.eq_ignore_ascii_case(username))
        }))
    }

    // ------------------------------------------------------------------
    // Player records
    // ------------------------------------------------------------------

    pub async fn load_player(&self, stable_id: &str) -> Result<Option<PlayerRecord>, StoreError> {
        if !is_safe_component(stable_id) {
            return Ok(None);
        }
        let path = self.player_path(stable_id);
        self.read_json(&path).await
    }

    pub async fn save_player(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        if !is_safe_component(&record.stable_id) {
            return Ok(());
        }
        let path = self.player_path(&record.stable_id);
        self.write_json(&path, record).await
    }

    /// Deletes a player's record, e.g. on kick. Missing files are fine.
    pub async fn remove_player(&self, stable_id: &str) -> Result<(), StoreError> {
        if !is_safe_component(stable_id) {
            return Ok(());
        }
        let path = self.player_path(stable_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    fn player_path(&self, stable_id: &str) -> PathBuf {
        self.data_dir
            .join(SESSION_DIR)
            .join(format!("{stable_id}.json"))
    }

    // ------------------------------------------------------------------
    // Room settings
    // ------------------------------------------------------------------

    pub async fn load_settings(&self) -> Result<Option<RoomSettings>, StoreError> {
        let path = self.data_dir.join(SETTINGS_FILE);
        let file: Option<SettingsFile> = self.read_json(&path).await?;
        Ok(file.map(|f| f.settings))
    }

    pub async fn save_settings(&self, settings: &RoomSettings) -> Result<(), StoreError> {
        let path = self.data_dir.join(SETTINGS_FILE);
        self.write_json(
            &path,
            &SettingsFile {
                settings: settings.clone(),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Challenges
    // ------------------------------------------------------------------

    /// Loads one challenge target from `shapes/shape<ID>.txt`.
    ///
    /// Ids must be plain digit strings; anything else is rejected before it
    /// can reach the filesystem.
    pub async fn load_challenge(&self, id: &str) -> Result<Challenge, StoreError> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StoreError::InvalidChallengeId(id.to_string()));
        }
        let path = self
            .data_dir
            .join(SHAPES_DIR)
            .join(format!("shape{id}.txt"));
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::UnknownChallenge(id.to_string()));
            }
            Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
        };
        parse_challenge(id, &path, &text)
    }

    /// Lists the challenges on disk, ordered by numeric id.
    pub async fn list_challenges(&self) -> Result<Vec<ChallengeInfo>, StoreError> {
        let dir = self.data_dir.join(SHAPES_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir.display().to_string(), e)),
        };

        let mut infos = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))?
        {
            let name = entry.file_name();
            let Some(id) = challenge_id_from_file_name(&name.to_string_lossy()) else {
                continue;
            };
            match self.load_challenge(&id).await {
                Ok(challenge) => infos.push(ChallengeInfo {
                    id: challenge.id,
                    difficulty: challenge.difficulty,
                }),
                Err(e) => {
                    tracing::warn!(file = %name.to_string_lossy(), error = %e, "skipping unreadable shape file");
                }
            }
        }
        infos.sort_by_key(|info| info.id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(infos)
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub async fn append_game_results(&self, results: &GameResults) -> Result<(), StoreError> {
        let path = self
            .data_dir
            .join(RESULTS_DIR)
            .join(format!("{}-{}.json", results.ended_at, results.room_id));
        self.write_json(&path, results).await
    }

    pub async fn save_leaderboard(&self, entries: &[LeaderboardEntry]) -> Result<(), StoreError> {
        let path = self.data_dir.join(LEADERBOARD_FILE);
        self.write_json(&path, &entries).await
    }

    // ------------------------------------------------------------------
    // Shared read/write helpers
    // ------------------------------------------------------------------

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::malformed(path.display().to_string(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent.display().to_string(), e))?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::malformed(path.display().to_string(), e.to_string()))?;
        fs::write(path, bytes)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))
    }
}

/// Allows only names that stay inside their directory when used as a file
/// name component.
fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn challenge_id_from_file_name(name: &str) -> Option<String> {
    let id = name.strip_prefix("shape")?.strip_suffix(".txt")?;
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Parses a shape file: a `rows cols difficulty` header line followed by the
/// grid itself.
fn parse_challenge(id: &str, path: &Path, text: &str) -> Result<Challenge, StoreError> {
    let path_str = path.display().to_string();
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| StoreError::malformed(path_str.as_str(), "empty shape file"))?;
    let mut header_tokens = header.split_whitespace();
    let mut next_number = |what: &str| -> Result<u64, StoreError> {
        header_tokens
            .next()
            .ok_or_else(|| StoreError::malformed(path_str.as_str(), format!("header is missing {what}")))?
            .parse::<u64>()
            .map_err(|_| StoreError::malformed(path_str.as_str(), format!("header has non-numeric {what}")))
    };
    let rows = next_number("row count")? as usize;
    let cols = next_number("column count")? as usize;
    let difficulty = next_number("difficulty")? as u32;

    let mut cells = Vec::with_capacity(rows);
    for line in lines {
        let row = line
            .split_whitespace()
            .map(|token| {
                token.parse::<i64>().map_err(|_| {
                    StoreError::malformed(path_str.as_str(), format!("non-numeric cell {token:?}"))
                })
            })
            .collect::<Result<Vec<i64>, StoreError>>()?;
        cells.push(row);
    }
    let target =
        Shape::from_rows(cells).map_err(|e| StoreError::malformed(path_str.as_str(), e.to_string()))?;
    if target.rows() != rows || target.cols() != cols {
        return Err(StoreError::malformed(
            path_str.as_str(),
            format!(
                "header declares {rows}x{cols} but grid is {}x{}",
                target.rows(),
                target.cols()
            ),
        ));
    }

    Ok(Challenge {
        id: id.to_string(),
        difficulty,
        target,
    })
}
