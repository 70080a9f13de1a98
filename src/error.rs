//! Error taxonomy shared across the session manager, store and gateway.
//!
//! Session errors are recoverable per client: they are reported on the
//! originating connection as an `error` frame and never tear the room down.

use thiserror::Error;

use crate::session::room::Lifecycle;

/// Violations of room and player rules raised by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("room is full ({capacity} players)")]
    RoomFull { capacity: usize },

    #[error("player id {0:?} is already present in the room")]
    DuplicateIdentity(String),

    #[error("player {0:?} is not in the room")]
    PlayerMissing(String),

    #[error("only the host can perform this action")]
    NotHost,

    #[error("the host has not joined the room yet")]
    HostNotPresent,

    #[error("at least {required} players are required to start, have {current}")]
    NotEnoughPlayers { required: usize, current: usize },

    #[error("room is {actual:?}, operation requires {expected:?}")]
    InvalidLifecycle {
        expected: Lifecycle,
        actual: Lifecycle,
    },

    #[error("challenge {0:?} was already rewarded for this player")]
    DuplicateReward(String),
}

impl SessionError {
    /// Stable machine-readable code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::RoomFull { .. } => "ROOM_FULL",
            SessionError::DuplicateIdentity(_) => "DUPLICATE_IDENTITY",
            SessionError::PlayerMissing(_) => "PLAYER_MISSING",
            SessionError::NotHost => "NOT_HOST",
            SessionError::HostNotPresent => "HOST_NOT_PRESENT",
            SessionError::NotEnoughPlayers { .. } => "NOT_ENOUGH_PLAYERS",
            SessionError::InvalidLifecycle { .. } => "INVALID_LIFECYCLE",
            SessionError::DuplicateReward(_) => "DUPLICATE_REWARD",
        }
    }
}

/// Failures of the pre-upgrade credential check. Reported as HTTP 401
/// before the websocket handshake completes.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingCredentials,

    #[error("unknown user or wrong password")]
    InvalidCredentials,

    #[error("account storage unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

/// Failures of the JSON-file persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data in {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("challenge {0:?} does not exist")]
    UnknownChallenge(String),

    #[error("challenge id {0:?} contains invalid characters")]
    InvalidChallengeId(String),
}

impl StoreError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
