//! Client-server message protocol definitions.
//!
//! Frames are JSON objects tagged by `type` with the body under `payload`.
//! Admin actions nest one level deeper under `command`/`data` so the set of
//! privileged operations stays a closed enum.

use serde::{Deserialize, Serialize};

use crate::executor::Language;
use crate::session::player::{PlayerRole, PlayerStatus};
use crate::session::room::{Lifecycle, RoomSettings, SettingsPatch};
use crate::shape::Shape;

/// Client -> server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    // Game control
    StartGame,
    EndGame,

    // Judging
    SubmitSolution {
        challenge_id: String,
        source_code: String,
        language: Language,
    },
    ShapePassed {
        challenge_id: String,
        score: f64,
    },

    // Host administration
    AdminCommand(AdminAction),

    // Queries
    RequestRoomDetails,
    RequestAvailableShapes,

    // Chat
    SendMessage {
        message: String,
    },
    SendSystemMessage {
        message: String,
    },
}

/// Privileged actions the host can issue through `admin_command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum AdminAction {
    KickPlayer {
        player_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ResetScores,
    ResetPlayers,
    UpdateScore {
        player_id: String,
        score: u32,
    },
    ChangeSettings {
        settings: SettingsPatch,
    },
}

/// Server -> client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    // Connection
    RoomJoined {
        room: RoomSnapshot,
        player_id: String,
        is_host: bool,
        reconnected: bool,
    },
    Error {
        code: String,
        message: String,
    },
    Kicked {
        reason: String,
    },

    // Roster events
    PlayerJoined {
        player: PlayerSnapshot,
        room: RoomSnapshot,
    },
    PlayerDisconnected {
        player_id: String,
        players: Vec<PlayerSnapshot>,
    },
    PlayerKicked {
        player_id: String,
        players: Vec<PlayerSnapshot>,
    },

    // Game lifecycle
    GameStarted {
        room: RoomSnapshot,
        end_time: u64,
    },
    GameEnded {
        room: RoomSnapshot,
        results: Vec<PlayerSnapshot>,
    },
    TimeUpdate {
        time_left_ms: u64,
    },

    // Judging
    SolutionResult {
        challenge_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        passed: bool,
        already_passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        shape: Option<Shape>,
        #[serde(skip_serializing_if = "Option::is_none")]
        wall_time_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        diagnostics: Option<String>,
    },
    ScoreUpdated {
        player_id: String,
        score: u32,
        total_score: u32,
    },
    ScoresUpdated {
        players: Vec<PlayerSnapshot>,
    },
    ScoresReset {
        players: Vec<PlayerSnapshot>,
    },

    // Administration
    SettingsChanged {
        settings: RoomSettings,
        room: RoomSnapshot,
    },

    // Queries
    RoomDetails {
        room: RoomSnapshot,
    },
    AvailableShapes {
        shapes: Vec<ChallengeInfo>,
    },

    // Chat
    NewMessage {
        sender: String,
        sender_id: String,
        message: String,
        timestamp: u64,
        is_host: bool,
        is_system: bool,
    },
}

/// Public view of one player, safe to broadcast to the whole room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub player_id: String,
    pub name: String,
    pub role: PlayerRole,
    pub status: PlayerStatus,
    pub score: u32,
    pub passed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_similarity: Option<f64>,
}

/// Public view of the room, sent on join and with lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub settings: RoomSettings,
    pub lifecycle: Lifecycle,
    pub host_present: bool,
    pub players: Vec<PlayerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

/// One selectable challenge, as listed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    pub id: String,
    pub difficulty: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_variants_serialize_without_payload() {
        let json = serde_json::to_string(&ClientMessage::StartGame).unwrap();
        assert_eq!(json, r#"{"type":"start_game"}"#);
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"end_game"}"#).unwrap(),
            ClientMessage::EndGame
        ));
    }

    #[test]
    fn submit_solution_deserializes_from_snake_case() {
        let json = r#"{
            "type": "submit_solution",
            "payload": {
                "challenge_id": "3",
                "source_code": "print(1)",
                "language": "python"
            }
        }"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::SubmitSolution {
                challenge_id,
                source_code,
                language,
            } => {
                assert_eq!(challenge_id, "3");
                assert_eq!(source_code, "print(1)");
                assert_eq!(language, Language::Python);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn admin_commands_nest_under_command_and_data() {
        let json = r#"{
            "type": "admin_command",
            "payload": {
                "command": "kick_player",
                "data": { "player_id": "p-2", "reason": "afk" }
            }
        }"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::AdminCommand(AdminAction::KickPlayer { player_id, reason }) => {
                assert_eq!(player_id, "p-2");
                assert_eq!(reason.as_deref(), Some("afk"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let json = r#"{"type":"admin_command","payload":{"command":"reset_scores"}}"#;
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(json).unwrap(),
            ClientMessage::AdminCommand(AdminAction::ResetScores)
        ));
    }

    #[test]
    fn error_frames_carry_code_and_message() {
        let msg = ServerMessage::Error {
            code: "ROOM_FULL".into(),
            message: "room is full (5 players)".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","payload":{"code":"ROOM_FULL","message":"room is full (5 players)"}}"#
        );
    }

    #[test]
    fn solution_result_omits_absent_fields() {
        let msg = ServerMessage::SolutionResult {
            challenge_id: "1".into(),
            success: false,
            score: None,
            passed: false,
            already_passed: false,
            shape: None,
            wall_time_ms: None,
            error: Some("time limit exceeded".into()),
            diagnostics: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("score"));
        assert!(!json.contains("shape"));
        assert!(!json.contains("diagnostics"));
        assert!(json.contains(r#""error":"time limit exceeded""#));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"format_disk"}"#);
        assert!(err.is_err());
    }
}
