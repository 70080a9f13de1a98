//! Host-only administration commands.

use uuid::Uuid;

use crate::protocol::{AdminAction, ServerMessage};
use crate::session::room::{ScoreChange, SettingsPatch};

use super::room_loop::{protocol_error, session_error, Effect, RoomActor};

pub(crate) async fn handle_action(
    actor: &mut RoomActor,
    connection_id: Uuid,
    action: AdminAction,
) -> Vec<Effect> {
    if let Err(e) = actor.room.require_host(connection_id) {
        tracing::warn!(room_id = %actor.room.id, connection_id = %connection_id, "admin command from non-host");
        return vec![session_error(connection_id, &e)];
    }
    match action {
        AdminAction::KickPlayer { player_id, reason } => {
            kick_player(actor, connection_id, player_id, reason).await
        }
        AdminAction::ResetScores => reset_scores(actor).await,
        AdminAction::ResetPlayers => reset_players(actor).await,
        AdminAction::UpdateScore { player_id, score } => {
            update_score(actor, connection_id, player_id, score).await
        }
        AdminAction::ChangeSettings { settings } => change_settings(actor, settings).await,
    }
}

async fn kick_player(
    actor: &mut RoomActor,
    connection_id: Uuid,
    player_id: String,
    reason: Option<String>,
) -> Vec<Effect> {
    let is_host_target = actor
        .room
        .find(&player_id)
        .map(|p| p.is_host())
        .unwrap_or(false);
    if is_host_target {
        return vec![protocol_error(
            connection_id,
            "CANNOT_KICK_HOST",
            "the host cannot kick itself",
        )];
    }
    let player = match actor.room.remove_player(&player_id) {
        Ok(player) => player,
        Err(e) => return vec![session_error(connection_id, &e)],
    };
    // A kicked player's record goes too: rejoining starts from scratch.
    if let Err(e) = actor.state.store.remove_player(&player_id).await {
        tracing::warn!(player_id = %player_id, error = %e, "could not remove player record");
    }

    let reason = reason.unwrap_or_else(|| "kicked by the host".to_string());
    tracing::info!(room_id = %actor.room.id, player_id = %player_id, reason = %reason, "player kicked");

    let mut effects = Vec::new();
    if actor.connections.contains_key(&player.connection_id) {
        effects.push(Effect::Drop {
            connection_id: player.connection_id,
            farewell: Some(ServerMessage::Kicked { reason }),
        });
    }
    effects.push(Effect::Broadcast {
        message: ServerMessage::PlayerKicked {
            player_id,
            players: actor.room.snapshots(),
        },
    });
    effects
}

async fn reset_scores(actor: &mut RoomActor) -> Vec<Effect> {
    actor.room.reset_scores();
    actor.persist_all_players().await;
    tracing::info!(room_id = %actor.room.id, "scores reset");
    vec![Effect::Broadcast {
        message: ServerMessage::ScoresReset {
            players: actor.room.snapshots(),
        },
    }]
}

async fn reset_players(actor: &mut RoomActor) -> Vec<Effect> {
    if let Some(timer) = actor.room.reset_all_players() {
        timer.cancel();
    }
    actor.persist_all_players().await;
    tracing::info!(room_id = %actor.room.id, "players reset");
    vec![
        Effect::Broadcast {
            message: ServerMessage::ScoresUpdated {
                players: actor.room.snapshots(),
            },
        },
        Effect::Broadcast {
            message: ServerMessage::RoomDetails {
                room: actor.room.snapshot(),
            },
        },
    ]
}

async fn update_score(
    actor: &mut RoomActor,
    connection_id: Uuid,
    player_id: String,
    score: u32,
) -> Vec<Effect> {
    if let Err(e) = actor.room.update_score(&player_id, ScoreChange::Absolute(score)) {
        return vec![session_error(connection_id, &e)];
    }
    actor.persist_player(&player_id).await;
    tracing::info!(room_id = %actor.room.id, player_id = %player_id, score, "score overridden");
    vec![Effect::Broadcast {
        message: ServerMessage::ScoresUpdated {
            players: actor.room.snapshots(),
        },
    }]
}

async fn change_settings(actor: &mut RoomActor, patch: SettingsPatch) -> Vec<Effect> {
    let settings = actor.room.apply_settings(patch);
    if let Err(e) = actor.state.store.save_settings(&settings).await {
        tracing::warn!(room_id = %actor.room.id, error = %e, "could not persist settings");
    }
    tracing::info!(room_id = %actor.room.id, name = %settings.name, "settings changed");
    vec![Effect::Broadcast {
        message: ServerMessage::SettingsChanged {
            settings,
            room: actor.room.snapshot(),
        },
    }]
}
