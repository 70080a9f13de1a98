//! Round lifecycle: starting, the countdown, and finishing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::ServerMessage;
use crate::session::room::{Lifecycle, RoundTimer};
use crate::store::{GameResults, LeaderboardEntry};

use super::room_loop::{session_error, unknown_caller, Effect, RoomActor, RoomCommand, RoomHandle};

/// Interval at which the timer task re-checks the clock. Reports go out
/// once per second; the finer grain keeps the final expiry prompt.
const TIMER_RESOLUTION: Duration = Duration::from_millis(250);

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) async fn handle_start(actor: &mut RoomActor, connection_id: uuid::Uuid) -> Vec<Effect> {
    let Some(player) = actor.room.player_by_connection(connection_id) else {
        return vec![unknown_caller(connection_id)];
    };
    let stable_id = player.stable_id.clone();

    let started = match actor.room.start_game(&stable_id, now_ms()) {
        Ok(started) => started,
        Err(e) => return vec![session_error(connection_id, &e)],
    };
    if let Some(stale) = started.stale_timer {
        stale.cancel();
    }
    let timer = spawn_round_timer(actor.handle.clone(), started.epoch, started.ends_at);
    actor.room.set_timer(timer);
    actor.persist_all_players().await;

    tracing::info!(
        room_id = %actor.room.id,
        epoch = started.epoch,
        ends_at = started.ends_at,
        "game started"
    );
    vec![Effect::Broadcast {
        message: ServerMessage::GameStarted {
            room: actor.room.snapshot(),
            end_time: started.ends_at,
        },
    }]
}

pub(crate) async fn handle_end(actor: &mut RoomActor, connection_id: uuid::Uuid) -> Vec<Effect> {
    if let Err(e) = actor.room.require_host(connection_id) {
        return vec![session_error(connection_id, &e)];
    }
    if actor.room.lifecycle != Lifecycle::InProgress {
        return vec![session_error(
            connection_id,
            &crate::error::SessionError::InvalidLifecycle {
                expected: Lifecycle::InProgress,
                actual: actor.room.lifecycle,
            },
        )];
    }
    finish_game(actor, now_ms()).await
}

/// Spawns the countdown task for one round. The task reports the remaining
/// time roughly once per second and fires a single expiry message; every
/// message carries the round epoch so a restart invalidates it.
fn spawn_round_timer(handle: RoomHandle, epoch: u64, ends_at: u64) -> RoundTimer {
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TIMER_RESOLUTION);
        let mut last_reported_secs = u64::MAX;
        loop {
            interval.tick().await;
            let remaining_ms = ends_at.saturating_sub(now_ms());
            if remaining_ms == 0 {
                handle.send(RoomCommand::TimerExpired { epoch });
                return;
            }
            let secs = remaining_ms / 1000;
            if secs != last_reported_secs {
                last_reported_secs = secs;
                handle.send(RoomCommand::TimerTick {
                    epoch,
                    remaining_ms,
                });
            }
        }
    });
    RoundTimer::new(task)
}

pub(crate) fn handle_timer_tick(actor: &RoomActor, epoch: u64, remaining_ms: u64) -> Vec<Effect> {
    if epoch != actor.room.round_epoch || actor.room.lifecycle != Lifecycle::InProgress {
        return Vec::new();
    }
    vec![Effect::Broadcast {
        message: ServerMessage::TimeUpdate {
            time_left_ms: remaining_ms,
        },
    }]
}

pub(crate) async fn handle_timer_expired(actor: &mut RoomActor, epoch: u64) -> Vec<Effect> {
    if epoch != actor.room.round_epoch || actor.room.lifecycle != Lifecycle::InProgress {
        return Vec::new();
    }
    tracing::info!(room_id = %actor.room.id, epoch, "round timer expired");
    finish_game(actor, now_ms()).await
}

/// Ends the running round, stores the outcome and announces it.
///
/// Callers must have checked that the room is in progress.
pub(crate) async fn finish_game(actor: &mut RoomActor, now_ms: u64) -> Vec<Effect> {
    let timer = match actor.room.end_game(now_ms) {
        Ok(timer) => timer,
        Err(e) => {
            tracing::warn!(room_id = %actor.room.id, error = %e, "finish requested on idle room");
            return Vec::new();
        }
    };
    if let Some(timer) = timer {
        timer.cancel();
    }
    actor.persist_all_players().await;

    let results = actor.room.snapshots();
    let record = GameResults {
        room_id: actor.room.id.clone(),
        started_at: actor.room.started_at,
        ended_at: now_ms,
        players: results.clone(),
    };
    if let Err(e) = actor.state.store.append_game_results(&record).await {
        tracing::warn!(room_id = %actor.room.id, error = %e, "could not store game results");
    }
    let leaderboard: Vec<LeaderboardEntry> = results
        .iter()
        .map(|p| LeaderboardEntry {
            player_id: p.player_id.clone(),
            name: p.name.clone(),
            score: p.score,
        })
        .collect();
    if let Err(e) = actor.state.store.save_leaderboard(&leaderboard).await {
        tracing::warn!(room_id = %actor.room.id, error = %e, "could not store leaderboard");
    }

    tracing::info!(room_id = %actor.room.id, players = results.len(), "game ended");
    vec![Effect::Broadcast {
        message: ServerMessage::GameEnded {
            room: actor.room.snapshot(),
            results,
        },
    }]
}
