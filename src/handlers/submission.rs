//! Submission judging and reward crediting.
//!
//! Compiling and running a program takes seconds, so judging never happens
//! inside the room loop. `handle_submit` spawns the job and returns at once;
//! the verdict re-enters the loop as a `SubmissionJudged` command and is
//! applied against whatever the room state is by then.

use uuid::Uuid;

use crate::error::SessionError;
use crate::executor::{ExecutionOutcome, Executor, Language};
use crate::protocol::ServerMessage;
use crate::scorer::{self, ScoreError, PERFECT_SCORE};
use crate::session::player::PlayerStatus;
use crate::session::room::{Lifecycle, ScoreChange};
use crate::shape::Shape;
use crate::store::Store;

use super::room_loop::{
    protocol_error, session_error, unknown_caller, Effect, RoomActor, RoomCommand,
};

/// Compiler and runtime output can be arbitrarily large; clients only need
/// the head of it.
const MAX_DIAGNOSTICS: usize = 4000;

/// Verdict of one judging job.
#[derive(Debug)]
pub enum Judged {
    /// Output was a grid of the right dimensions; `score` is its similarity.
    Scored {
        score: f64,
        shape: Shape,
        wall_time_ms: u64,
        difficulty: u32,
    },
    /// Output was a grid of the wrong dimensions. Scored as zero.
    WrongDimensions {
        shape: Shape,
        wall_time_ms: u64,
        got: (usize, usize),
        want: (usize, usize),
    },
    /// The program did not produce a usable grid at all.
    Failed {
        error: String,
        diagnostics: Option<String>,
    },
    /// The challenge itself could not be loaded.
    Unavailable { error: String },
}

pub(crate) fn handle_submit(
    actor: &mut RoomActor,
    connection_id: Uuid,
    challenge_id: String,
    source_code: String,
    language: Language,
) -> Vec<Effect> {
    let Some(player) = actor.room.player_by_connection(connection_id) else {
        return vec![unknown_caller(connection_id)];
    };
    let stable_id = player.stable_id.clone();
    if actor.room.lifecycle != Lifecycle::InProgress {
        return vec![session_error(
            connection_id,
            &SessionError::InvalidLifecycle {
                expected: Lifecycle::InProgress,
                actual: actor.room.lifecycle,
            },
        )];
    }

    tracing::info!(
        room_id = %actor.room.id,
        player_id = %stable_id,
        challenge_id = %challenge_id,
        language = language.as_str(),
        bytes = source_code.len(),
        "judging submission"
    );

    let store = actor.state.store.clone();
    let executor = actor.executor.clone();
    let handle = actor.handle.clone();
    tokio::spawn(async move {
        let judged = judge(&store, &executor, &challenge_id, &source_code, language).await;
        handle.send(RoomCommand::SubmissionJudged {
            connection_id,
            stable_id,
            challenge_id,
            judged,
        });
    });
    Vec::new()
}

/// Runs one submission end to end: challenge lookup, execution, scoring.
async fn judge(
    store: &Store,
    executor: &Executor,
    challenge_id: &str,
    source_code: &str,
    language: Language,
) -> Judged {
    let challenge = match store.load_challenge(challenge_id).await {
        Ok(challenge) => challenge,
        Err(e) => {
            tracing::warn!(challenge_id = %challenge_id, error = %e, "challenge unavailable");
            return Judged::Unavailable {
                error: format!("challenge {challenge_id} is not available"),
            };
        }
    };

    match executor.execute(source_code, language).await {
        ExecutionOutcome::Success {
            shape,
            wall_time_ms,
        } => match scorer::similarity(&challenge.target, &shape) {
            Ok(score) => Judged::Scored {
                score,
                shape,
                wall_time_ms,
                difficulty: challenge.difficulty,
            },
            Err(ScoreError::DimensionMismatch {
                got_rows,
                got_cols,
                want_rows,
                want_cols,
            }) => Judged::WrongDimensions {
                shape,
                wall_time_ms,
                got: (got_rows, got_cols),
                want: (want_rows, want_cols),
            },
        },
        ExecutionOutcome::CompileFailure { diagnostics } => Judged::Failed {
            error: "compilation failed".to_string(),
            diagnostics: Some(clip(diagnostics)).filter(|d| !d.is_empty()),
        },
        ExecutionOutcome::RuntimeFailure {
            diagnostics,
            exit_code,
        } => Judged::Failed {
            error: match exit_code {
                Some(code) => format!("program exited with status {code}"),
                None => "program failed to run".to_string(),
            },
            diagnostics: Some(clip(diagnostics)).filter(|d| !d.is_empty()),
        },
        ExecutionOutcome::Timeout => Judged::Failed {
            error: "time limit exceeded".to_string(),
            diagnostics: None,
        },
        ExecutionOutcome::ParseFailure { raw_output } => Judged::Failed {
            error: "output is not a rectangular integer grid".to_string(),
            diagnostics: Some(clip(raw_output)).filter(|d| !d.is_empty()),
        },
    }
}

pub(crate) async fn handle_judged(
    actor: &mut RoomActor,
    connection_id: Uuid,
    stable_id: String,
    challenge_id: String,
    judged: Judged,
) -> Vec<Effect> {
    // Kicked or reset while the job ran; the verdict has no recipient.
    if actor.room.find(&stable_id).is_none() {
        tracing::debug!(player_id = %stable_id, "discarding verdict for removed player");
        return Vec::new();
    }

    match judged {
        Judged::Unavailable { error } => vec![Effect::Unicast {
            connection_id,
            message: failure(challenge_id, error, None),
        }],
        Judged::Failed { error, diagnostics } => vec![Effect::Unicast {
            connection_id,
            message: failure(challenge_id, error, diagnostics),
        }],
        Judged::WrongDimensions {
            shape,
            wall_time_ms,
            got,
            want,
        } => {
            if let Some(player) = actor.room.find_mut(&stable_id) {
                player.last_similarity = Some(0.0);
                player.status = PlayerStatus::Submitted;
            }
            actor.persist_player(&stable_id).await;
            vec![Effect::Unicast {
                connection_id,
                message: ServerMessage::SolutionResult {
                    challenge_id,
                    success: false,
                    score: Some(0.0),
                    passed: false,
                    already_passed: false,
                    shape: Some(shape),
                    wall_time_ms: Some(wall_time_ms),
                    error: Some(format!(
                        "output is {}x{}, the target is {}x{}",
                        got.0, got.1, want.0, want.1
                    )),
                    diagnostics: None,
                },
            }]
        }
        Judged::Scored {
            score,
            shape,
            wall_time_ms,
            difficulty,
        } => {
            if let Some(player) = actor.room.find_mut(&stable_id) {
                player.last_similarity = Some(score);
                player.status = PlayerStatus::Submitted;
            }
            if !scorer::is_perfect(score) {
                actor.persist_player(&stable_id).await;
                // Partial scores stay between the server and the submitter.
                return vec![Effect::Unicast {
                    connection_id,
                    message: ServerMessage::SolutionResult {
                        challenge_id,
                        success: true,
                        score: Some(score),
                        passed: false,
                        already_passed: false,
                        shape: Some(shape),
                        wall_time_ms: Some(wall_time_ms),
                        error: None,
                        diagnostics: None,
                    },
                }];
            }
            credit(
                actor,
                connection_id,
                &stable_id,
                challenge_id,
                difficulty,
                score,
                Some(shape),
                Some(wall_time_ms),
            )
            .await
        }
    }
}

/// Credits a perfect match exactly once per (player, challenge).
///
/// The room loop serializes all crediting, so two rival verdicts for the
/// same challenge pass through here one after the other and the second one
/// always takes the `already_passed` branch.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn credit(
    actor: &mut RoomActor,
    connection_id: Uuid,
    stable_id: &str,
    challenge_id: String,
    difficulty: u32,
    score: f64,
    shape: Option<Shape>,
    wall_time_ms: Option<u64>,
) -> Vec<Effect> {
    if let Err(e) = actor.room.mark_challenge_passed(stable_id, &challenge_id) {
        tracing::debug!(player_id = %stable_id, challenge_id = %challenge_id, error = %e, "reward already granted");
        return vec![Effect::Unicast {
            connection_id,
            message: ServerMessage::SolutionResult {
                challenge_id,
                success: true,
                score: Some(score),
                passed: true,
                already_passed: true,
                shape,
                wall_time_ms,
                error: None,
                diagnostics: None,
            },
        }];
    }

    let total_score = match actor
        .room
        .update_score(stable_id, ScoreChange::Delta(difficulty as i64))
    {
        Ok(total) => total,
        Err(e) => return vec![session_error(connection_id, &e)],
    };
    actor.persist_player(stable_id).await;

    tracing::info!(
        room_id = %actor.room.id,
        player_id = %stable_id,
        challenge_id = %challenge_id,
        difficulty,
        total_score,
        "challenge passed"
    );

    vec![
        Effect::Unicast {
            connection_id,
            message: ServerMessage::SolutionResult {
                challenge_id,
                success: true,
                score: Some(score),
                passed: true,
                already_passed: false,
                shape,
                wall_time_ms,
                error: None,
                diagnostics: None,
            },
        },
        Effect::Unicast {
            connection_id,
            message: ServerMessage::ScoreUpdated {
                player_id: stable_id.to_string(),
                score: difficulty,
                total_score,
            },
        },
        Effect::Broadcast {
            message: ServerMessage::ScoresUpdated {
                players: actor.room.snapshots(),
            },
        },
    ]
}

pub(crate) fn handle_claim(
    actor: &mut RoomActor,
    connection_id: Uuid,
    challenge_id: String,
    score: f64,
) -> Vec<Effect> {
    let Some(player) = actor.room.player_by_connection(connection_id) else {
        return vec![unknown_caller(connection_id)];
    };
    let stable_id = player.stable_id.clone();
    if actor.room.lifecycle != Lifecycle::InProgress {
        return vec![session_error(
            connection_id,
            &SessionError::InvalidLifecycle {
                expected: Lifecycle::InProgress,
                actual: actor.room.lifecycle,
            },
        )];
    }
    if !scorer::is_perfect(score) {
        return vec![protocol_error(
            connection_id,
            "INVALID_CLAIM",
            "claimed score is not a full match",
        )];
    }
    if actor.room.has_passed(&stable_id, &challenge_id) {
        return vec![Effect::Unicast {
            connection_id,
            message: ServerMessage::SolutionResult {
                challenge_id,
                success: true,
                score: Some(PERFECT_SCORE),
                passed: true,
                already_passed: true,
                shape: None,
                wall_time_ms: None,
                error: None,
                diagnostics: None,
            },
        }];
    }

    // The claim is only worth the challenge's difficulty, which lives in the
    // store; look it up off-loop and re-enter.
    let store = actor.state.store.clone();
    let handle = actor.handle.clone();
    tokio::spawn(async move {
        let difficulty = match store.load_challenge(&challenge_id).await {
            Ok(challenge) => Some(challenge.difficulty),
            Err(e) => {
                tracing::warn!(challenge_id = %challenge_id, error = %e, "claimed challenge unavailable");
                None
            }
        };
        handle.send(RoomCommand::ClaimChecked {
            connection_id,
            stable_id,
            challenge_id,
            difficulty,
        });
    });
    Vec::new()
}

pub(crate) async fn handle_claim_checked(
    actor: &mut RoomActor,
    connection_id: Uuid,
    stable_id: String,
    challenge_id: String,
    difficulty: Option<u32>,
) -> Vec<Effect> {
    if actor.room.find(&stable_id).is_none() {
        return Vec::new();
    }
    let Some(difficulty) = difficulty else {
        return vec![protocol_error(
            connection_id,
            "UNKNOWN_CHALLENGE",
            format!("no such challenge: {challenge_id}"),
        )];
    };
    credit(
        actor,
        connection_id,
        &stable_id,
        challenge_id,
        difficulty,
        PERFECT_SCORE,
        None,
        None,
    )
    .await
}

fn failure(challenge_id: String, error: String, diagnostics: Option<String>) -> ServerMessage {
    ServerMessage::SolutionResult {
        challenge_id,
        success: false,
        score: None,
        passed: false,
        already_passed: false,
        shape: None,
        wall_time_ms: None,
        error: Some(error),
        diagnostics,
    }
}

fn clip(mut text: String) -> String {
    if text.len() > MAX_DIAGNOSTICS {
        let mut end = MAX_DIAGNOSTICS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}
