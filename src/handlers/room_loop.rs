//! Per-room message loop.
//!
//! Every room runs as one task that owns its state outright. Sockets,
//! countdown timers and judging jobs all talk to it through [`RoomCommand`]
//! messages, and each command is handled to completion before the next one
//! starts, so score and reward updates never interleave. Handlers return
//! [`Effect`] lists which the loop applies to the connected sockets after
//! the state change is done.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::SessionError;
use crate::executor::Executor;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::player::{Player, PlayerRole, PlayerStatus};
use crate::session::room::{Lifecycle, Room};
use crate::state::AppState;
use crate::store::PlayerRecord;

use super::{admin, game, submission};

/// Messages delivered to a room loop.
#[derive(Debug)]
pub enum RoomCommand {
    /// A freshly authenticated socket wants to enter.
    Join(JoinRequest),
    /// A frame arrived on a connection that already joined.
    Frame {
        connection_id: Uuid,
        message: ClientMessage,
    },
    /// The socket task ended, cleanly or not.
    Disconnected { connection_id: Uuid },
    /// A judging job finished for a submitted program.
    SubmissionJudged {
        connection_id: Uuid,
        stable_id: String,
        challenge_id: String,
        judged: submission::Judged,
    },
    /// A client-side pass claim was checked against the challenge store.
    ClaimChecked {
        connection_id: Uuid,
        stable_id: String,
        challenge_id: String,
        difficulty: Option<u32>,
    },
    /// Periodic countdown report from the round timer task.
    TimerTick { epoch: u64, remaining_ms: u64 },
    /// The round timer ran out.
    TimerExpired { epoch: u64 },
}

/// A new socket asking to enter the room.
#[derive(Debug)]
pub struct JoinRequest {
    pub connection_id: Uuid,
    pub stable_id: String,
    pub name: String,
    pub host: bool,
    pub sender: UnboundedSender<Outbound>,
}

/// What the loop tells a socket task to do.
#[derive(Debug, Clone)]
pub enum Outbound {
    Deliver(ServerMessage),
    Close,
}

/// Wire effects produced by handling one command.
#[derive(Debug)]
pub enum Effect {
    Unicast {
        connection_id: Uuid,
        message: ServerMessage,
    },
    Broadcast {
        message: ServerMessage,
    },
    /// Optionally deliver a farewell, then close that one socket.
    Drop {
        connection_id: Uuid,
        farewell: Option<ServerMessage>,
    },
    /// Close every socket in the room.
    CloseAll,
}

/// Cloneable sender half, held by sockets and background tasks.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    commands: UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("room loop is gone, dropping command");
        }
    }
}

/// Starts the message loop for `room` and returns its handle.
pub fn spawn_room(state: Arc<AppState>, room: Room) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle { commands: tx };
    let actor = RoomActor {
        executor: Executor::new(&state.config.executor),
        state,
        room,
        handle: handle.clone(),
        connections: HashMap::new(),
    };
    tokio::spawn(actor.run(rx));
    handle
}

pub(crate) struct RoomActor {
    pub(crate) state: Arc<AppState>,
    pub(crate) room: Room,
    pub(crate) executor: Executor,
    pub(crate) handle: RoomHandle,
    pub(crate) connections: HashMap<Uuid, UnboundedSender<Outbound>>,
}

impl RoomActor {
    async fn run(mut self, mut commands: UnboundedReceiver<RoomCommand>) {
        tracing::info!(room_id = %self.room.id, "room loop started");
        while let Some(command) = commands.recv().await {
            let effects = self.handle_command(command).await;
            self.apply(effects);
        }
        tracing::info!(room_id = %self.room.id, "room loop stopped");
    }

    async fn handle_command(&mut self, command: RoomCommand) -> Vec<Effect> {
        match command {
            RoomCommand::Join(request) => self.handle_join(request).await,
            RoomCommand::Frame {
                connection_id,
                message,
            } => self.handle_frame(connection_id, message).await,
            RoomCommand::Disconnected { connection_id } => {
                self.handle_disconnected(connection_id).await
            }
            RoomCommand::SubmissionJudged {
                connection_id,
                stable_id,
                challenge_id,
                judged,
            } => submission::handle_judged(self, connection_id, stable_id, challenge_id, judged).await,
            RoomCommand::ClaimChecked {
                connection_id,
                stable_id,
                challenge_id,
                difficulty,
            } => {
                submission::handle_claim_checked(self, connection_id, stable_id, challenge_id, difficulty)
                    .await
            }
            RoomCommand::TimerTick {
                epoch,
                remaining_ms,
            } => game::handle_timer_tick(self, epoch, remaining_ms),
            RoomCommand::TimerExpired { epoch } => game::handle_timer_expired(self, epoch).await,
        }
    }

    async fn handle_frame(&mut self, connection_id: Uuid, message: ClientMessage) -> Vec<Effect> {
        match message {
            ClientMessage::StartGame => game::handle_start(self, connection_id).await,
            ClientMessage::EndGame => game::handle_end(self, connection_id).await,
            ClientMessage::SubmitSolution {
                challenge_id,
                source_code,
                language,
            } => submission::handle_submit(self, connection_id, challenge_id, source_code, language),
            ClientMessage::ShapePassed {
                challenge_id,
                score,
            } => submission::handle_claim(self, connection_id, challenge_id, score),
            ClientMessage::AdminCommand(action) => {
                admin::handle_action(self, connection_id, action).await
            }
            ClientMessage::RequestRoomDetails => self.handle_room_details(connection_id),
            ClientMessage::RequestAvailableShapes => {
                self.handle_available_shapes(connection_id).await
            }
            ClientMessage::SendMessage { message } => {
                self.handle_chat(connection_id, message, false)
            }
            ClientMessage::SendSystemMessage { message } => {
                self.handle_chat(connection_id, message, true)
            }
        }
    }

    // ------------------------------------------------------------------
    // Join and disconnect
    // ------------------------------------------------------------------

    async fn handle_join(&mut self, request: JoinRequest) -> Vec<Effect> {
        let JoinRequest {
            connection_id,
            stable_id,
            name,
            host,
            sender,
        } = request;
        self.connections.insert(connection_id, sender);

        // Contestants wait outside until a host has opened the room.
        if !host && !self.room.host_seen {
            tracing::info!(room_id = %self.room.id, player_id = %stable_id, "join refused, no host yet");
            return vec![Effect::Drop {
                connection_id,
                farewell: Some(error_message(&SessionError::HostNotPresent)),
            }];
        }
        let first_host = host && !self.room.host_seen;

        let mut effects = Vec::new();
        let reconnected = self.room.find(&stable_id).is_some();
        if reconnected {
            let previous = match self.room.reconnect_player(&stable_id, connection_id) {
                Ok(previous) => previous,
                Err(e) => return vec![session_error(connection_id, &e)],
            };
            // One player, one connection: a socket that was replaced gets closed.
            if previous != connection_id && self.connections.contains_key(&previous) {
                effects.push(Effect::Drop {
                    connection_id: previous,
                    farewell: None,
                });
            }
            if host {
                let _ = self.room.assign_host(&stable_id);
            }
        } else {
            let record = match self.state.store.load_player(&stable_id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(player_id = %stable_id, error = %e, "could not read player record");
                    None
                }
            };

            let role = if host {
                PlayerRole::Host
            } else {
                PlayerRole::Contestant
            };
            let mut player = Player::new(connection_id, stable_id.clone(), name, role);
            if let Some(record) = record {
                player.score = record.score;
                player.passed = record.passed.into_iter().collect();
            }
            if role == PlayerRole::Contestant && self.room.lifecycle == Lifecycle::InProgress {
                player.status = PlayerStatus::Playing;
            }

            if let Err(e) = self.room.add_player(player) {
                tracing::warn!(room_id = %self.room.id, player_id = %stable_id, error = %e, "join rejected");
                return vec![Effect::Drop {
                    connection_id,
                    farewell: Some(error_message(&e)),
                }];
            }
            if host {
                let _ = self.room.assign_host(&stable_id);
            }
        }

        self.persist_player(&stable_id).await;

        let room = self.room.snapshot();
        let Some(player) = self.room.find(&stable_id).map(Player::snapshot) else {
            return vec![session_error(
                connection_id,
                &SessionError::PlayerMissing(stable_id),
            )];
        };
        effects.push(Effect::Unicast {
            connection_id,
            message: ServerMessage::RoomJoined {
                room: room.clone(),
                player_id: stable_id.clone(),
                is_host: host,
                reconnected,
            },
        });
        effects.push(Effect::Broadcast {
            message: ServerMessage::PlayerJoined { player, room },
        });

        if first_host {
            if let Some(welcome) = self.room.settings.welcome_message.clone() {
                effects.push(Effect::Broadcast {
                    message: system_chat(welcome),
                });
            }
        }

        tracing::info!(
            room_id = %self.room.id,
            player_id = %stable_id,
            reconnected,
            host,
            players = self.room.player_count(),
            "player joined"
        );
        effects
    }

    async fn handle_disconnected(&mut self, connection_id: Uuid) -> Vec<Effect> {
        self.connections.remove(&connection_id);

        // A connection that was replaced or kicked no longer maps to a
        // player; nothing to do for it.
        let Some(player) = self.room.player_by_connection(connection_id) else {
            return Vec::new();
        };
        let stable_id = player.stable_id.clone();
        let was_host = player.is_host();

        if let Some(player) = self.room.find_mut(&stable_id) {
            player.status = PlayerStatus::Disconnected;
        }
        self.persist_player(&stable_id).await;
        tracing::info!(room_id = %self.room.id, player_id = %stable_id, host = was_host, "player disconnected");

        let mut effects = vec![Effect::Broadcast {
            message: ServerMessage::PlayerDisconnected {
                player_id: stable_id,
                players: self.room.snapshots(),
            },
        }];

        // Without its host the room cannot continue: finish any running
        // round, then drop everyone.
        if was_host {
            if self.room.lifecycle == Lifecycle::InProgress {
                effects.extend(game::finish_game(self, game::now_ms()).await);
            }
            effects.push(Effect::CloseAll);
        }
        effects
    }

    // ------------------------------------------------------------------
    // Queries and chat
    // ------------------------------------------------------------------

    fn handle_room_details(&self, connection_id: Uuid) -> Vec<Effect> {
        vec![Effect::Unicast {
            connection_id,
            message: ServerMessage::RoomDetails {
                room: self.room.snapshot(),
            },
        }]
    }

    async fn handle_available_shapes(&self, connection_id: Uuid) -> Vec<Effect> {
        if let Err(e) = self.room.require_host(connection_id) {
            return vec![session_error(connection_id, &e)];
        }
        match self.state.store.list_challenges().await {
            Ok(shapes) => vec![Effect::Unicast {
                connection_id,
                message: ServerMessage::AvailableShapes { shapes },
            }],
            Err(e) => {
                tracing::warn!(error = %e, "could not list challenges");
                vec![protocol_error(
                    connection_id,
                    "STORE_ERROR",
                    "could not list challenges",
                )]
            }
        }
    }

    fn handle_chat(&self, connection_id: Uuid, message: String, system: bool) -> Vec<Effect> {
        let Some(player) = self.room.player_by_connection(connection_id) else {
            return vec![unknown_caller(connection_id)];
        };
        if system && !player.is_host() {
            return vec![session_error(connection_id, &SessionError::NotHost)];
        }
        let text = message.trim();
        if text.is_empty() {
            return vec![protocol_error(
                connection_id,
                "EMPTY_MESSAGE",
                "message must not be empty",
            )];
        }

        let message = if system {
            system_chat(text.to_string())
        } else {
            ServerMessage::NewMessage {
                sender: player.name.clone(),
                sender_id: player.stable_id.clone(),
                message: text.to_string(),
                timestamp: game::now_ms(),
                is_host: player.is_host(),
                is_system: false,
            }
        };
        vec![Effect::Broadcast { message }]
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    pub(crate) async fn persist_player(&self, stable_id: &str) {
        let Some(player) = self.room.find(stable_id) else {
            return;
        };
        let mut passed: Vec<String> = player.passed.iter().cloned().collect();
        passed.sort();
        let record = PlayerRecord {
            stable_id: player.stable_id.clone(),
            name: player.name.clone(),
            score: player.score,
            passed,
        };
        if let Err(e) = self.state.store.save_player(&record).await {
            tracing::warn!(player_id = %stable_id, error = %e, "could not persist player record");
        }
    }

    pub(crate) async fn persist_all_players(&self) {
        let ids: Vec<String> = self.room.players().map(|p| p.stable_id.clone()).collect();
        for stable_id in ids {
            self.persist_player(&stable_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Effect application
    // ------------------------------------------------------------------

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Unicast {
                    connection_id,
                    message,
                } => {
                    if let Some(sender) = self.connections.get(&connection_id) {
                        let _ = sender.send(Outbound::Deliver(message));
                    }
                }
                Effect::Broadcast { message } => {
                    for sender in self.connections.values() {
                        let _ = sender.send(Outbound::Deliver(message.clone()));
                    }
                }
                Effect::Drop {
                    connection_id,
                    farewell,
                } => {
                    if let Some(sender) = self.connections.remove(&connection_id) {
                        if let Some(message) = farewell {
                            let _ = sender.send(Outbound::Deliver(message));
                        }
                        let _ = sender.send(Outbound::Close);
                    }
                }
                Effect::CloseAll => {
                    for (_, sender) in self.connections.drain() {
                        let _ = sender.send(Outbound::Close);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Effect constructors shared by the handler modules
// ----------------------------------------------------------------------

pub(crate) fn protocol_error(
    connection_id: Uuid,
    code: &str,
    message: impl Into<String>,
) -> Effect {
    Effect::Unicast {
        connection_id,
        message: ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        },
    }
}

pub(crate) fn session_error(connection_id: Uuid, error: &SessionError) -> Effect {
    protocol_error(connection_id, error.code(), error.to_string())
}

pub(crate) fn unknown_caller(connection_id: Uuid) -> Effect {
    protocol_error(
        connection_id,
        "UNKNOWN_PLAYER",
        "this connection is not part of the room",
    )
}

fn error_message(error: &SessionError) -> ServerMessage {
    ServerMessage::Error {
        code: error.code().to_string(),
        message: error.to_string(),
    }
}

fn system_chat(message: String) -> ServerMessage {
    ServerMessage::NewMessage {
        sender: "System".to_string(),
        sender_id: "system".to_string(),
        message,
        timestamp: game::now_ms(),
        is_host: true,
        is_system: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ExecutorConfig, RoomConfig};
    use crate::protocol::AdminAction;
    use crate::session::room::RoomSettings;
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn have(binary: &str) -> bool {
        std::process::Command::new("which")
            .arg(binary)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn test_settings(round_duration_ms: u64) -> RoomSettings {
        RoomSettings {
            name: "Test Arena".to_string(),
            capacity: 4,
            min_players_to_start: 2,
            round_duration_ms,
            welcome_message: None,
        }
    }

    fn start_room(dir: &TempDir, settings: RoomSettings) -> RoomHandle {
        let config = Config {
            port: 0,
            host: "127.0.0.1".to_string(),
            cors_origins: Vec::new(),
            data_dir: dir.path().to_path_buf(),
            auth_secret: "test-secret".to_string(),
            room: RoomConfig {
                id: "arena".to_string(),
                name: settings.name.clone(),
                capacity: settings.capacity,
                min_players_to_start: settings.min_players_to_start,
                round_duration_ms: settings.round_duration_ms,
                welcome_message: settings.welcome_message.clone(),
            },
            executor: ExecutorConfig {
                python_bin: "python3".to_string(),
                cpp_compiler: "g++".to_string(),
                work_root: dir.path().join("work"),
                timeout_ms: 2_000,
            },
            log_level: "info".to_string(),
        };
        let state = Arc::new(AppState::new(config, Store::new(dir.path())));
        spawn_room(state, Room::new("arena".to_string(), settings))
    }

    struct TestClient {
        connection_id: Uuid,
        rx: UnboundedReceiver<Outbound>,
    }

    impl TestClient {
        async fn recv(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(3), self.rx.recv())
                .await
                .expect("timed out waiting for the room")
                .expect("room dropped the connection")
        }

        /// Skips frames until `pick` yields a value.
        async fn expect<T>(&mut self, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
            for _ in 0..32 {
                match self.recv().await {
                    Outbound::Deliver(message) => {
                        if let Some(value) = pick(message) {
                            return value;
                        }
                    }
                    Outbound::Close => panic!("connection closed while waiting"),
                }
            }
            panic!("expected message never arrived");
        }

        async fn expect_close(&mut self) {
            for _ in 0..32 {
                if let Outbound::Close = self.recv().await {
                    return;
                }
            }
            panic!("connection was never closed");
        }

        fn frame(&self, handle: &RoomHandle, message: ClientMessage) {
            handle.send(RoomCommand::Frame {
                connection_id: self.connection_id,
                message,
            });
        }
    }

    fn join(handle: &RoomHandle, stable_id: &str, host: bool) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        handle.send(RoomCommand::Join(JoinRequest {
            connection_id,
            stable_id: stable_id.to_string(),
            name: stable_id.to_string(),
            host,
            sender: tx,
        }));
        TestClient { connection_id, rx }
    }

    fn room_joined(message: ServerMessage) -> Option<bool> {
        match message {
            ServerMessage::RoomJoined { reconnected, .. } => Some(reconnected),
            _ => None,
        }
    }

    fn error_code(message: ServerMessage) -> Option<String> {
        match message {
            ServerMessage::Error { code, .. } => Some(code),
            _ => None,
        }
    }

    fn game_started(message: ServerMessage) -> Option<u64> {
        match message {
            ServerMessage::GameStarted { end_time, .. } => Some(end_time),
            _ => None,
        }
    }

    #[tokio::test]
    async fn contestants_wait_outside_until_a_host_arrives() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));

        let mut early = join(&handle, "p1", false);
        assert_eq!(early.expect(error_code).await, "HOST_NOT_PRESENT");
        early.expect_close().await;

        let mut host = join(&handle, "host", true);
        assert!(!host.expect(room_joined).await);

        let mut late = join(&handle, "p1", false);
        assert!(!late.expect(room_joined).await);
    }

    #[tokio::test]
    async fn start_needs_the_minimum_player_count() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;

        host.frame(&handle, ClientMessage::StartGame);
        assert_eq!(host.expect(error_code).await, "NOT_ENOUGH_PLAYERS");
    }

    #[tokio::test]
    async fn a_round_runs_from_start_to_host_end() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;

        host.frame(&handle, ClientMessage::StartGame);
        assert!(host.expect(game_started).await > 0);
        // The countdown reports shortly after the start.
        p1.expect(|m| match m {
            ServerMessage::TimeUpdate { time_left_ms } => Some(time_left_ms),
            _ => None,
        })
        .await;

        host.frame(&handle, ClientMessage::EndGame);
        let results = host
            .expect(|m| match m {
                ServerMessage::GameEnded { results, .. } => Some(results),
                _ => None,
            })
            .await;
        assert_eq!(results.len(), 2);
        assert!(dir.path().join("leaderboard.json").exists());
    }

    #[tokio::test]
    async fn a_short_round_expires_on_its_own() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(400));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;

        host.frame(&handle, ClientMessage::StartGame);
        p1.expect(game_started).await;
        p1.expect(|m| match m {
            ServerMessage::GameEnded { .. } => Some(()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn a_challenge_is_credited_only_once() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;
        host.frame(&handle, ClientMessage::StartGame);
        p1.expect(game_started).await;

        for _ in 0..2 {
            handle.send(RoomCommand::ClaimChecked {
                connection_id: p1.connection_id,
                stable_id: "p1".to_string(),
                challenge_id: "7".to_string(),
                difficulty: Some(30),
            });
        }

        let (passed, already) = p1
            .expect(|m| match m {
                ServerMessage::SolutionResult {
                    passed,
                    already_passed,
                    ..
                } => Some((passed, already_passed)),
                _ => None,
            })
            .await;
        assert!(passed);
        assert!(!already);
        let total = p1
            .expect(|m| match m {
                ServerMessage::ScoreUpdated { total_score, .. } => Some(total_score),
                _ => None,
            })
            .await;
        assert_eq!(total, 30);
        // The rival claim lands second and is only acknowledged.
        p1.expect(|m| match m {
            ServerMessage::SolutionResult {
                already_passed: true,
                ..
            } => Some(()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn kicked_player_is_closed_and_forgotten() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;
        assert!(dir.path().join("session").join("p1.json").exists());

        host.frame(
            &handle,
            ClientMessage::AdminCommand(AdminAction::KickPlayer {
                player_id: "p1".to_string(),
                reason: Some("testing".to_string()),
            }),
        );

        let reason = p1
            .expect(|m| match m {
                ServerMessage::Kicked { reason } => Some(reason),
                _ => None,
            })
            .await;
        assert_eq!(reason, "testing");
        p1.expect_close().await;

        let players = host
            .expect(|m| match m {
                ServerMessage::PlayerKicked { players, .. } => Some(players),
                _ => None,
            })
            .await;
        assert_eq!(players.len(), 1);
        assert!(!dir.path().join("session").join("p1.json").exists());
    }

    #[tokio::test]
    async fn admin_commands_from_contestants_are_refused() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;

        p1.frame(&handle, ClientMessage::AdminCommand(AdminAction::ResetScores));
        assert_eq!(p1.expect(error_code).await, "NOT_HOST");
    }

    #[tokio::test]
    async fn host_disconnect_ends_the_game_and_closes_everyone() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;
        host.frame(&handle, ClientMessage::StartGame);
        p1.expect(game_started).await;

        handle.send(RoomCommand::Disconnected {
            connection_id: host.connection_id,
        });
        p1.expect(|m| match m {
            ServerMessage::GameEnded { .. } => Some(()),
            _ => None,
        })
        .await;
        p1.expect_close().await;
    }

    #[tokio::test]
    async fn reconnecting_keeps_score_and_history() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;
        host.frame(&handle, ClientMessage::StartGame);
        p1.expect(game_started).await;

        handle.send(RoomCommand::ClaimChecked {
            connection_id: p1.connection_id,
            stable_id: "p1".to_string(),
            challenge_id: "3".to_string(),
            difficulty: Some(25),
        });
        p1.expect(|m| match m {
            ServerMessage::ScoreUpdated { .. } => Some(()),
            _ => None,
        })
        .await;

        handle.send(RoomCommand::Disconnected {
            connection_id: p1.connection_id,
        });
        let mut back = join(&handle, "p1", false);
        let (room, reconnected) = back
            .expect(|m| match m {
                ServerMessage::RoomJoined {
                    room, reconnected, ..
                } => Some((room, reconnected)),
                _ => None,
            })
            .await;
        assert!(reconnected);
        let me = room
            .players
            .iter()
            .find(|p| p.player_id == "p1")
            .expect("player entry");
        assert_eq!(me.score, 25);
        assert!(me.passed.contains(&"3".to_string()));
    }

    #[tokio::test]
    async fn a_second_login_replaces_the_first_connection() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut first = join(&handle, "p1", false);
        first.expect(room_joined).await;

        let mut second = join(&handle, "p1", false);
        assert!(second.expect(room_joined).await);
        first.expect_close().await;
    }

    #[tokio::test]
    async fn the_first_host_triggers_the_welcome_message() {
        let dir = TempDir::new().unwrap();
        let mut settings = test_settings(60_000);
        settings.welcome_message = Some("Welcome to the arena!".to_string());
        let handle = start_room(&dir, settings);

        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let text = host
            .expect(|m| match m {
                ServerMessage::NewMessage {
                    is_system: true,
                    message,
                    ..
                } => Some(message),
                _ => None,
            })
            .await;
        assert_eq!(text, "Welcome to the arena!");
    }

    #[tokio::test]
    async fn chat_is_broadcast_with_the_sender_identity() {
        let dir = TempDir::new().unwrap();
        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;

        p1.frame(
            &handle,
            ClientMessage::SendMessage {
                message: "  hello  ".to_string(),
            },
        );
        let (sender, message, is_host) = host
            .expect(|m| match m {
                ServerMessage::NewMessage {
                    sender,
                    message,
                    is_host,
                    is_system: false,
                    ..
                } => Some((sender, message, is_host)),
                _ => None,
            })
            .await;
        assert_eq!(sender, "p1");
        assert_eq!(message, "hello");
        assert!(!is_host);
    }

    #[tokio::test]
    async fn a_perfect_python_submission_is_judged_and_credited() {
        if !have("python3") {
            eprintln!("skipping: python3 not installed");
            return;
        }
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("shapes"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("shapes").join("shape1.txt"),
            "2 2 15\n1 2\n3 4\n",
        )
        .await
        .unwrap();

        let handle = start_room(&dir, test_settings(60_000));
        let mut host = join(&handle, "host", true);
        host.expect(room_joined).await;
        let mut p1 = join(&handle, "p1", false);
        p1.expect(room_joined).await;
        host.frame(&handle, ClientMessage::StartGame);
        p1.expect(game_started).await;

        let source = r#"
K = 987654321
for row in [[1, 2], [3, 4]]:
    print(" ".join(str(v ^ K) for v in row))
"#;
        p1.frame(
            &handle,
            ClientMessage::SubmitSolution {
                challenge_id: "1".to_string(),
                source_code: source.to_string(),
                language: crate::executor::Language::Python,
            },
        );

        let (score, passed) = p1
            .expect(|m| match m {
                ServerMessage::SolutionResult { score, passed, .. } => Some((score, passed)),
                _ => None,
            })
            .await;
        assert_eq!(score, Some(100.0));
        assert!(passed);
        let total = p1
            .expect(|m| match m {
                ServerMessage::ScoreUpdated { total_score, .. } => Some(total_score),
                _ => None,
            })
            .await;
        assert_eq!(total, 15);
    }
}
