use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::{events, Broadcaster, UserId};
use crate::flow::TimerFired;
use crate::room::{self, GameRoom, RoomCore, User};

/// A room is deleted after staying empty through this many
/// consecutive reaper sweeps.
const FAILED_CHECKS_TO_DELETE: u32 = 3;

const MIN_NICKNAME_LEN: usize = 3;
const MAX_NICKNAME_LEN: usize = 30;
const MIN_TITLE_LEN: usize = 3;
const MAX_TITLE_LEN: usize = 30;

struct Connection {
    user: User,
    room_id: Option<String>,
}

/// All live rooms of one game plus every connected participant. Owned
/// by a single service task; every mutation goes through
/// [`Registry::dispatch`], so commands and timer fires can never
/// interleave inside a room.
pub struct Registry<R: GameRoom> {
    name: &'static str,
    rooms: Vec<R>,
    connections: Vec<Connection>,
    broadcaster: Arc<dyn Broadcaster>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
}

impl<R: GameRoom> Registry<R> {
    pub fn new(
        name: &'static str,
        broadcaster: Arc<dyn Broadcaster>,
        timer_tx: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        Registry {
            name,
            rooms: Vec::new(),
            connections: Vec::new(),
            broadcaster,
            timer_tx,
        }
    }

    pub fn add_user(&mut self, user_id: UserId) {
        if self.connections.iter().any(|c| c.user.id == user_id) {
            return;
        }
        let prefix: String = user_id.0.chars().take(6).collect();
        let nickname = format!("User {prefix}");
        self.broadcaster.to_user(
            &user_id,
            events::GET_NICKNAME,
            json!({ "nickname": nickname, "force": false }),
        );
        debug!(game = self.name, user = %user_id, "connected");
        self.connections.push(Connection {
            user: User {
                id: user_id,
                nickname,
            },
            room_id: None,
        });
    }

    pub fn remove_user(&mut self, user_id: &UserId) {
        self.leave_room(user_id);
        self.connections.retain(|c| &c.user.id != user_id);
        debug!(game = self.name, user = %user_id, "disconnected");
    }

    pub fn create_room(&mut self) -> String {
        let core = RoomCore::new(
            self.broadcaster.clone(),
            self.timer_tx.clone(),
            StdRng::from_entropy(),
        );
        let room = R::open(core);
        let id = room.core().id().to_string();
        info!(game = self.name, room = %id, "room created");
        self.rooms.push(room);
        id
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.iter().any(|r| r.core().id() == room_id)
    }

    pub fn join_room(&mut self, user_id: &UserId, room_id: &str) -> bool {
        let Registry {
            rooms, connections, ..
        } = self;
        let Some(conn) = connections.iter_mut().find(|c| &c.user.id == user_id) else {
            return false;
        };
        if conn.room_id.is_some() {
            debug!(game = self.name, user = %user_id, "join rejected: already in a room");
            return false;
        }
        let Some(room) = rooms.iter_mut().find(|r| r.core().id() == room_id) else {
            return false;
        };
        let mut user = conn.user.clone();
        room::join(room, &mut user);
        // Joining may have deduplicated the nickname.
        conn.user.nickname = user.nickname;
        conn.room_id = Some(room_id.to_string());
        true
    }

    pub fn leave_room(&mut self, user_id: &UserId) {
        let Registry {
            rooms, connections, ..
        } = self;
        let Some(conn) = connections.iter_mut().find(|c| &c.user.id == user_id) else {
            return;
        };
        let Some(room_id) = conn.room_id.take() else {
            return;
        };
        if let Some(room) = rooms.iter_mut().find(|r| r.core().id() == room_id) {
            room::kick(room, user_id);
        }
    }

    pub fn set_role(&mut self, user_id: &UserId, is_player: bool) {
        if let Some(room) = self.room_of_user_mut(user_id) {
            room::set_role(room, user_id, is_player);
        }
    }

    /// Returns the accepted nickname, or empty when the change was
    /// rejected (too short, unchanged, or the room is mid-match).
    pub fn change_nickname(&mut self, user_id: &UserId, nickname: &str) -> String {
        let nickname = nickname.trim();
        if nickname.chars().count() < MIN_NICKNAME_LEN {
            return String::new();
        }
        let nickname: String = nickname.chars().take(MAX_NICKNAME_LEN).collect();
        let Registry {
            rooms,
            connections,
            broadcaster,
            ..
        } = self;
        let Some(conn) = connections.iter_mut().find(|c| &c.user.id == user_id) else {
            return String::new();
        };
        if conn.user.nickname == nickname {
            return String::new();
        }
        if let Some(room_id) = conn.room_id.as_deref() {
            if let Some(room) = rooms.iter_mut().find(|r| r.core().id() == room_id) {
                let mut user = conn.user.clone();
                let accepted = room::change_nickname(room, &mut user, nickname);
                if !accepted.is_empty() {
                    conn.user.nickname = accepted.clone();
                }
                return accepted;
            }
        }
        conn.user.nickname = nickname.clone();
        broadcaster.to_user(
            user_id,
            events::GET_NICKNAME,
            json!({ "nickname": nickname, "force": false }),
        );
        nickname
    }

    pub fn rename_room(&mut self, user_id: &UserId, owner_key: &str, title: &str) -> bool {
        let title = title.trim();
        if title.chars().count() < MIN_TITLE_LEN {
            return false;
        }
        let title: String = title.chars().take(MAX_TITLE_LEN).collect();
        let Some(room) = self.room_of_user_mut(user_id) else {
            return false;
        };
        room::rename(room, owner_key, title)
    }

    pub fn set_options(&mut self, user_id: &UserId, owner_key: &str, update: R::Options) -> bool {
        let Some(room) = self.room_of_user_mut(user_id) else {
            return false;
        };
        room::set_options(room, owner_key, update)
    }

    /// Reaper pass over every room: empty rooms accumulate strikes,
    /// an occupied room clears them, three strikes delete the room.
    pub fn sweep(&mut self) {
        let mut index = 0;
        while index < self.rooms.len() {
            let core = self.rooms[index].core_mut();
            if core.check_activity() {
                core.reset_failed_checks();
                index += 1;
                continue;
            }
            if core.increase_failed_checks() >= FAILED_CHECKS_TO_DELETE {
                let mut room = self.rooms.remove(index);
                info!(game = self.name, room = %room.core().id(), "room reaped");
                room.delete();
            } else {
                index += 1;
            }
        }
        debug!(game = self.name, rooms = self.rooms.len(), "sweep finished");
    }

    pub fn handle_timer(&mut self, fired: TimerFired) {
        let Some(room) = self
            .rooms
            .iter_mut()
            .find(|r| r.core().id() == fired.room_id)
        else {
            debug!(game = self.name, room = %fired.room_id, "timer for a vanished room");
            return;
        };
        room.on_timer_fired(fired.epoch);
    }

    fn room_of_user_mut(&mut self, user_id: &UserId) -> Option<&mut R> {
        let room_id = self
            .connections
            .iter()
            .find(|c| &c.user.id == user_id)?
            .room_id
            .clone()?;
        self.rooms.iter_mut().find(|r| r.core().id() == room_id)
    }

    pub fn dispatch(&mut self, command: Command<R>) {
        match command {
            Command::AddUser { user_id } => self.add_user(user_id),
            Command::RemoveUser { user_id } => self.remove_user(&user_id),
            Command::CreateRoom { reply } => {
                let _ = reply.send(self.create_room());
            }
            Command::CheckRoom { room_id, reply } => {
                let _ = reply.send(self.room_exists(&room_id));
            }
            Command::JoinRoom {
                user_id,
                room_id,
                reply,
            } => {
                let _ = reply.send(self.join_room(&user_id, &room_id));
            }
            Command::LeaveRoom { user_id } => self.leave_room(&user_id),
            Command::SetRole { user_id, is_player } => self.set_role(&user_id, is_player),
            Command::ChangeNickname {
                user_id,
                nickname,
                reply,
            } => {
                let _ = reply.send(self.change_nickname(&user_id, &nickname));
            }
            Command::RenameRoom {
                user_id,
                owner_key,
                title,
                reply,
            } => {
                let _ = reply.send(self.rename_room(&user_id, &owner_key, &title));
            }
            Command::SetOptions {
                user_id,
                owner_key,
                update,
                reply,
            } => {
                let _ = reply.send(self.set_options(&user_id, &owner_key, update));
            }
            Command::Start { user_id, owner_key } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room.start(&owner_key);
                }
            }
            Command::Stop { user_id, owner_key } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room.stop(&owner_key);
                }
            }
            Command::Pause { user_id, owner_key } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room.pause(&owner_key);
                }
            }
            Command::Resume { user_id, owner_key } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room.resume(&owner_key);
                }
            }
            Command::RequestTimer { user_id } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room::request_timer(room, &user_id);
                }
            }
            Command::RequestOptions { user_id } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room::request_options(room, &user_id);
                }
            }
            Command::Game { user_id, action } => {
                if let Some(room) = self.room_of_user_mut(&user_id) {
                    room.handle_action(&user_id, action);
                }
            }
            Command::Sweep => self.sweep(),
        }
    }
}

/// Everything the outside world may ask a game service to do.
pub enum Command<R: GameRoom> {
    AddUser {
        user_id: UserId,
    },
    RemoveUser {
        user_id: UserId,
    },
    CreateRoom {
        reply: oneshot::Sender<String>,
    },
    CheckRoom {
        room_id: String,
        reply: oneshot::Sender<bool>,
    },
    JoinRoom {
        user_id: UserId,
        room_id: String,
        reply: oneshot::Sender<bool>,
    },
    LeaveRoom {
        user_id: UserId,
    },
    SetRole {
        user_id: UserId,
        is_player: bool,
    },
    ChangeNickname {
        user_id: UserId,
        nickname: String,
        reply: oneshot::Sender<String>,
    },
    RenameRoom {
        user_id: UserId,
        owner_key: String,
        title: String,
        reply: oneshot::Sender<bool>,
    },
    SetOptions {
        user_id: UserId,
        owner_key: String,
        update: R::Options,
        reply: oneshot::Sender<bool>,
    },
    Start {
        user_id: UserId,
        owner_key: String,
    },
    Stop {
        user_id: UserId,
        owner_key: String,
    },
    Pause {
        user_id: UserId,
        owner_key: String,
    },
    Resume {
        user_id: UserId,
        owner_key: String,
    },
    RequestTimer {
        user_id: UserId,
    },
    RequestOptions {
        user_id: UserId,
    },
    Game {
        user_id: UserId,
        action: R::Action,
    },
    Sweep,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("game service is no longer running")]
    Closed,
    #[error("game service dropped the reply")]
    NoReply,
}

/// Cheap cloneable handle to one game service task.
pub struct Service<R: GameRoom> {
    tx: mpsc::UnboundedSender<Command<R>>,
}

impl<R: GameRoom> Clone for Service<R> {
    fn clone(&self) -> Self {
        Service {
            tx: self.tx.clone(),
        }
    }
}

impl<R: GameRoom> Service<R> {
    fn send(&self, command: Command<R>) -> Result<(), ServiceError> {
        self.tx.send(command).map_err(|_| ServiceError::Closed)
    }

    async fn ask<T>(
        &self,
        command: Command<R>,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ServiceError> {
        self.send(command)?;
        rx.await.map_err(|_| ServiceError::NoReply)
    }

    pub fn add_user(&self, user_id: UserId) -> Result<(), ServiceError> {
        self.send(Command::AddUser { user_id })
    }

    pub fn remove_user(&self, user_id: UserId) -> Result<(), ServiceError> {
        self.send(Command::RemoveUser { user_id })
    }

    pub async fn create_room(&self) -> Result<String, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(Command::CreateRoom { reply }, rx).await
    }

    pub async fn check_room(&self, room_id: &str) -> Result<bool, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::CheckRoom {
                room_id: room_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn join_room(&self, user_id: UserId, room_id: &str) -> Result<bool, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::JoinRoom {
                user_id,
                room_id: room_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub fn leave_room(&self, user_id: UserId) -> Result<(), ServiceError> {
        self.send(Command::LeaveRoom { user_id })
    }

    pub fn set_role(&self, user_id: UserId, is_player: bool) -> Result<(), ServiceError> {
        self.send(Command::SetRole { user_id, is_player })
    }

    pub async fn change_nickname(
        &self,
        user_id: UserId,
        nickname: &str,
    ) -> Result<String, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::ChangeNickname {
                user_id,
                nickname: nickname.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn rename_room(
        &self,
        user_id: UserId,
        owner_key: &str,
        title: &str,
    ) -> Result<bool, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::RenameRoom {
                user_id,
                owner_key: owner_key.to_string(),
                title: title.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn set_options(
        &self,
        user_id: UserId,
        owner_key: &str,
        update: R::Options,
    ) -> Result<bool, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::SetOptions {
                user_id,
                owner_key: owner_key.to_string(),
                update,
                reply,
            },
            rx,
        )
        .await
    }

    pub fn start(&self, user_id: UserId, owner_key: &str) -> Result<(), ServiceError> {
        self.send(Command::Start {
            user_id,
            owner_key: owner_key.to_string(),
        })
    }

    pub fn stop(&self, user_id: UserId, owner_key: &str) -> Result<(), ServiceError> {
        self.send(Command::Stop {
            user_id,
            owner_key: owner_key.to_string(),
        })
    }

    pub fn pause(&self, user_id: UserId, owner_key: &str) -> Result<(), ServiceError> {
        self.send(Command::Pause {
            user_id,
            owner_key: owner_key.to_string(),
        })
    }

    pub fn resume(&self, user_id: UserId, owner_key: &str) -> Result<(), ServiceError> {
        self.send(Command::Resume {
            user_id,
            owner_key: owner_key.to_string(),
        })
    }

    pub fn request_timer(&self, user_id: UserId) -> Result<(), ServiceError> {
        self.send(Command::RequestTimer { user_id })
    }

    pub fn request_options(&self, user_id: UserId) -> Result<(), ServiceError> {
        self.send(Command::RequestOptions { user_id })
    }

    pub fn game_action(&self, user_id: UserId, action: R::Action) -> Result<(), ServiceError> {
        self.send(Command::Game { user_id, action })
    }

    pub fn sweep(&self) -> Result<(), ServiceError> {
        self.send(Command::Sweep)
    }
}

/// The service loop: sole owner of the registry. Commands and timer
/// fires are drained one at a time, which is all the mutual exclusion
/// the rooms need.
pub async fn run<R: GameRoom>(
    mut registry: Registry<R>,
    mut rx: mpsc::UnboundedReceiver<Command<R>>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    cancel: CancellationToken,
) {
    info!(game = registry.name, "game service started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(command) = rx.recv() => registry.dispatch(command),
            Some(fired) = timer_rx.recv() => registry.handle_timer(fired),
            else => break,
        }
    }
    info!(game = registry.name, "game service stopped");
}

/// Periodically posts a sweep command into the service loop. The
/// first (immediate) interval tick is swallowed so a fresh server
/// does not sweep at once.
pub async fn run_reaper<R: GameRoom>(
    service: Service<R>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if service.sweep().is_err() {
                    break;
                }
            }
        }
    }
}

/// Wire up and spawn one game service with its reaper.
pub fn spawn<R: GameRoom>(
    name: &'static str,
    broadcaster: Arc<dyn Broadcaster>,
    reaper_period: Duration,
    cancel: CancellationToken,
) -> (Service<R>, JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let registry = Registry::new(name, broadcaster, timer_tx);
    let service = Service { tx };
    let loop_task = tokio::spawn(run(registry, rx, timer_rx, cancel.clone()));
    let reaper_task = tokio::spawn(run_reaper(service.clone(), reaper_period, cancel));
    (service, loop_task, reaper_task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ChannelBroadcaster, OutboundMessage};
    use crate::spy::SpyRoom;

    fn registry() -> (
        Registry<SpyRoom>,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<TimerFired>,
    ) {
        let (broadcaster, rx) = ChannelBroadcaster::channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        (
            Registry::new("spy", Arc::new(broadcaster), timer_tx),
            rx,
            timer_rx,
        )
    }

    #[test]
    fn users_get_a_default_nickname_from_their_id() {
        let (mut reg, mut rx, _timers) = registry();
        reg.add_user(UserId::from("abcdef123456"));
        assert_eq!(reg.connections[0].user.nickname, "User abcdef");
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.event, events::GET_NICKNAME);
        assert_eq!(msg.payload["force"], json!(false));

        // Reconnecting the same id is a no-op.
        reg.add_user(UserId::from("abcdef123456"));
        assert_eq!(reg.connections.len(), 1);
    }

    #[test]
    fn a_user_can_only_be_in_one_room_at_a_time() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));
        let first = reg.create_room();
        let second = reg.create_room();
        assert!(reg.room_exists(&first));

        assert!(reg.join_room(&UserId::from("ann"), &first));
        assert!(!reg.join_room(&UserId::from("ann"), &second));
        assert!(!reg.join_room(&UserId::from("ghost"), &first));
        assert!(!reg.join_room(&UserId::from("ann"), "NOSUCHROOM42"));

        reg.leave_room(&UserId::from("ann"));
        assert!(reg.join_room(&UserId::from("ann"), &second));
    }

    #[test]
    fn nickname_policy_rejects_short_and_unchanged_names() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));

        assert_eq!(reg.change_nickname(&UserId::from("ann"), "ab"), "");
        assert_eq!(reg.change_nickname(&UserId::from("ann"), "  a  "), "");

        let accepted = reg.change_nickname(&UserId::from("ann"), "Annabel");
        assert_eq!(accepted, "Annabel");
        assert_eq!(reg.change_nickname(&UserId::from("ann"), "Annabel"), "");

        let long = "x".repeat(40);
        let accepted = reg.change_nickname(&UserId::from("ann"), &long);
        assert_eq!(accepted.chars().count(), 30);
    }

    #[test]
    fn nickname_changes_inside_a_room_go_through_the_room() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));
        reg.add_user(UserId::from("bob"));
        let room_id = reg.create_room();
        assert!(reg.join_room(&UserId::from("ann"), &room_id));
        assert!(reg.join_room(&UserId::from("bob"), &room_id));
        reg.change_nickname(&UserId::from("ann"), "Spymaster");

        // Collides with ann's new name, so the room dedupes it.
        let accepted = reg.change_nickname(&UserId::from("bob"), "Spymaster");
        assert_eq!(accepted, "Spymaster)");
        assert_eq!(reg.connections[1].user.nickname, "Spymaster)");
    }

    #[test]
    fn empty_rooms_are_reaped_after_three_sweeps() {
        let (mut reg, _rx, _timers) = registry();
        let room_id = reg.create_room();

        reg.sweep();
        reg.sweep();
        assert!(reg.room_exists(&room_id));
        reg.sweep();
        assert!(!reg.room_exists(&room_id));
    }

    #[test]
    fn an_occupied_room_resets_its_strike_counter() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));
        let room_id = reg.create_room();

        reg.sweep();
        reg.sweep();
        assert!(reg.join_room(&UserId::from("ann"), &room_id));
        reg.sweep();
        reg.leave_room(&UserId::from("ann"));

        // The earlier strikes are gone; the full count starts over.
        reg.sweep();
        reg.sweep();
        assert!(reg.room_exists(&room_id));
        reg.sweep();
        assert!(!reg.room_exists(&room_id));
    }

    #[test]
    fn removing_a_user_kicks_them_from_their_room() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));
        reg.add_user(UserId::from("bob"));
        let room_id = reg.create_room();
        assert!(reg.join_room(&UserId::from("ann"), &room_id));
        assert!(reg.join_room(&UserId::from("bob"), &room_id));

        reg.remove_user(&UserId::from("ann"));
        assert_eq!(reg.connections.len(), 1);
        let room = reg.rooms.iter().find(|r| r.core().id() == room_id).unwrap();
        assert_eq!(room.core().members.len(), 1);
        assert_eq!(room.core().owner, Some(UserId::from("bob")));
    }

    #[test]
    fn a_timer_for_a_vanished_room_is_discarded() {
        let (mut reg, _rx, _timers) = registry();
        reg.handle_timer(TimerFired {
            room_id: "GONE".into(),
            epoch: 1,
        });
    }

    #[test]
    fn room_titles_are_validated_before_reaching_the_room() {
        let (mut reg, _rx, _timers) = registry();
        reg.add_user(UserId::from("ann"));
        let room_id = reg.create_room();
        assert!(reg.join_room(&UserId::from("ann"), &room_id));
        let key = reg.rooms[0].core().owner_key.clone().unwrap();

        assert!(!reg.rename_room(&UserId::from("ann"), &key, "ab"));
        assert!(reg.rename_room(&UserId::from("ann"), &key, "Spy den"));
        assert_eq!(reg.rooms[0].core().title(), "Spy den");
    }
}
