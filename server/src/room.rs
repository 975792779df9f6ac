use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broadcast::{events, Broadcaster, UserId};
use crate::flow::{Flow, TimerFired};

/// Appended to a nickname until it no longer collides with another
/// member of the same room.
const NICKNAME_MARKER: char = ')';

const ROOM_ID_LEN: usize = 12;
const OWNER_KEY_LEN: usize = 5;

// Excludes easily confused characters.
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub(crate) fn random_code(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// A connected participant. The registry owns these; rooms and seats
/// hold copies that are kept in sync through the room's own methods.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
}

/// A participant currently inside a room, either as an active player
/// or a spectator.
#[derive(Debug, Clone)]
pub struct Member {
    pub user: User,
    pub is_player: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberInfo<'a> {
    is_player: bool,
    nickname: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Idle,
    Run,
    Pause,
}

/// One human-readable match event, newest first in the log list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: u32,
    pub text: String,
    pub at: DateTime<Utc>,
}

pub fn push_log(logs: &mut Vec<LogRecord>, text: String) -> LogRecord {
    let record = LogRecord {
        id: logs.len() as u32 + 1,
        text,
        at: Utc::now(),
    };
    logs.insert(0, record.clone());
    record
}

/// The game-agnostic half of a room: identity, membership, ownership,
/// run status, countdown and the broadcast handle. Concrete game
/// rooms embed one and layer their match state on top.
pub struct RoomCore {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) owner: Option<UserId>,
    pub(crate) owner_key: Option<String>,
    pub(crate) members: Vec<Member>,
    pub(crate) running: bool,
    pub(crate) failed_checks: u32,
    pub(crate) flow: Flow,
    pub(crate) rng: StdRng,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
}

impl RoomCore {
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        timer_tx: mpsc::UnboundedSender<TimerFired>,
        mut rng: StdRng,
    ) -> Self {
        let id = random_code(&mut rng, ROOM_ID_LEN);
        RoomCore {
            title: format!("Room {id}"),
            flow: Flow::new(id.clone(), timer_tx),
            id,
            owner: None,
            owner_key: None,
            members: Vec::new(),
            running: false,
            failed_checks: 0,
            rng,
            broadcaster,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Paused is a sub-state of running: the match is on but the
    /// countdown is frozen.
    pub fn is_on_pause(&self) -> bool {
        self.running && !self.flow.is_armed()
    }

    pub fn status(&self) -> RoomStatus {
        if !self.running {
            RoomStatus::Idle
        } else if self.is_on_pause() {
            RoomStatus::Pause
        } else {
            RoomStatus::Run
        }
    }

    /// Check the presented credential against the current owner key.
    pub fn authorize(&self, owner_key: &str) -> bool {
        let ok = self
            .owner_key
            .as_deref()
            .is_some_and(|key| key == owner_key);
        if !ok {
            debug!(room = %self.id, "rejected action: wrong owner key");
        }
        ok
    }

    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.user.id == user_id)
    }

    pub fn member_mut(&mut self, user_id: &UserId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.user.id == user_id)
    }

    pub fn players_among_members(&self) -> Vec<User> {
        self.members
            .iter()
            .filter(|m| m.is_player)
            .map(|m| m.user.clone())
            .collect()
    }

    /// Reaper probe: an empty running room gets its countdown frozen
    /// so the turn timeout cannot fire into a deserted match.
    pub fn check_activity(&mut self) -> bool {
        if self.members.is_empty() {
            if self.running {
                self.flow.pause();
            }
            return false;
        }
        true
    }

    pub fn increase_failed_checks(&mut self) -> u32 {
        self.failed_checks += 1;
        self.failed_checks
    }

    pub fn reset_failed_checks(&mut self) {
        self.failed_checks = 0;
    }

    // --- outbound ---

    pub(crate) fn to_room(&self, event: &str, payload: Value) {
        self.broadcaster.to_room(&self.id, event, payload);
    }

    pub(crate) fn to_user(&self, user_id: &UserId, event: &str, payload: Value) {
        self.broadcaster.to_user(user_id, event, payload);
    }

    fn members_payload(&self) -> Value {
        let infos: Vec<MemberInfo<'_>> = self
            .members
            .iter()
            .map(|m| MemberInfo {
                is_player: m.is_player,
                nickname: &m.user.nickname,
            })
            .collect();
        json!(infos)
    }

    pub(crate) fn send_members_to_all(&self) {
        self.to_room(events::GET_MEMBERS, self.members_payload());
    }

    pub(crate) fn send_nickname_to_user(&self, user_id: &UserId, nickname: &str, force: bool) {
        self.to_user(
            user_id,
            events::GET_NICKNAME,
            json!({ "nickname": nickname, "force": force }),
        );
    }

    pub(crate) fn send_owner_key_to_owner(&self) {
        if let (Some(owner), Some(key)) = (&self.owner, &self.owner_key) {
            self.to_user(owner, events::GET_OWNER_KEY, json!(key));
        }
    }

    pub(crate) fn send_restrictions_to_owner(&self, restrictions: &[String]) {
        if let Some(owner) = &self.owner {
            self.to_user(owner, events::GET_RESTRICTIONS_TO_START, json!(restrictions));
        }
    }

    pub(crate) fn send_status_to_all(&self) {
        self.to_room(events::GET_ROOM_STATUS, json!(self.status()));
    }

    pub(crate) fn send_status_to_user(&self, user_id: &UserId) {
        self.to_user(user_id, events::GET_ROOM_STATUS, json!(self.status()));
    }

    pub(crate) fn send_pause_flag_to_all(&self) {
        self.to_room(events::GET_PAUSE_FLAG, json!(self.is_on_pause()));
    }

    pub(crate) fn send_pause_flag_to_user(&self, user_id: &UserId) {
        self.to_user(user_id, events::GET_PAUSE_FLAG, json!(self.is_on_pause()));
    }

    pub(crate) fn send_timer_to_all(&self) {
        if let Some(snapshot) = self.flow.snapshot() {
            self.to_room(events::GET_TIMER, json!(snapshot));
        }
    }

    pub(crate) fn send_timer_to_user(&self, user_id: &UserId) {
        if let Some(snapshot) = self.flow.snapshot() {
            self.to_user(user_id, events::GET_TIMER, json!(snapshot));
        }
    }

    pub(crate) fn send_title_to_all(&self) {
        self.to_room(events::GET_ROOM_TITLE, json!(self.title));
    }

    pub(crate) fn send_title_to_user(&self, user_id: &UserId) {
        self.to_user(user_id, events::GET_ROOM_TITLE, json!(self.title));
    }

    pub(crate) fn send_act_flag_to_all(&self, flag: bool) {
        self.to_room(events::GET_ACT_FLAG, json!(flag));
    }

    pub(crate) fn send_act_flag_to_user(&self, user_id: &UserId, flag: bool) {
        self.to_user(user_id, events::GET_ACT_FLAG, json!(flag));
    }

    pub(crate) fn send_log_record_to_all(&self, record: &LogRecord) {
        self.to_room(events::GET_LOG_RECORD, json!(record));
    }

    pub(crate) fn send_logs_to_all(&self, logs: &[LogRecord]) {
        self.to_room(events::GET_ALL_LOG_RECORDS, json!(logs));
    }

    pub(crate) fn send_logs_to_user(&self, user_id: &UserId, logs: &[LogRecord]) {
        self.to_user(user_id, events::GET_ALL_LOG_RECORDS, json!(logs));
    }
}

/// Capability seam between the registry/service loop and a concrete
/// game room. Shared membership behavior lives in the free functions
/// below; games contribute their turn payload, options and action set
/// through composition around a [`RoomCore`].
pub trait GameRoom: Send + Sized + 'static {
    type Action: Send + std::fmt::Debug + 'static;
    type Options: Send + std::fmt::Debug + 'static;

    fn open(core: RoomCore) -> Self;
    fn core(&self) -> &RoomCore;
    fn core_mut(&mut self) -> &mut RoomCore;

    /// Reasons the owner cannot start a match right now; empty means
    /// start is allowed.
    fn restrictions_to_start(&self) -> Vec<String>;

    fn options_payload(&self) -> Value;
    fn apply_options(&mut self, update: Self::Options);

    fn start(&mut self, owner_key: &str);
    fn stop(&mut self, owner_key: &str);

    fn pause(&mut self, owner_key: &str) {
        let core = self.core_mut();
        if !core.is_running() || core.is_on_pause() {
            return;
        }
        if !core.authorize(owner_key) {
            return;
        }
        core.flow.pause();
        core.send_status_to_all();
        core.send_pause_flag_to_all();
    }

    fn resume(&mut self, owner_key: &str) {
        let core = self.core_mut();
        if !core.is_on_pause() {
            return;
        }
        if !core.authorize(owner_key) {
            return;
        }
        core.flow.resume();
        core.send_status_to_all();
        core.send_pause_flag_to_all();
    }

    /// Push the full current state to a fresh member and rebind a
    /// reconnecting player to their seat.
    fn on_join(&mut self, user_id: &UserId);

    fn handle_action(&mut self, user_id: &UserId, action: Self::Action);

    /// The armed countdown expired. `epoch` must be validated against
    /// the room's flow before acting.
    fn on_timer_fired(&mut self, epoch: u64);

    /// Eviction hook: a room must stop its countdown here, there is
    /// no implicit cancellation on drop.
    fn delete(&mut self) {
        let core = self.core_mut();
        core.running = false;
        core.flow.stop();
    }
}

/// Add a participant to the room as a spectator, renaming them until
/// the nickname is unique. The first member becomes owner and
/// receives a fresh owner key plus the current start restrictions.
pub fn join<R: GameRoom>(room: &mut R, user: &mut User) -> bool {
    {
        let core = room.core_mut();
        debug!(room = %core.id, user = %user.id, "join requested");
        let mut renamed = false;
        while core.members.iter().any(|m| m.user.nickname == user.nickname) {
            user.nickname.push(NICKNAME_MARKER);
            renamed = true;
        }
        if renamed {
            core.send_nickname_to_user(&user.id, &user.nickname, true);
            debug!(room = %core.id, user = %user.id, nickname = %user.nickname, "renamed on join");
        }
        core.members.push(Member {
            user: user.clone(),
            is_player: false,
        });
    }
    room.on_join(&user.id);
    let restrictions = room.restrictions_to_start();
    let core = room.core_mut();
    core.send_members_to_all();
    if core.owner.is_none() {
        core.owner = Some(user.id.clone());
        core.owner_key = Some(random_code(&mut core.rng, OWNER_KEY_LEN));
        core.send_owner_key_to_owner();
        core.send_restrictions_to_owner(&restrictions);
        info!(room = %core.id, user = %user.id, "became room owner");
    }
    info!(room = %core.id, user = %user.id, "joined");
    true
}

/// Remove a member. An emptied room loses owner and key; a kicked
/// owner is replaced by a uniformly random remaining member with a
/// fresh key.
pub fn kick<R: GameRoom>(room: &mut R, user_id: &UserId) {
    {
        let core = room.core_mut();
        let len_before = core.members.len();
        core.members.retain(|m| &m.user.id != user_id);
        if core.members.len() == len_before {
            return;
        }
    }
    let restrictions = room.restrictions_to_start();
    let core = room.core_mut();
    if core.members.is_empty() {
        core.owner = None;
        core.owner_key = None;
    } else if core.owner.as_ref() == Some(user_id) {
        let index = core.rng.gen_range(0..core.members.len());
        let new_owner = core.members[index].user.id.clone();
        info!(room = %core.id, owner = %new_owner, "ownership transferred");
        core.owner = Some(new_owner);
        core.owner_key = Some(random_code(&mut core.rng, OWNER_KEY_LEN));
        core.send_owner_key_to_owner();
        core.send_restrictions_to_owner(&restrictions);
    } else {
        core.send_restrictions_to_owner(&restrictions);
    }
    core.send_members_to_all();
    info!(room = %core.id, user = %user_id, "left");
}

/// Flip a member between player and spectator. Rejected while a match
/// is running.
pub fn set_role<R: GameRoom>(room: &mut R, user_id: &UserId, is_player: bool) -> bool {
    if room.core().is_running() {
        debug!(room = %room.core().id, user = %user_id, "role change rejected: running");
        return false;
    }
    {
        let core = room.core_mut();
        let Some(member) = core.member_mut(user_id) else {
            debug!(room = %core.id, user = %user_id, "role change rejected: not a member");
            return false;
        };
        member.is_player = is_player;
    }
    let restrictions = room.restrictions_to_start();
    let core = room.core();
    core.send_members_to_all();
    core.send_restrictions_to_owner(&restrictions);
    true
}

/// Rename a member, re-resolving collisions the same way as join.
/// Returns the accepted nickname, or empty while running.
pub fn change_nickname<R: GameRoom>(room: &mut R, user: &mut User, mut nickname: String) -> String {
    let core = room.core_mut();
    if core.is_running() {
        debug!(room = %core.id, user = %user.id, "nickname change rejected: running");
        return String::new();
    }
    while core.members.iter().any(|m| m.user.nickname == nickname) {
        nickname.push(NICKNAME_MARKER);
    }
    if let Some(member) = core.member_mut(&user.id) {
        member.user.nickname = nickname.clone();
    }
    user.nickname = nickname.clone();
    core.send_members_to_all();
    nickname
}

/// Retitle the room; owner only, idle only.
pub fn rename<R: GameRoom>(room: &mut R, owner_key: &str, title: String) -> bool {
    let core = room.core_mut();
    if core.is_running() || !core.authorize(owner_key) {
        return false;
    }
    core.title = title;
    core.send_title_to_all();
    true
}

/// Replace the room options; owner only, idle only. Values are
/// validated and defaulted by the game's own option rules.
pub fn set_options<R: GameRoom>(room: &mut R, owner_key: &str, update: R::Options) -> bool {
    if room.core().is_running() || !room.core().authorize(owner_key) {
        return false;
    }
    room.apply_options(update);
    let payload = room.options_payload();
    let restrictions = room.restrictions_to_start();
    let core = room.core();
    core.to_room(events::GET_ROOM_OPTIONS, payload);
    core.send_restrictions_to_owner(&restrictions);
    true
}

/// Push the countdown snapshot to the caller only.
pub fn request_timer<R: GameRoom>(room: &R, user_id: &UserId) {
    let core = room.core();
    if !core.is_running() {
        return;
    }
    core.send_timer_to_user(user_id);
}

/// Push the current options to the caller only.
pub fn request_options<R: GameRoom>(room: &R, user_id: &UserId) {
    room.core()
        .to_user(user_id, events::GET_ROOM_OPTIONS, room.options_payload());
}
