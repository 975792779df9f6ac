use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::broadcast::{events, UserId};
use crate::room::{push_log, GameRoom, LogRecord, RoomCore};
use crate::turn::{Seat, TurnQueue};

const MAX_QUESTION_LEN: usize = 120;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOptions {
    pub min_players: u8,
    pub max_players: u8,
    pub seconds_to_ask: u64,
    pub seconds_to_answer: u64,
}

impl Default for QuizOptions {
    fn default() -> Self {
        QuizOptions {
            min_players: 2,
            max_players: 16,
            seconds_to_ask: 60,
            seconds_to_answer: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizOptionsUpdate {
    pub min_players: Option<u8>,
    pub max_players: Option<u8>,
    pub seconds_to_ask: Option<u64>,
    pub seconds_to_answer: Option<u64>,
}

fn pick<T: PartialOrd>(value: Option<T>, min: T, max: T, default: T) -> T {
    match value {
        Some(v) if v >= min && v <= max => v,
        _ => default,
    }
}

impl QuizOptions {
    fn apply(&mut self, update: QuizOptionsUpdate) {
        self.min_players = pick(update.min_players, 2, 16, 2);
        self.max_players = pick(update.max_players, 2, 16, 16);
        self.seconds_to_ask = pick(update.seconds_to_ask, 15, 180, 60);
        self.seconds_to_answer = pick(update.seconds_to_answer, 5, 60, 15);
        if self.min_players > self.max_players {
            self.min_players = self.max_players;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Answer {
    Yes,
    No,
    Abstain,
}

/// A turn has two halves: the current player poses a question, then
/// everyone else votes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ask,
    Answer,
}

#[derive(Debug, Clone, Default)]
pub struct QuizPlayer {
    pub answer: Option<Answer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollResult {
    yes: u32,
    no: u32,
    abstain: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerInfo<'a> {
    number: u8,
    nickname: &'a str,
    answered: bool,
}

fn players_payload(players: &TurnQueue<QuizPlayer>) -> Value {
    let infos: Vec<PlayerInfo<'_>> = players
        .iter()
        .map(|seat| PlayerInfo {
            number: seat.number,
            nickname: &seat.user.nickname,
            answered: seat.payload.answer.is_some(),
        })
        .collect();
    json!(infos)
}

#[derive(Debug, Clone)]
pub enum QuizAction {
    Ask { question: String },
    SkipAsk,
    Answer { answer: Answer },
}

struct QuizState {
    players: TurnQueue<QuizPlayer>,
    phase: Phase,
    question: String,
    logs: Vec<LogRecord>,
}

/// The yes/no party game: players take turns asking the table a
/// question, everyone else votes, the tally goes into the log. There
/// is no score and no winner.
pub struct QuizRoom {
    core: RoomCore,
    options: QuizOptions,
    state: Option<QuizState>,
}

impl QuizRoom {
    fn is_current(&self, user_id: &UserId) -> bool {
        self.state
            .as_ref()
            .and_then(|state| state.players.current())
            .is_some_and(|seat| &seat.user.id == user_id)
    }

    /// Back to the ask phase with the next player on turn.
    fn advance_turn(&mut self) {
        let QuizRoom {
            core,
            state,
            options,
            ..
        } = self;
        let Some(state) = state.as_mut() else { return };
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, false);
        }
        state.players.rotate();
        state.phase = Phase::Ask;
        state.question.clear();
        for seat in state.players.iter_mut() {
            seat.payload.answer = None;
        }
        core.to_room(events::GET_QUESTION, json!(""));
        core.to_room(events::GET_PLAYERS, players_payload(&state.players));
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, true);
        }
        core.flow.arm(options.seconds_to_ask);
        core.send_timer_to_all();
    }

    fn ask(&mut self, user_id: &UserId, question: String) {
        if !self.core.is_running() || self.core.is_on_pause() || !self.is_current(user_id) {
            return;
        }
        let QuizRoom {
            core,
            state,
            options,
            ..
        } = self;
        let Some(state) = state.as_mut() else { return };
        if state.phase != Phase::Ask {
            return;
        }
        let question: String = question.trim().chars().take(MAX_QUESTION_LEN).collect();
        if question.is_empty() {
            return;
        }
        let asker = state
            .players
            .current()
            .map(|s| s.user.nickname.clone())
            .unwrap_or_default();
        state.phase = Phase::Answer;
        state.question = question.clone();
        for seat in state.players.iter_mut() {
            seat.payload.answer = None;
        }
        core.to_room(
            events::GET_QUESTION,
            json!({ "nickname": asker, "question": question }),
        );
        let record = push_log(&mut state.logs, format!("{asker} asks: {question}"));
        core.send_log_record_to_all(&record);
        // The asker sits this one out; everyone else votes.
        for seat in state.players.iter().skip(1) {
            core.send_act_flag_to_user(&seat.user.id, true);
        }
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, false);
        }
        core.flow.arm(options.seconds_to_answer);
        core.send_timer_to_all();
    }

    fn skip_ask(&mut self, user_id: &UserId) {
        if !self.core.is_running() || self.core.is_on_pause() || !self.is_current(user_id) {
            return;
        }
        {
            let QuizRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            if state.phase != Phase::Ask {
                return;
            }
            let asker = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            let record = push_log(&mut state.logs, format!("{asker} passed"));
            core.send_log_record_to_all(&record);
        }
        self.advance_turn();
    }

    fn answer(&mut self, user_id: &UserId, answer: Answer) {
        if !self.core.is_running() || self.core.is_on_pause() {
            return;
        }
        let closed = {
            let QuizRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            if state.phase != Phase::Answer {
                return;
            }
            // The asker has no vote, and a vote is final.
            let Some(index) = state.players.position(|seat| &seat.user.id == user_id) else {
                return;
            };
            if index == 0 {
                return;
            }
            let Some(seat) = state.players.get_mut(index) else {
                return;
            };
            if seat.payload.answer.is_some() {
                return;
            }
            seat.payload.answer = Some(answer);
            core.send_act_flag_to_user(user_id, false);
            core.to_room(events::GET_PLAYERS, players_payload(&state.players));
            state
                .players
                .iter()
                .skip(1)
                .all(|seat| seat.payload.answer.is_some())
        };
        if closed {
            self.close_poll();
        }
    }

    /// Tally the votes, counting every silent player as an
    /// abstention, then move on to the next asker.
    fn close_poll(&mut self) {
        {
            let QuizRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            if state.phase != Phase::Answer {
                return;
            }
            let mut result = PollResult {
                yes: 0,
                no: 0,
                abstain: 0,
            };
            for seat in state.players.iter().skip(1) {
                match seat.payload.answer.unwrap_or(Answer::Abstain) {
                    Answer::Yes => result.yes += 1,
                    Answer::No => result.no += 1,
                    Answer::Abstain => result.abstain += 1,
                }
            }
            core.to_room(
                events::GET_POLL_RESULT,
                json!({ "question": state.question, "result": result }),
            );
            let record = push_log(
                &mut state.logs,
                format!(
                    "{}: yes {}, no {}, abstained {}",
                    state.question, result.yes, result.no, result.abstain
                ),
            );
            core.send_log_record_to_all(&record);
        }
        self.advance_turn();
    }
}

impl GameRoom for QuizRoom {
    type Action = QuizAction;
    type Options = QuizOptionsUpdate;

    fn open(core: RoomCore) -> Self {
        QuizRoom {
            core,
            options: QuizOptions::default(),
            state: None,
        }
    }

    fn core(&self) -> &RoomCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RoomCore {
        &mut self.core
    }

    fn restrictions_to_start(&self) -> Vec<String> {
        let mut restrictions = Vec::new();
        let players = self.core.members.iter().filter(|m| m.is_player).count();
        if players < self.options.min_players as usize {
            restrictions.push(format!(
                "Not enough players (minimum {})",
                self.options.min_players
            ));
        }
        if players > self.options.max_players as usize {
            restrictions.push(format!(
                "Too many players (maximum {})",
                self.options.max_players
            ));
        }
        restrictions
    }

    fn options_payload(&self) -> Value {
        json!(self.options)
    }

    fn apply_options(&mut self, update: QuizOptionsUpdate) {
        self.options.apply(update);
    }

    fn start(&mut self, owner_key: &str) {
        if self.core.is_running() || !self.core.authorize(owner_key) {
            return;
        }
        let restrictions = self.restrictions_to_start();
        if !restrictions.is_empty() {
            debug!(room = %self.core.id, ?restrictions, "start rejected");
            return;
        }

        let mut users = self.core.players_among_members();
        users.shuffle(&mut self.core.rng);
        let seats = users
            .into_iter()
            .enumerate()
            .map(|(i, user)| Seat {
                number: (i + 1) as u8,
                user,
                payload: QuizPlayer::default(),
            })
            .collect();

        let mut logs = Vec::new();
        push_log(&mut logs, "The questions begin".to_string());
        self.state = Some(QuizState {
            players: TurnQueue::new(seats),
            phase: Phase::Ask,
            question: String::new(),
            logs,
        });

        self.core.running = true;
        self.core.flow.arm(self.options.seconds_to_ask);
        info!(room = %self.core.id, "match started");

        let QuizRoom { core, state, .. } = self;
        let Some(state) = state.as_ref() else { return };
        core.send_status_to_all();
        core.send_pause_flag_to_all();
        core.send_act_flag_to_all(false);
        core.to_room(events::GET_PLAYERS, players_payload(&state.players));
        core.send_logs_to_all(&state.logs);
        core.send_timer_to_all();
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, true);
        }
    }

    fn stop(&mut self, owner_key: &str) {
        if !self.core.is_running() || !self.core.authorize(owner_key) {
            return;
        }
        self.core.running = false;
        self.core.flow.stop();
        info!(room = %self.core.id, "match stopped");
        self.core.send_act_flag_to_all(false);
        self.core.send_status_to_all();
        self.core.send_pause_flag_to_all();
        let restrictions = self.restrictions_to_start();
        self.core.send_restrictions_to_owner(&restrictions);
    }

    fn on_join(&mut self, user_id: &UserId) {
        self.core.send_status_to_user(user_id);
        self.core.send_pause_flag_to_user(user_id);
        self.core.send_title_to_user(user_id);
        self.core
            .to_user(user_id, events::GET_ROOM_OPTIONS, json!(self.options));
        let Some(nickname) = self.core.member(user_id).map(|m| m.user.nickname.clone()) else {
            return;
        };
        let connected = self.core.members.iter().filter(|m| m.is_player).count();
        let QuizRoom { core, state, .. } = self;
        let Some(state) = state.as_mut() else { return };

        core.to_user(user_id, events::GET_PLAYERS, players_payload(&state.players));
        core.send_logs_to_user(user_id, &state.logs);
        core.send_timer_to_user(user_id);
        if state.phase == Phase::Answer {
            let asker = state
                .players
                .current()
                .map(|s| s.user.nickname.as_str())
                .unwrap_or_default();
            core.to_user(
                user_id,
                events::GET_QUESTION,
                json!({ "nickname": asker, "question": state.question }),
            );
        }

        if !core.is_running() {
            return;
        }
        let rebind = state
            .players
            .rejoin_target(connected, &nickname)
            .map(|seat| {
                seat.user.id = user_id.clone();
                (seat.number, seat.payload.answer)
            });
        let Some((number, answer)) = rebind else { return };
        if let Some(member) = core.member_mut(user_id) {
            member.is_player = true;
        }
        info!(room = %core.id, user = %user_id, "player reclaimed a seat");
        let is_asker = state
            .players
            .current()
            .is_some_and(|seat| seat.number == number);
        let may_act = match state.phase {
            Phase::Ask => is_asker,
            Phase::Answer => !is_asker && answer.is_none(),
        };
        if may_act {
            core.send_act_flag_to_user(user_id, true);
        }
    }

    fn handle_action(&mut self, user_id: &UserId, action: QuizAction) {
        match action {
            QuizAction::Ask { question } => self.ask(user_id, question),
            QuizAction::SkipAsk => self.skip_ask(user_id),
            QuizAction::Answer { answer } => self.answer(user_id, answer),
        }
    }

    fn on_timer_fired(&mut self, epoch: u64) {
        if !self.core.flow.matches(epoch) || !self.core.is_running() {
            return;
        }
        let phase = match self.state.as_ref() {
            Some(state) => state.phase,
            None => return,
        };
        match phase {
            Phase::Ask => {
                {
                    let QuizRoom { core, state, .. } = self;
                    let Some(state) = state.as_mut() else { return };
                    let asker = state
                        .players
                        .current()
                        .map(|s| s.user.nickname.clone())
                        .unwrap_or_default();
                    let record =
                        push_log(&mut state.logs, format!("{asker} couldn't think of one"));
                    core.send_log_record_to_all(&record);
                }
                self.advance_turn();
            }
            Phase::Answer => self.close_poll(),
        }
    }
}
