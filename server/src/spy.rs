use std::collections::VecDeque;

use common::pack;
use common::{Card, CardFace, CardId, Field, Movement, Sizes};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::broadcast::{events, UserId};
use crate::room::{push_log, GameRoom, LogRecord, RoomCore};
use crate::turn::{Seat, TurnQueue};

/// Match options for the deduction game. Every value has a valid
/// range; an update outside it falls back to the default rather than
/// being rejected.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpyOptions {
    pub min_players: u8,
    pub max_players: u8,
    pub rows: u8,
    pub columns: u8,
    pub seconds_to_act: u64,
    pub win_score: u32,
}

impl Default for SpyOptions {
    fn default() -> Self {
        SpyOptions {
            min_players: 2,
            max_players: 8,
            rows: 5,
            columns: 5,
            seconds_to_act: 60,
            win_score: 3,
        }
    }
}

fn pick<T: PartialOrd>(value: Option<T>, min: T, max: T, default: T) -> T {
    match value {
        Some(v) if v >= min && v <= max => v,
        _ => default,
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpyOptionsUpdate {
    pub min_players: Option<u8>,
    pub max_players: Option<u8>,
    pub rows: Option<u8>,
    pub columns: Option<u8>,
    pub seconds_to_act: Option<u64>,
    pub win_score: Option<u32>,
}

impl SpyOptions {
    fn apply(&mut self, update: SpyOptionsUpdate) {
        self.min_players = pick(update.min_players, 2, 8, 2);
        self.max_players = pick(update.max_players, 2, 8, 8);
        self.rows = pick(update.rows, 3, 7, 5);
        self.columns = pick(update.columns, 3, 7, 5);
        self.seconds_to_act = pick(update.seconds_to_act, 15, 180, 60);
        self.win_score = pick(update.win_score, 1, 5, 3);
        if self.min_players > self.max_players {
            self.min_players = self.max_players;
        }
    }
}

/// Per-seat match state: the score and the secret identity card, if
/// the player still holds one.
#[derive(Debug, Clone)]
pub struct SpyPlayer {
    pub score: u32,
    pub card_id: Option<CardId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerInfo<'a> {
    number: u8,
    nickname: &'a str,
    score: u32,
}

fn players_payload(players: &TurnQueue<SpyPlayer>) -> Value {
    let infos: Vec<PlayerInfo<'_>> = players
        .iter()
        .map(|seat| PlayerInfo {
            number: seat.number,
            nickname: &seat.user.nickname,
            score: seat.payload.score,
        })
        .collect();
    json!(infos)
}

#[derive(Debug, Clone)]
pub enum SpyAction {
    MoveCards(Movement),
    CaptureCard { card_id: CardId },
    AskCard { card_id: CardId },
    SetCardOptions { owner_key: String, deck: Vec<CardFace> },
    RequestCardOptions,
}

/// Everything that exists only while a match is (or was) on the
/// table. Kept after the match ends so late joiners still see the
/// final board; replaced wholesale by the next start.
struct SpyState {
    players: TurnQueue<SpyPlayer>,
    field: Field,
    logs: Vec<LogRecord>,
}

/// A deduction game room: players hold secret identity cards on a
/// shared grid and take turns shifting lines, interrogating
/// neighborhoods and accusing cards.
pub struct SpyRoom {
    core: RoomCore,
    options: SpyOptions,
    deck: Vec<CardFace>,
    last_winner: String,
    state: Option<SpyState>,
}

impl SpyRoom {
    fn is_current(&self, user_id: &UserId) -> bool {
        self.state
            .as_ref()
            .and_then(|state| state.players.current())
            .is_some_and(|seat| &seat.user.id == user_id)
    }

    /// End the current turn: rotate the queue, publish the new board
    /// and rearm the countdown for the next actor.
    fn advance_turn(&mut self) {
        let SpyRoom {
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
        core.to_room(events::GET_FIELD_CARDS, json!(state.field.views()));
        core.to_room(events::GET_PLAYERS, players_payload(&state.players));
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, true);
            let ids = seat
                .payload
                .card_id
                .map(|id| state.field.act_card_ids(id))
                .unwrap_or_default();
            core.to_user(&seat.user.id, events::GET_ACT_CARD_IDS, json!(ids));
        }
        core.flow.arm(options.seconds_to_act);
        core.send_timer_to_all();
    }

    fn move_cards(&mut self, user_id: &UserId, movement: Movement) {
        if !self.core.is_running() || self.core.is_on_pause() || !self.is_current(user_id) {
            return;
        }
        {
            let SpyRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            if !state.field.shift(movement) {
                debug!(room = %core.id, ?movement, "shift out of range");
                return;
            }
            let actor = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            let line = if movement.is_row { "row" } else { "column" };
            let way = if movement.forward { "forward" } else { "back" };
            let record = push_log(
                &mut state.logs,
                format!("{actor} shifted {line} {} {way}", movement.id),
            );
            core.send_log_record_to_all(&record);
        }
        self.advance_turn();
    }

    fn ask_card(&mut self, user_id: &UserId, card_id: CardId) {
        if !self.core.is_running() || self.core.is_on_pause() || !self.is_current(user_id) {
            return;
        }
        {
            let SpyRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            let Some(my_card) = state.players.current().and_then(|s| s.payload.card_id) else {
                return;
            };
            let target_title = match state.field.card(card_id) {
                Some(card) if !card.captured => card.title.clone(),
                _ => return,
            };
            if !state.field.check_opportunity(my_card, card_id) {
                return;
            }
            let opponents: Vec<CardId> = state
                .players
                .iter()
                .skip(1)
                .filter_map(|seat| seat.payload.card_id)
                .collect();
            let Some(hits) = state.field.ask(card_id, &opponents) else {
                return;
            };
            let actor = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            let text = if hits > 0 {
                format!("{actor} asked around {target_title}: someone is nearby")
            } else {
                format!("{actor} asked around {target_title}: nobody there")
            };
            let record = push_log(&mut state.logs, text);
            core.send_log_record_to_all(&record);
        }
        self.advance_turn();
    }

    fn capture_card(&mut self, user_id: &UserId, card_id: CardId) {
        if !self.core.is_running() || self.core.is_on_pause() || !self.is_current(user_id) {
            return;
        }
        let won = {
            let SpyRoom {
                core,
                state,
                options,
                ..
            } = self;
            let Some(state) = state.as_mut() else { return };
            let Some(my_card) = state.players.current().and_then(|s| s.payload.card_id) else {
                return;
            };
            let target_title = match state.field.card(card_id) {
                Some(card) if !card.captured => card.title.clone(),
                _ => return,
            };
            if !state.field.check_opportunity(my_card, card_id) {
                return;
            }
            let actor = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            let victim_index = state
                .players
                .position(|seat| seat.payload.card_id == Some(card_id));
            match victim_index {
                // Own identity never counts as a catch.
                Some(index) if index != 0 => {
                    state.field.capture(card_id, true);
                    let mut score = 0;
                    if let Some(seat) = state.players.current_mut() {
                        seat.payload.score += 1;
                        score = seat.payload.score;
                    }
                    let won = score >= options.win_score;
                    let mut victim = String::new();
                    if let Some(seat) = state.players.get_mut(index) {
                        victim = seat.user.nickname.clone();
                        // A finished match never re-deals the caught player.
                        seat.payload.card_id = if won {
                            None
                        } else {
                            let replacement = state.field.redeal();
                            if let Some(card) = &replacement {
                                core.to_user(&seat.user.id, events::GET_CARD, json!(card));
                            }
                            replacement.as_ref().map(|c| c.id)
                        };
                    }
                    info!(room = %core.id, %actor, %victim, "identity exposed");
                    let record = push_log(
                        &mut state.logs,
                        format!("{actor} exposed {victim} ({target_title})"),
                    );
                    core.send_log_record_to_all(&record);
                    won
                }
                _ => {
                    state.field.capture(card_id, false);
                    let record = push_log(
                        &mut state.logs,
                        format!("{actor} suspected {target_title}, but nobody was there"),
                    );
                    core.send_log_record_to_all(&record);
                    false
                }
            }
        };
        if won {
            self.win();
        } else {
            self.advance_turn();
        }
    }

    fn win(&mut self) {
        {
            let SpyRoom {
                core,
                state,
                last_winner,
                ..
            } = self;
            let Some(state) = state.as_mut() else { return };
            core.running = false;
            core.flow.stop();
            let winner = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            info!(room = %core.id, %winner, "match won");
            let record = push_log(&mut state.logs, format!("{winner} wins the match"));
            core.send_log_record_to_all(&record);
            *last_winner = winner;
            core.to_room(events::GET_LAST_WINNER, json!(last_winner));
            state.field.unmark();
            core.to_room(events::GET_FIELD_CARDS, json!(state.field.views()));
            core.to_room(events::GET_PLAYERS, players_payload(&state.players));
            if let Some(seat) = state.players.current() {
                core.send_act_flag_to_user(&seat.user.id, false);
            }
            core.send_status_to_all();
            core.send_pause_flag_to_all();
        }
        let restrictions = self.restrictions_to_start();
        self.core.send_restrictions_to_owner(&restrictions);
    }

    fn set_card_options(&mut self, owner_key: &str, deck: Vec<CardFace>) {
        if self.core.is_running() || !self.core.authorize(owner_key) {
            return;
        }
        let deck: Vec<CardFace> = deck
            .into_iter()
            .filter(|face| !face.title.is_empty())
            .enumerate()
            .map(|(i, face)| CardFace {
                id: (i + 1) as CardId,
                ..face
            })
            .collect();
        if deck.is_empty() {
            return;
        }
        info!(room = %self.core.id, cards = deck.len(), "deck replaced");
        self.deck = deck;
        self.core
            .to_room(events::GET_CARD_OPTIONS, json!(self.deck));
        let restrictions = self.restrictions_to_start();
        self.core.send_restrictions_to_owner(&restrictions);
    }

    fn request_card_options(&self, user_id: &UserId) {
        self.core
            .to_user(user_id, events::GET_CARD_OPTIONS, json!(self.deck));
    }
}

impl GameRoom for SpyRoom {
    type Action = SpyAction;
    type Options = SpyOptionsUpdate;

    fn open(core: RoomCore) -> Self {
        SpyRoom {
            core,
            options: SpyOptions::default(),
            deck: pack::default_pack(),
            last_winner: String::new(),
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
        let sizes = Sizes {
            rows: self.options.rows,
            columns: self.options.columns,
        };
        let identities = self.deck.len().min(sizes.total());
        let needed = self.options.win_score as usize * players;
        if needed > identities {
            restrictions.push(format!(
                "The deck is too small: {players} players need {needed} identity cards, only {identities} can be dealt"
            ));
        }
        restrictions
    }

    fn options_payload(&self) -> Value {
        json!(self.options)
    }

    fn apply_options(&mut self, update: SpyOptionsUpdate) {
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

        let sizes = Sizes {
            rows: self.options.rows,
            columns: self.options.columns,
        };
        let total = sizes.total();

        // Deal the grid: a random subset of the deck, padded with
        // pre-captured placeholders when the grid outgrows the deck.
        let mut pool = self.deck.clone();
        pool.shuffle(&mut self.core.rng);
        pool.truncate(total);
        let mut cards: Vec<Card> = pool
            .iter()
            .enumerate()
            .map(|(i, face)| Card::from_face((i + 1) as CardId, face))
            .collect();
        for id in cards.len() + 1..=total {
            cards.push(Card::placeholder(id as CardId));
        }
        cards.shuffle(&mut self.core.rng);

        // Identity pool: every live card, in random order. One per
        // player up front, the rest backfill captures.
        let mut identities: Vec<Card> = cards.iter().filter(|c| !c.captured).cloned().collect();
        identities.shuffle(&mut self.core.rng);
        let mut identities: VecDeque<Card> = identities.into();

        let mut users = self.core.players_among_members();
        users.shuffle(&mut self.core.rng);
        let mut seats = Vec::with_capacity(users.len());
        for (i, user) in users.into_iter().enumerate() {
            let identity = identities.pop_front();
            if let Some(card) = &identity {
                self.core.to_user(&user.id, events::GET_CARD, json!(card));
            }
            seats.push(Seat {
                number: (i + 1) as u8,
                user,
                payload: SpyPlayer {
                    score: 0,
                    card_id: identity.as_ref().map(|c| c.id),
                },
            });
        }

        let field = Field::new(cards, sizes, identities);
        let mut logs = Vec::new();
        push_log(
            &mut logs,
            format!(
                "A new match begins: {} spies on a {}x{} grid",
                seats.len(),
                sizes.rows,
                sizes.columns
            ),
        );
        self.state = Some(SpyState {
            players: TurnQueue::new(seats),
            field,
            logs,
        });

        self.core.running = true;
        self.core.flow.arm(self.options.seconds_to_act);
        info!(room = %self.core.id, "match started");

        let SpyRoom { core, state, .. } = self;
        let Some(state) = state.as_ref() else { return };
        core.send_status_to_all();
        core.send_pause_flag_to_all();
        core.send_act_flag_to_all(false);
        core.to_room(events::GET_SIZES, json!(state.field.sizes()));
        core.to_room(events::GET_FIELD_CARDS, json!(state.field.views()));
        core.to_room(events::GET_PLAYERS, players_payload(&state.players));
        core.send_logs_to_all(&state.logs);
        core.send_timer_to_all();
        if let Some(seat) = state.players.current() {
            core.send_act_flag_to_user(&seat.user.id, true);
            let ids = seat
                .payload
                .card_id
                .map(|id| state.field.act_card_ids(id))
                .unwrap_or_default();
            core.to_user(&seat.user.id, events::GET_ACT_CARD_IDS, json!(ids));
        }
    }

    fn stop(&mut self, owner_key: &str) {
        if !self.core.is_running() || !self.core.authorize(owner_key) {
            return;
        }
        self.core.running = false;
        self.core.flow.stop();
        info!(room = %self.core.id, "match stopped");
        {
            let SpyRoom { core, state, .. } = self;
            if let Some(state) = state.as_mut() {
                state.field.unmark();
                core.to_room(events::GET_FIELD_CARDS, json!(state.field.views()));
                if let Some(seat) = state.players.current() {
                    core.send_act_flag_to_user(&seat.user.id, false);
                }
            }
        }
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
        self.core
            .to_user(user_id, events::GET_CARD_OPTIONS, json!(self.deck));
        if !self.last_winner.is_empty() {
            self.core
                .to_user(user_id, events::GET_LAST_WINNER, json!(self.last_winner));
        }
        let Some(nickname) = self.core.member(user_id).map(|m| m.user.nickname.clone()) else {
            return;
        };
        let connected = self.core.members.iter().filter(|m| m.is_player).count();
        let SpyRoom { core, state, .. } = self;
        let Some(state) = state.as_mut() else { return };

        core.to_user(user_id, events::GET_SIZES, json!(state.field.sizes()));
        core.to_user(user_id, events::GET_FIELD_CARDS, json!(state.field.views()));
        core.to_user(user_id, events::GET_PLAYERS, players_payload(&state.players));
        core.send_logs_to_user(user_id, &state.logs);
        core.send_timer_to_user(user_id);

        if !core.is_running() {
            return;
        }
        // A joiner whose nickname matches an unclaimed seat takes it
        // over and plays on with the seat's score and identity.
        let rebind = state
            .players
            .rejoin_target(connected, &nickname)
            .map(|seat| {
                seat.user.id = user_id.clone();
                (seat.number, seat.payload.card_id)
            });
        let Some((number, card_id)) = rebind else { return };
        if let Some(member) = core.member_mut(user_id) {
            member.is_player = true;
        }
        info!(room = %core.id, user = %user_id, "player reclaimed a seat");
        if let Some(card_id) = card_id {
            if let Some(card) = state.field.card(card_id) {
                core.to_user(user_id, events::GET_CARD, json!(card));
            }
        }
        if state
            .players
            .current()
            .is_some_and(|seat| seat.number == number)
        {
            core.send_act_flag_to_user(user_id, true);
            let ids = card_id
                .map(|id| state.field.act_card_ids(id))
                .unwrap_or_default();
            core.to_user(user_id, events::GET_ACT_CARD_IDS, json!(ids));
        }
    }

    fn handle_action(&mut self, user_id: &UserId, action: SpyAction) {
        match action {
            SpyAction::MoveCards(movement) => self.move_cards(user_id, movement),
            SpyAction::CaptureCard { card_id } => self.capture_card(user_id, card_id),
            SpyAction::AskCard { card_id } => self.ask_card(user_id, card_id),
            SpyAction::SetCardOptions { owner_key, deck } => self.set_card_options(&owner_key, deck),
            SpyAction::RequestCardOptions => self.request_card_options(user_id),
        }
    }

    fn on_timer_fired(&mut self, epoch: u64) {
        if !self.core.flow.matches(epoch) || !self.core.is_running() {
            return;
        }
        {
            let SpyRoom { core, state, .. } = self;
            let Some(state) = state.as_mut() else { return };
            let sizes = state.field.sizes();
            let is_row = core.rng.gen_bool(0.5);
            let limit = if is_row { sizes.rows } else { sizes.columns };
            let movement = Movement {
                is_row,
                forward: core.rng.gen_bool(0.5),
                id: core.rng.gen_range(1..=limit),
            };
            state.field.shift(movement);
            let actor = state
                .players
                .current()
                .map(|s| s.user.nickname.clone())
                .unwrap_or_default();
            debug!(room = %core.id, %actor, ?movement, "turn timed out");
            let record = push_log(
                &mut state.logs,
                format!("{actor} ran out of time, the cards moved on their own"),
            );
            core.send_log_record_to_all(&record);
        }
        self.advance_turn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;
    use tokio::time::{advance, Duration};

    use crate::broadcast::{ChannelBroadcaster, OutboundMessage};
    use crate::flow::TimerFired;
    use crate::room::{self, RoomStatus, User};

    fn new_room(
        seed: u64,
    ) -> (
        SpyRoom,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<TimerFired>,
    ) {
        let (broadcaster, rx) = ChannelBroadcaster::channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let core = RoomCore::new(Arc::new(broadcaster), timer_tx, StdRng::seed_from_u64(seed));
        (SpyRoom::open(core), rx, timer_rx)
    }

    fn user(name: &str) -> User {
        User {
            id: UserId::from(name),
            nickname: name.to_string(),
        }
    }

    fn seat_users(room: &mut SpyRoom, names: &[&str]) {
        for name in names {
            let mut u = user(name);
            room::join(room, &mut u);
            room::set_role(room, &u.id, true);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn owner_key(room: &SpyRoom) -> String {
        room.core().owner_key.clone().unwrap()
    }

    async fn started(
        names: &[&str],
        update: SpyOptionsUpdate,
    ) -> (
        SpyRoom,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<TimerFired>,
        String,
    ) {
        let (mut room, mut rx, timer_rx) = new_room(7);
        seat_users(&mut room, names);
        let key = owner_key(&room);
        room.apply_options(update);
        room.start(&key);
        drain(&mut rx);
        (room, rx, timer_rx, key)
    }

    /// Replace the dealt board with a known one: sequential ids in
    /// row-major order, identities as listed, the first listed player
    /// on turn.
    fn rig(room: &mut SpyRoom, assignments: &[(&str, CardId)], reserve_ids: &[CardId]) {
        let sizes = Sizes {
            rows: room.options.rows,
            columns: room.options.columns,
        };
        let cards: Vec<Card> = (1..=sizes.total())
            .map(|i| Card {
                id: i as CardId,
                title: format!("Card {i}"),
                url: String::new(),
                captured: false,
            })
            .collect();
        let reserve: VecDeque<Card> = reserve_ids
            .iter()
            .map(|&id| Card {
                id,
                title: format!("Card {id}"),
                url: String::new(),
                captured: false,
            })
            .collect();
        let state = room.state.as_mut().unwrap();
        state.field = Field::new(cards, sizes, reserve);
        for (nickname, card_id) in assignments {
            let index = state
                .players
                .position(|seat| seat.user.nickname == *nickname)
                .unwrap();
            state.players.get_mut(index).unwrap().payload.card_id = Some(*card_id);
        }
        while state.players.current().unwrap().user.nickname != assignments[0].0 {
            state.players.rotate();
        }
    }

    fn current_nickname(room: &SpyRoom) -> String {
        room.state
            .as_ref()
            .unwrap()
            .players
            .current()
            .unwrap()
            .user
            .nickname
            .clone()
    }

    #[test]
    fn first_member_becomes_owner_with_a_key() {
        let (mut room, mut rx, _timers) = new_room(1);
        let mut ann = user("ann");
        room::join(&mut room, &mut ann);
        assert_eq!(room.core().owner, Some(ann.id.clone()));
        let key = owner_key(&room);
        assert_eq!(key.len(), 5);
        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| m.event == events::GET_OWNER_KEY && m.payload == json!(key)));
    }

    #[test]
    fn colliding_nicknames_get_a_marker_appended() {
        let (mut room, mut rx, _timers) = new_room(1);
        let mut first = user("ann");
        room::join(&mut room, &mut first);
        drain(&mut rx);

        let mut second = User {
            id: UserId::from("other"),
            nickname: "ann".to_string(),
        };
        room::join(&mut room, &mut second);
        assert_eq!(second.nickname, "ann)");
        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| m.event == events::GET_NICKNAME
            && m.payload == json!({ "nickname": "ann)", "force": true })));
    }

    #[test]
    fn kicking_the_owner_transfers_ownership_with_a_fresh_key() {
        let (mut room, _rx, _timers) = new_room(2);
        seat_users(&mut room, &["ann", "bob"]);
        let old_key = owner_key(&room);
        assert_eq!(room.core().owner, Some(UserId::from("ann")));

        room::kick(&mut room, &UserId::from("ann"));
        assert_eq!(room.core().owner, Some(UserId::from("bob")));
        assert_ne!(owner_key(&room), old_key);
    }

    #[test]
    fn an_emptied_room_loses_owner_and_key() {
        let (mut room, _rx, _timers) = new_room(3);
        seat_users(&mut room, &["ann"]);
        room::kick(&mut room, &UserId::from("ann"));
        assert!(room.core().owner.is_none());
        assert!(room.core().owner_key.is_none());
        assert!(!room.core_mut().check_activity());
    }

    #[test]
    fn rename_and_options_require_the_owner_key() {
        let (mut room, _rx, _timers) = new_room(4);
        seat_users(&mut room, &["ann"]);
        let key = owner_key(&room);

        assert!(!room::rename(&mut room, "wrong", "Lounge".into()));
        assert!(room::rename(&mut room, &key, "Lounge".into()));
        assert_eq!(room.core().title(), "Lounge");

        assert!(!room::set_options(
            &mut room,
            "wrong",
            SpyOptionsUpdate::default()
        ));
    }

    #[test]
    fn out_of_range_options_fall_back_to_defaults() {
        let (mut room, _rx, _timers) = new_room(5);
        room.apply_options(SpyOptionsUpdate {
            rows: Some(99),
            columns: Some(4),
            seconds_to_act: Some(5),
            ..Default::default()
        });
        assert_eq!(room.options.rows, 5);
        assert_eq!(room.options.columns, 4);
        assert_eq!(room.options.seconds_to_act, 60);

        // An inverted pair is reconciled downwards.
        room.apply_options(SpyOptionsUpdate {
            min_players: Some(5),
            max_players: Some(3),
            ..Default::default()
        });
        assert_eq!(room.options.max_players, 3);
        assert_eq!(room.options.min_players, 3);
    }

    #[test]
    fn restrictions_report_missing_players_and_a_short_deck() {
        let (mut room, _rx, _timers) = new_room(6);
        assert!(!room.restrictions_to_start().is_empty());

        seat_users(&mut room, &["ann", "bob"]);
        assert!(room.restrictions_to_start().is_empty());

        // 2 players x 5 wins need 10 identities, a 3x3 grid deals 9.
        room.apply_options(SpyOptionsUpdate {
            rows: Some(3),
            columns: Some(3),
            win_score: Some(5),
            ..Default::default()
        });
        let restrictions = room.restrictions_to_start();
        assert_eq!(restrictions.len(), 1);
        assert!(restrictions[0].contains("deck is too small"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_deals_identities_and_arms_the_countdown() {
        let (room, _rx, _timers, _key) =
            started(&["ann", "bob", "cat"], SpyOptionsUpdate::default()).await;
        assert!(room.core().is_running());
        assert_eq!(room.core().status(), RoomStatus::Run);

        let state = room.state.as_ref().unwrap();
        assert_eq!(state.players.len(), 3);
        let mut ids: Vec<CardId> = state
            .players
            .iter()
            .map(|s| s.payload.card_id.unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "identities must be distinct");
        assert_eq!(state.field.cards().len(), 25);
        assert_eq!(state.field.reserve_len(), 22);
        assert_eq!(room.core().flow.snapshot().unwrap().max_seconds, 60);
        // Newest log entry first.
        assert!(state.logs[0].text.contains("new match"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_requires_the_key_and_a_startable_room() {
        let (mut room, _rx, _timers) = new_room(8);
        seat_users(&mut room, &["ann"]);
        let key = owner_key(&room);
        // Too few players.
        room.start(&key);
        assert!(!room.core().is_running());

        seat_users(&mut room, &["bob"]);
        room.start("wrong");
        assert!(!room.core().is_running());
        room.start(&key);
        assert!(room.core().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn capturing_an_opponent_identity_scores_and_redeals() {
        let (mut room, mut rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[20]);
        drain(&mut rx);

        room.handle_action(&UserId::from("ann"), SpyAction::CaptureCard { card_id: 13 });

        let state = room.state.as_ref().unwrap();
        assert!(state.field.card(13).unwrap().captured);
        let ann = state
            .players
            .iter()
            .find(|s| s.user.nickname == "ann")
            .unwrap();
        assert_eq!(ann.payload.score, 1);
        let bob = state
            .players
            .iter()
            .find(|s| s.user.nickname == "bob")
            .unwrap();
        assert_eq!(bob.payload.card_id, Some(20));
        assert_eq!(current_nickname(&room), "bob");

        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| m.event == events::GET_CARD && m.payload["id"] == json!(20)));
        assert!(messages.iter().any(|m| m.event == events::GET_LOG_RECORD));
    }

    #[tokio::test(start_paused = true)]
    async fn a_wrong_accusation_marks_the_card_and_passes_the_turn() {
        let (mut room, _rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);

        // Card 8 is adjacent to 7 but belongs to nobody.
        room.handle_action(&UserId::from("ann"), SpyAction::CaptureCard { card_id: 8 });

        let state = room.state.as_ref().unwrap();
        assert!(!state.field.card(8).unwrap().captured);
        assert_eq!(state.field.marker(8).captured, Some(false));
        let ann = state
            .players
            .iter()
            .find(|s| s.user.nickname == "ann")
            .unwrap();
        assert_eq!(ann.payload.score, 0);
        assert_eq!(current_nickname(&room), "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_turn_and_out_of_reach_actions_are_ignored() {
        let (mut room, _rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);

        // Not bob's turn.
        room.handle_action(&UserId::from("bob"), SpyAction::CaptureCard { card_id: 7 });
        assert_eq!(current_nickname(&room), "ann");

        // Card 25 is nowhere near card 7.
        room.handle_action(&UserId::from("ann"), SpyAction::CaptureCard { card_id: 25 });
        assert_eq!(current_nickname(&room), "ann");
        assert!(!room.state.as_ref().unwrap().field.card(25).unwrap().captured);
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_the_win_score_ends_the_match() {
        let (mut room, mut rx, _timers, _key) = started(
            &["ann", "bob"],
            SpyOptionsUpdate {
                win_score: Some(1),
                ..Default::default()
            },
        )
        .await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[20]);
        drain(&mut rx);

        room.handle_action(&UserId::from("ann"), SpyAction::CaptureCard { card_id: 13 });

        assert!(!room.core().is_running());
        assert_eq!(room.core().status(), RoomStatus::Idle);
        assert_eq!(room.last_winner, "ann");
        assert!(room.core().flow.snapshot().is_none());

        // The winning capture does not re-deal the caught player.
        let state = room.state.as_ref().unwrap();
        assert_eq!(state.field.reserve_len(), 1);
        let bob = state
            .players
            .iter()
            .find(|s| s.user.nickname == "bob")
            .unwrap();
        assert_eq!(bob.payload.card_id, None);
        let messages = drain(&mut rx);
        assert!(!messages.iter().any(|m| m.event == events::GET_CARD));
    }

    #[tokio::test(start_paused = true)]
    async fn asking_marks_the_neighborhood_and_advances() {
        let (mut room, _rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);
        let logs_before = room.state.as_ref().unwrap().logs.len();

        room.handle_action(&UserId::from("ann"), SpyAction::AskCard { card_id: 13 });

        let state = room.state.as_ref().unwrap();
        // Bob's identity sits at the center of the asked block.
        assert_eq!(state.field.marker(13).asked, Some(true));
        assert_eq!(state.logs.len(), logs_before + 1);
        assert!(state.logs[0].text.contains("someone is nearby"));
        assert_eq!(current_nickname(&room), "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn a_move_shifts_the_grid_and_passes_the_turn() {
        let (mut room, _rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);

        room.handle_action(
            &UserId::from("ann"),
            SpyAction::MoveCards(Movement {
                is_row: true,
                forward: true,
                id: 1,
            }),
        );

        let state = room.state.as_ref().unwrap();
        let first_row: Vec<CardId> = state.field.cards()[..5].iter().map(|c| c.id).collect();
        assert_eq!(first_row, vec![5, 1, 2, 3, 4]);
        assert_eq!(current_nickname(&room), "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn a_timeout_shifts_randomly_and_advances_but_stale_epochs_do_not() {
        let (mut room, _rx, mut timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);

        // The sleep registers its deadline on first poll.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        advance(Duration::from_secs(61)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let fired = timers.try_recv().expect("countdown should fire");

        room.on_timer_fired(fired.epoch + 1);
        assert_eq!(current_nickname(&room), "ann");

        room.on_timer_fired(fired.epoch);
        assert_eq!(current_nickname(&room), "bob");
        assert!(room.state.as_ref().unwrap().logs[0]
            .text
            .contains("ran out of time"));
        // Rearmed for the next actor, so the old epoch is dead.
        assert!(!room.core().flow.matches(fired.epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_the_countdown_until_resume() {
        let (mut room, _rx, _timers, key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;

        room.pause("wrong");
        assert!(!room.core().is_on_pause());

        advance(Duration::from_secs(10)).await;
        room.pause(&key);
        assert!(room.core().is_on_pause());
        assert_eq!(room.core().status(), RoomStatus::Pause);
        let frozen = room.core().flow.snapshot().unwrap();
        assert_eq!(frozen.current_seconds, 50);

        advance(Duration::from_secs(30)).await;
        assert_eq!(room.core().flow.snapshot().unwrap(), frozen);

        room.resume(&key);
        assert_eq!(room.core().status(), RoomStatus::Run);
        assert_eq!(room.core().flow.snapshot().unwrap().current_seconds, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn role_and_nickname_changes_are_frozen_while_running() {
        let (mut room, _rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        assert!(!room::set_role(&mut room, &UserId::from("ann"), false));

        let mut ann = user("ann");
        assert_eq!(
            room::change_nickname(&mut room, &mut ann, "annie".into()),
            ""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_player_can_reclaim_their_seat_by_nickname() {
        let (mut room, mut rx, _timers, _key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);

        room::kick(&mut room, &UserId::from("bob"));
        drain(&mut rx);

        let mut again = User {
            id: UserId::from("bob-2"),
            nickname: "bob".to_string(),
        };
        room::join(&mut room, &mut again);
        assert_eq!(again.nickname, "bob", "seat nickname was free again");

        let state = room.state.as_ref().unwrap();
        let seat = state
            .players
            .iter()
            .find(|s| s.user.nickname == "bob")
            .unwrap();
        assert_eq!(seat.user.id, UserId::from("bob-2"));
        assert_eq!(seat.payload.card_id, Some(13));
        assert!(room.core().member(&UserId::from("bob-2")).unwrap().is_player);

        // The rejoiner got their identity card privately.
        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| m.event == events::GET_CARD && m.payload["id"] == json!(13)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_markers_and_reports_restrictions_again() {
        let (mut room, mut rx, _timers, key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        rig(&mut room, &[("ann", 7), ("bob", 13)], &[]);
        room.handle_action(&UserId::from("ann"), SpyAction::AskCard { card_id: 13 });
        drain(&mut rx);

        room.stop("wrong");
        assert!(room.core().is_running());
        room.stop(&key);
        assert!(!room.core().is_running());
        assert_eq!(room.core().status(), RoomStatus::Idle);
        assert!(room.core().flow.snapshot().is_none());
        let state = room.state.as_ref().unwrap();
        assert!(state.field.marker(13).is_empty());
    }

    #[test]
    fn a_joiner_receives_the_options_and_the_deck() {
        let (mut room, mut rx, _timers) = new_room(10);
        let mut ann = user("ann");
        room::join(&mut room, &mut ann);

        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| m.event == events::GET_ROOM_OPTIONS));
        let deck = messages
            .iter()
            .find(|m| m.event == events::GET_CARD_OPTIONS)
            .expect("the deck is part of the join replay");
        assert_eq!(deck.payload.as_array().map(Vec::len), Some(25));
    }

    #[tokio::test(start_paused = true)]
    async fn a_deserted_paused_room_can_still_resume() {
        let (mut room, _rx, _timers, key) =
            started(&["ann", "bob"], SpyOptionsUpdate::default()).await;
        advance(Duration::from_secs(10)).await;
        room.pause(&key);
        let frozen = room.core().flow.snapshot().unwrap();
        assert_eq!(frozen.current_seconds, 50);

        // The reaper probes an emptied room, which pauses again.
        room::kick(&mut room, &UserId::from("ann"));
        room::kick(&mut room, &UserId::from("bob"));
        assert!(!room.core_mut().check_activity());
        assert_eq!(room.core().flow.snapshot().unwrap(), frozen);

        room.resume(&key);
        assert_eq!(room.core().status(), RoomStatus::Run);
        assert_eq!(room.core().flow.snapshot().unwrap().current_seconds, 50);
    }

    #[test]
    fn replacing_the_deck_renumbers_and_requires_the_key() {
        let (mut room, _rx, _timers) = new_room(9);
        seat_users(&mut room, &["ann"]);
        let key = owner_key(&room);
        let faces = vec![
            CardFace {
                id: 42,
                title: "Alpha".into(),
                url: "/a.jpg".into(),
            },
            CardFace {
                id: 42,
                title: String::new(),
                url: String::new(),
            },
            CardFace {
                id: 42,
                title: "Beta".into(),
                url: "/b.jpg".into(),
            },
        ];

        room.handle_action(
            &UserId::from("ann"),
            SpyAction::SetCardOptions {
                owner_key: "wrong".into(),
                deck: faces.clone(),
            },
        );
        assert_eq!(room.deck.len(), 25);

        room.handle_action(
            &UserId::from("ann"),
            SpyAction::SetCardOptions {
                owner_key: key,
                deck: faces,
            },
        );
        let titles: Vec<&str> = room.deck.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "Beta"]);
        assert_eq!(room.deck[1].id, 2);
    }
}
