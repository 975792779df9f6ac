use std::collections::VecDeque;

use crate::room::User;

/// One seat of the turn queue: the participant bound to it plus the
/// game-specific payload the seat carries for the whole match.
#[derive(Debug, Clone)]
pub struct Seat<P> {
    pub number: u8,
    pub user: User,
    pub payload: P,
}

/// Round-robin turn order fixed at match start. The queue head is the
/// current actor; ending a turn moves the head to the tail, nobody is
/// ever skipped.
#[derive(Debug, Clone)]
pub struct TurnQueue<P> {
    seats: VecDeque<Seat<P>>,
}

impl<P> TurnQueue<P> {
    pub fn new(seats: Vec<Seat<P>>) -> Self {
        TurnQueue {
            seats: seats.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    pub fn current(&self) -> Option<&Seat<P>> {
        self.seats.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut Seat<P>> {
        self.seats.front_mut()
    }

    pub fn rotate(&mut self) {
        if let Some(seat) = self.seats.pop_front() {
            self.seats.push_back(seat);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seat<P>> {
        self.seats.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Seat<P>> {
        self.seats.iter_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Seat<P>> {
        self.seats.get_mut(index)
    }

    pub fn position(&self, mut pred: impl FnMut(&Seat<P>) -> bool) -> Option<usize> {
        self.seats.iter().position(|seat| pred(seat))
    }

    /// Reconnection matching: when fewer players are connected than
    /// seats exist, a joiner whose nickname matches an existing seat
    /// may reclaim it. Returns the seat to rebind.
    pub fn rejoin_target(&mut self, connected_players: usize, nickname: &str) -> Option<&mut Seat<P>> {
        if connected_players >= self.seats.len() {
            return None;
        }
        self.seats
            .iter_mut()
            .find(|seat| seat.user.nickname == nickname)
    }
}
