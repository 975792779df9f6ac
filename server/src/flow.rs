use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Slack added on top of the displayed countdown so the timeout never
/// lands before the visible timer reaches zero.
pub const GRACE: Duration = Duration::from_secs(1);

/// Posted into the owning service loop when an armed countdown
/// expires. The room is looked up by id at that point; a stale epoch
/// or a deleted room simply discards the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub room_id: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub max_seconds: u64,
    pub current_seconds: u64,
}

enum FlowState {
    Idle,
    Armed {
        task: JoinHandle<()>,
        armed_at: Instant,
        window: Duration,
        nominal: Duration,
    },
    Paused {
        remaining: Duration,
        nominal: Duration,
    },
}

/// A pausable single-shot countdown, one per room. At most one action
/// is armed at a time; arming replaces whatever was pending.
///
/// Every arm/pause/stop bumps the epoch, so a fire message that raced
/// its own cancellation through the channel is rejected by
/// [`Flow::matches`]. Dropping a Flow does not cancel the sleep task;
/// rooms call [`Flow::stop`] from their delete hook instead, and an
/// orphaned fire is neutralized by the room lookup failing.
pub struct Flow {
    room_id: String,
    tx: mpsc::UnboundedSender<TimerFired>,
    epoch: u64,
    state: FlowState,
}

impl Flow {
    pub fn new(room_id: String, tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Flow {
            room_id,
            tx,
            epoch: 0,
            state: FlowState::Idle,
        }
    }

    /// True while a countdown is live (armed and not paused).
    pub fn is_armed(&self) -> bool {
        matches!(self.state, FlowState::Armed { .. })
    }

    /// True iff a fire message with this epoch is the currently armed
    /// countdown expiring.
    pub fn matches(&self, epoch: u64) -> bool {
        self.is_armed() && epoch == self.epoch
    }

    /// Arm the countdown for `seconds`, replacing any pending one.
    /// The sleep runs for `seconds + GRACE`; the snapshot arithmetic
    /// uses the nominal duration only.
    pub fn arm(&mut self, seconds: u64) {
        self.abort_task();
        self.epoch += 1;
        let duration = Duration::from_secs(seconds);
        let task = spawn_fire(
            self.tx.clone(),
            self.room_id.clone(),
            self.epoch,
            duration + GRACE,
        );
        self.state = FlowState::Armed {
            task,
            armed_at: Instant::now(),
            window: duration,
            nominal: duration,
        };
    }

    /// Freeze the countdown, retaining the remaining time for a later
    /// resume. No-op unless armed, so a repeated pause cannot destroy
    /// the frozen remainder.
    pub fn pause(&mut self) {
        if !self.is_armed() {
            return;
        }
        if let FlowState::Armed {
            task,
            armed_at,
            window,
            nominal,
        } = std::mem::replace(&mut self.state, FlowState::Idle)
        {
            task.abort();
            self.epoch += 1;
            let remaining = window.saturating_sub(armed_at.elapsed());
            debug!(room = %self.room_id, ?remaining, "countdown paused");
            self.state = FlowState::Paused { remaining, nominal };
        }
    }

    /// Re-arm a paused countdown for exactly the frozen remainder.
    /// Grace is not re-added; it was part of the original sleep.
    /// No-op unless paused.
    pub fn resume(&mut self) {
        if !matches!(self.state, FlowState::Paused { .. }) {
            return;
        }
        if let FlowState::Paused { remaining, nominal } =
            std::mem::replace(&mut self.state, FlowState::Idle)
        {
            self.epoch += 1;
            let task = spawn_fire(self.tx.clone(), self.room_id.clone(), self.epoch, remaining);
            debug!(room = %self.room_id, ?remaining, "countdown resumed");
            self.state = FlowState::Armed {
                task,
                armed_at: Instant::now(),
                window: remaining,
                nominal,
            };
        }
    }

    /// Cancel unconditionally and clear any frozen remainder.
    pub fn stop(&mut self) {
        self.abort_task();
        self.epoch += 1;
        self.state = FlowState::Idle;
    }

    /// Current timer reading: live while armed, frozen while paused,
    /// None when nothing was ever armed (or after stop).
    pub fn snapshot(&self) -> Option<TimerSnapshot> {
        match &self.state {
            FlowState::Idle => None,
            FlowState::Armed {
                armed_at,
                window,
                nominal,
                ..
            } => Some(TimerSnapshot {
                max_seconds: round_secs(*nominal),
                current_seconds: round_secs(window.saturating_sub(armed_at.elapsed())),
            }),
            FlowState::Paused { remaining, nominal } => Some(TimerSnapshot {
                max_seconds: round_secs(*nominal),
                current_seconds: round_secs(*remaining),
            }),
        }
    }

    fn abort_task(&mut self) {
        if let FlowState::Armed { task, .. } = &self.state {
            task.abort();
        }
    }
}

fn spawn_fire(
    tx: mpsc::UnboundedSender<TimerFired>,
    room_id: String,
    epoch: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(TimerFired { room_id, epoch });
    })
}

fn round_secs(duration: Duration) -> u64 {
    duration.as_secs_f64().round() as u64
}
