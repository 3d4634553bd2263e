//! Interrupt escalation bookkeeping.
//!
//! Each revocation (or demotion) episode gets a fresh generation number and a
//! periodic retransmit timer. Ticks carry the generation so a tick raced past
//! a cancellation is recognized as stale. Once the attempt count reaches the
//! configured limit the episode expires and unresponsive holders are treated
//! as dead.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock::{self, TimerHandle};

/// Verdict for a retransmit tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickVerdict {
    /// The tick belongs to a cancelled or superseded episode.
    Stale,
    /// Redeliver the interrupt to all unacknowledged holders.
    Redeliver,
    /// The attempt limit is reached; declare remaining holders dead.
    Expire,
}

/// Escalation state for the coordinator's current revocation episode.
#[derive(Debug, Default)]
pub struct InterruptEpisode {
    generation: u64,
    attempts: u32,
    timer: Option<TimerHandle>,
}

impl InterruptEpisode {
    /// Creates an idle episode tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the current (or most recent) episode.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while a retransmit timer is armed.
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Starts a new episode: bumps the generation, counts the initial
    /// delivery as attempt one, and arms the retransmit timer. Any previous
    /// timer is cancelled by replacement.
    pub fn arm<T, F>(&mut self, interval: Duration, tx: mpsc::Sender<T>, make_msg: F) -> u64
    where
        T: Send + 'static,
        F: Fn(u64) -> T + Send + 'static,
    {
        self.generation += 1;
        self.attempts = 1;
        let generation = self.generation;
        self.timer = Some(clock::periodic(interval, tx, move || make_msg(generation)));
        generation
    }

    /// Ends the episode. Stale ticks from the cancelled timer are discarded
    /// by the generation bump. Idempotent.
    pub fn cancel(&mut self) {
        if self.timer.take().is_some() {
            self.generation += 1;
            self.attempts = 0;
        }
    }

    /// Classifies a tick that arrived carrying `generation`.
    pub fn tick(&mut self, generation: u64, limit: u32) -> TickVerdict {
        if self.timer.is_none() || generation != self.generation {
            return TickVerdict::Stale;
        }
        if self.attempts >= limit {
            TickVerdict::Expire
        } else {
            self.attempts += 1;
            TickVerdict::Redeliver
        }
    }
}
