/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deadline-based round timer.
//!
//! The timer does not run a thread. The owner [`reset`](RoundTimer::reset)s it when a round starts and
//! [`poll`](RoundTimer::poll)s it from its `tick`. A timer is armed for exactly one round at a time, so
//! resetting it for a new round cancels the pending expiry of the old one.

use std::time::{Duration, Instant};

use crate::types::data_types::Round;

/// Rounds after the first last `2^(round - 1)` times the base timeout, up to this exponent.
pub const MAX_BACKOFF_EXPONENT: u64 = 6;

#[derive(Clone, Debug)]
pub struct RoundTimer {
    base_timeout: Duration,
    armed: Option<(Round, Instant)>,
}

impl RoundTimer {
    pub fn new(base_timeout: Duration) -> RoundTimer {
        RoundTimer {
            base_timeout,
            armed: None,
        }
    }

    /// Get how long `round` lasts.
    pub fn timeout_for(&self, round: Round) -> Duration {
        let exponent = round.int().saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as u32;
        self.base_timeout.saturating_mul(2u32.pow(exponent))
    }

    /// Arm the timer for `round`, replacing whatever round it was armed for.
    pub fn reset(&mut self, round: Round, now: Instant) {
        self.armed = Some((round, now + self.timeout_for(round)));
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn armed_round(&self) -> Option<Round> {
        self.armed.map(|(round, _)| round)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(_, deadline)| deadline)
    }

    /// If the deadline has passed at `now`, disarm the timer and return the round it was armed for.
    pub fn poll(&mut self, now: Instant) -> Option<Round> {
        match self.armed {
            Some((round, deadline)) if now >= deadline => {
                self.armed = None;
                Some(round)
            }
            _ => None,
        }
    }
}
