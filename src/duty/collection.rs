/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded-time collection of post-consensus partial signatures.

use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Mutex,
    },
    time::{Duration, Instant, SystemTime},
};

use crate::events::{Event, SignatureCollectionTimeoutEvent};

use super::{
    partial_sig::SignedPartialSignatureMessage,
    runner::{DutyError, DutyRunner, SignedDuty},
};

/// Feed partial signatures from `partial_sigs` into `runner` until its current duty has a partial
/// quorum, then reconstruct the signed duty.
///
/// Waits at most `timeout`. The runner is locked once per received message and never across a wait,
/// so QBFT messages for the runner can be processed concurrently. Partial signatures the runner rejects
/// are logged and skipped.
pub fn collect_post_consensus_sigs(
    runner: &Mutex<DutyRunner>,
    partial_sigs: &Receiver<SignedPartialSignatureMessage>,
    timeout: Duration,
) -> Result<SignedDuty, DutyError> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
            let has_quorum = runner
                .duty_execution_state()
                .is_some_and(|state| state.has_post_consensus_sig_quorum());
            if has_quorum {
                return runner.reconstruct_signed_duty();
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(on_timeout(runner)?);
        }

        match partial_sigs.recv_timeout(remaining) {
            Ok(msg) => {
                let mut runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
                if let Err(err) = runner.process_partial_sig_msg(&msg) {
                    log::warn!(
                        "dropping partial signature from operator {}: {}",
                        msg.signer(),
                        err
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return Err(DutyError::CollectionChannelClosed),
        }
    }
}

fn on_timeout(runner: &Mutex<DutyRunner>) -> Result<DutyError, DutyError> {
    let runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
    let (height, collected) = match runner.duty_execution_state() {
        Some(state) => (state.height(), state.collected_partial_sigs().len()),
        None => return Ok(DutyError::NoRunningDuty),
    };

    Event::SignatureCollectionTimeout(SignatureCollectionTimeoutEvent {
        timestamp: SystemTime::now(),
        role: runner.role(),
        height,
        collected,
    })
    .publish(&runner.controller().config().event_publisher);

    Ok(DutyError::SignatureCollectionTimeout { collected })
}
