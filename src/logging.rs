/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the validator's
//! [spec](crate::duty::validator::ValidatorSpec).
//!
//! QBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveCommit](crate::events::ReceiveCommitEvent) is printed:
//!
//! ```text
//! ReceiveCommit, 1701329264, 3, 4, 1, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the id of the operator that sent the commit.
//! - The fourth and fifth values are the height and round of the commit.
//! - The sixth value is the first seven characters of the Base64 encoding of the message root.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::{events::*, qbft::messages::SignedMessage};

// Names of each event in PascalCase for printing:
pub const START_INSTANCE: &str = "StartInstance";
pub const START_ROUND: &str = "StartRound";
pub const ROUND_TIMEOUT: &str = "RoundTimeout";
pub const UPDATE_LAST_PREPARED: &str = "UpdateLastPrepared";
pub const DECIDE: &str = "Decide";

pub const PROPOSE: &str = "Propose";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const ROUND_CHANGE: &str = "RoundChange";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";
pub const RECEIVE_ROUND_CHANGE: &str = "ReceiveRoundChange";

pub const START_DUTY: &str = "StartDuty";
pub const SIGN_PARTIAL: &str = "SignPartial";
pub const COLLECT_PARTIAL_SIG: &str = "CollectPartialSig";
pub const RECONSTRUCT_SIGNATURE: &str = "ReconstructSignature";
pub const SIGNATURE_COLLECTION_TIMEOUT: &str = "SignatureCollectionTimeout";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for Event {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &Event| match event {
            Event::StartInstance(e) => log::info!(
                "{}, {}, {}, {}",
                START_INSTANCE,
                secs_since_unix_epoch(e.timestamp),
                first_seven_base64_chars(e.identifier.bytes()),
                e.height
            ),
            Event::StartRound(e) => log::info!(
                "{}, {}, {}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(e.timestamp),
                e.height,
                e.round,
                e.leader
            ),
            Event::RoundTimeout(e) => log::info!(
                "{}, {}, {}, {}, {}",
                ROUND_TIMEOUT,
                secs_since_unix_epoch(e.timestamp),
                e.height,
                e.round,
                e.timeout.as_millis()
            ),
            Event::UpdateLastPrepared(e) => log::info!(
                "{}, {}, {}, {}, {}",
                UPDATE_LAST_PREPARED,
                secs_since_unix_epoch(e.timestamp),
                e.height,
                e.round,
                first_seven_base64_chars(&e.value)
            ),
            Event::Decide(e) => log::info!(
                "{}, {}, {}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(e.timestamp),
                e.height,
                e.round,
                first_seven_base64_chars(&e.value),
                e.committers.len()
            ),
            Event::Propose(e) => log_sent(PROPOSE, e.timestamp, &e.proposal),
            Event::Prepare(e) => log_sent(PREPARE, e.timestamp, &e.prepare),
            Event::Commit(e) => log_sent(COMMIT, e.timestamp, &e.commit),
            Event::RoundChange(e) => log_sent(ROUND_CHANGE, e.timestamp, &e.round_change),
            Event::ReceiveProposal(e) => log_received(RECEIVE_PROPOSAL, e.timestamp, &e.proposal),
            Event::ReceivePrepare(e) => log_received(RECEIVE_PREPARE, e.timestamp, &e.prepare),
            Event::ReceiveCommit(e) => log_received(RECEIVE_COMMIT, e.timestamp, &e.commit),
            Event::ReceiveRoundChange(e) => {
                log_received(RECEIVE_ROUND_CHANGE, e.timestamp, &e.round_change)
            }
            Event::StartDuty(e) => log::info!(
                "{}, {}, {:?}, {}, {}",
                START_DUTY,
                secs_since_unix_epoch(e.timestamp),
                e.role,
                e.slot,
                e.height
            ),
            Event::SignPartial(e) => log::info!(
                "{}, {}, {:?}, {}, {}",
                SIGN_PARTIAL,
                secs_since_unix_epoch(e.timestamp),
                e.role,
                e.height,
                first_seven_base64_chars(&e.signing_root)
            ),
            Event::CollectPartialSig(e) => log::info!(
                "{}, {}, {:?}, {}, {}",
                COLLECT_PARTIAL_SIG,
                secs_since_unix_epoch(e.timestamp),
                e.role,
                e.height,
                e.signer
            ),
            Event::ReconstructSignature(e) => log::info!(
                "{}, {}, {:?}, {}, {}",
                RECONSTRUCT_SIGNATURE,
                secs_since_unix_epoch(e.timestamp),
                e.role,
                e.height,
                first_seven_base64_chars(&e.signature.bytes())
            ),
            Event::SignatureCollectionTimeout(e) => log::info!(
                "{}, {}, {:?}, {}, {}",
                SIGNATURE_COLLECTION_TIMEOUT,
                secs_since_unix_epoch(e.timestamp),
                e.role,
                e.height,
                e.collected
            ),
        };
        Box::new(logger)
    }
}

fn log_sent(name: &str, timestamp: SystemTime, msg: &SignedMessage) {
    log::info!(
        "{}, {}, {}, {}, {}",
        name,
        secs_since_unix_epoch(timestamp),
        msg.message.height,
        msg.message.round,
        first_seven_base64_chars(&msg.message.root())
    )
}

fn log_received(name: &str, timestamp: SystemTime, msg: &SignedMessage) {
    log::info!(
        "{}, {}, {}, {}, {}, {}",
        name,
        secs_since_unix_epoch(timestamp),
        msg.signer,
        msg.message.height,
        msg.message.round,
        first_seven_base64_chars(&msg.message.root())
    )
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
