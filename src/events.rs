/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events that the QBFT instances and duty runners emit.
//!
//! An event for a given action indicates that the action has been completed. Components publish events
//! into an optional [`Sender<Event>`]; the [event bus](crate::event_bus) thread receives them and passes
//! them to the registered handlers, and to the default [loggers](crate::logging) if `log_events` is on.

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    duty::beacon::BeaconRole,
    qbft::messages::SignedMessage,
    types::data_types::{BlsSignatureBytes, Height, MessageID, OperatorID, Round, Slot},
};

pub enum Event {
    // Instance life-cycle events.
    StartInstance(StartInstanceEvent),
    StartRound(StartRoundEvent),
    RoundTimeout(RoundTimeoutEvent),
    UpdateLastPrepared(UpdateLastPreparedEvent),
    Decide(DecideEvent),
    // Events that involve broadcasting a QBFT message.
    Propose(ProposeEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    RoundChange(RoundChangeEvent),
    // Events that involve receiving a QBFT message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveCommit(ReceiveCommitEvent),
    ReceiveRoundChange(ReceiveRoundChangeEvent),
    // Duty events.
    StartDuty(StartDutyEvent),
    SignPartial(SignPartialEvent),
    CollectPartialSig(CollectPartialSigEvent),
    ReconstructSignature(ReconstructSignatureEvent),
    SignatureCollectionTimeout(SignatureCollectionTimeoutEvent),
}

impl Event {
    /// Send the event to `event_publisher`, if there is one.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already have been shut down.
            let _ = event_publisher.send(self);
        }
    }
}

pub struct StartInstanceEvent {
    pub timestamp: SystemTime,
    pub identifier: MessageID,
    pub height: Height,
}

pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub leader: OperatorID,
}

pub struct RoundTimeoutEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub timeout: Duration,
}

pub struct UpdateLastPreparedEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub value: Vec<u8>,
}

pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub value: Vec<u8>,
    pub committers: Vec<OperatorID>,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: SignedMessage,
}

pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: SignedMessage,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: SignedMessage,
}

pub struct RoundChangeEvent {
    pub timestamp: SystemTime,
    pub round_change: SignedMessage,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: OperatorID,
    pub proposal: SignedMessage,
}

pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: OperatorID,
    pub prepare: SignedMessage,
}

pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: OperatorID,
    pub commit: SignedMessage,
}

pub struct ReceiveRoundChangeEvent {
    pub timestamp: SystemTime,
    pub origin: OperatorID,
    pub round_change: SignedMessage,
}

pub struct StartDutyEvent {
    pub timestamp: SystemTime,
    pub role: BeaconRole,
    pub slot: Slot,
    pub height: Height,
}

pub struct SignPartialEvent {
    pub timestamp: SystemTime,
    pub role: BeaconRole,
    pub height: Height,
    pub signing_root: Vec<u8>,
}

pub struct CollectPartialSigEvent {
    pub timestamp: SystemTime,
    pub role: BeaconRole,
    pub height: Height,
    pub signer: OperatorID,
}

pub struct ReconstructSignatureEvent {
    pub timestamp: SystemTime,
    pub role: BeaconRole,
    pub height: Height,
    pub signature: BlsSignatureBytes,
}

pub struct SignatureCollectionTimeoutEvent {
    pub timestamp: SystemTime,
    pub role: BeaconRole,
    pub height: Height,
    pub collected: usize,
}
