/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of one QBFT instance.
//!
//! Main type: [`Instance`].

use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::{Instant, SystemTime},
};

use crate::{
    events::{
        CommitEvent, DecideEvent, Event, PrepareEvent, ProposeEvent, RoundChangeEvent,
        StartInstanceEvent, StartRoundEvent,
    },
    storage::StorageError,
    types::{
        data_types::{Height, MessageID, OperatorID, Round, FIRST_ROUND, NO_ROUND},
        share::Share,
    },
};

use super::{
    commit::upon_commit,
    config::Config,
    messages::{DecidedMessage, MessageError, MessageType, SignedMessage},
    prepare::upon_prepare,
    proposal::{create_proposal, upon_proposal},
    roles::{is_leader, select_leader},
    round_change::{upon_round_change, upon_round_timeout},
    state::State,
    timer::RoundTimer,
};

/// A single operator's participation in deciding one [`Height`].
///
/// # Usage
///
/// `Instance` is meant to be used in an "event-oriented" fashion. After [`start`](Self::start), the
/// owner calls:
/// 1. [`process_msg`](Self::process_msg) for every QBFT message received from the network, and
/// 2. [`tick`](Self::tick) regularly, so that the round timer can fire.
///
/// Both return the [`Decided`] outcome on the call that completes a commit quorum. Once decided, the
/// instance ignores every further message and timer expiry.
///
/// Messages the instance itself creates are broadcast through the [`Network`](crate::networking::Network)
/// in its [`Config`] and then processed locally through the same handlers, in creation order.
pub struct Instance {
    pub(super) config: Arc<Config>,
    pub(super) state: State,
    pub(super) start_value: Vec<u8>,
    pub(super) timer: RoundTimer,
    /// Highest round this operator has broadcast a round change for, or `NO_ROUND`.
    pub(super) round_change_round: Round,
    pub(super) outbox: VecDeque<SignedMessage>,
    pub(super) decided: Option<Decided>,
}

/// The outcome of a decided instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decided {
    pub value: Vec<u8>,
    pub round: Round,
    pub decided_message: DecidedMessage,
}

impl Decided {
    pub fn height(&self) -> Height {
        self.decided_message.height()
    }

    pub fn committers(&self) -> Vec<OperatorID> {
        self.decided_message.signers().copied().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Running(Round),
    Decided {
        value: Vec<u8>,
        round: Round,
        committers: Vec<OperatorID>,
    },
}

impl Instance {
    pub fn new(
        config: Arc<Config>,
        identifier: MessageID,
        height: Height,
        start_value: Vec<u8>,
    ) -> Instance {
        let timer = RoundTimer::new(config.round_timeout);
        Instance {
            config,
            state: State::new(identifier, height),
            start_value,
            timer,
            round_change_round: NO_ROUND,
            outbox: VecDeque::new(),
            decided: None,
        }
    }

    /// Start the first round: arm the round timer, and propose the start value if this operator is the
    /// first round's leader.
    pub fn start(&mut self, now: Instant) -> Result<Option<Decided>, QbftError> {
        Event::StartInstance(StartInstanceEvent {
            timestamp: SystemTime::now(),
            identifier: self.state.id.clone(),
            height: self.state.height,
        })
        .publish(&self.config.event_publisher);

        self.start_round(FIRST_ROUND, now);
        if is_leader(&self.me(), self.state.height, FIRST_ROUND, self.share()) {
            let proposal = create_proposal(
                self,
                FIRST_ROUND,
                self.start_value.clone(),
                Vec::new(),
                Vec::new(),
            );
            self.outbox.push_back(proposal);
        }
        self.flush_outbox()
    }

    /// Process a QBFT message received from the network.
    ///
    /// Messages for another duty stream or height, from non-members, or with invalid signatures are
    /// rejected before any handler runs. A rejected message never changes the instance's state.
    pub fn process_msg(&mut self, msg: SignedMessage) -> Result<Option<Decided>, QbftError> {
        if self.decided.is_some() {
            return Ok(None);
        }
        self.check_envelope(&msg)?;
        let decided = self.handle(msg)?;
        let flushed = self.flush_outbox()?;
        Ok(decided.or(flushed))
    }

    /// Fire the round timer if its deadline passed at `now`, broadcasting a round change.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Decided>, QbftError> {
        if self.decided.is_some() {
            return Ok(None);
        }
        if let Some(timed_out_round) = self.timer.poll(now) {
            upon_round_timeout(self, timed_out_round, now);
        }
        self.flush_outbox()
    }

    /// Mark the instance as decided on the strength of a verified `decided_message` obtained out of
    /// band, e.g., from a peer that decided first.
    pub(crate) fn force_decide(
        &mut self,
        decided_message: DecidedMessage,
    ) -> Result<Option<Decided>, QbftError> {
        if self.decided.is_some() {
            return Ok(None);
        }
        let value = decided_message.value()?;
        let round = decided_message.message.round;
        Ok(Some(self.decide(value, round, decided_message)))
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn height(&self) -> Height {
        self.state.height
    }

    pub fn round(&self) -> Round {
        self.state.round
    }

    pub fn identifier(&self) -> &MessageID {
        &self.state.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn timer(&self) -> &RoundTimer {
        &self.timer
    }

    /// Get whether the instance decided, and if so, on which value.
    pub fn is_decided(&self) -> (bool, Option<&[u8]>) {
        match &self.decided {
            Some(decided) => (true, Some(&decided.value)),
            None => (false, None),
        }
    }

    pub fn decided(&self) -> Option<&Decided> {
        self.decided.as_ref()
    }

    pub fn status(&self) -> InstanceStatus {
        match &self.decided {
            Some(decided) => InstanceStatus::Decided {
                value: decided.value.clone(),
                round: decided.round,
                committers: decided.committers(),
            },
            None => InstanceStatus::Running(self.state.round),
        }
    }

    pub(super) fn share(&self) -> &Share {
        &self.config.share
    }

    pub(super) fn me(&self) -> OperatorID {
        self.config.share.operator_id()
    }

    /// Move into `round`: forget the previous round's proposal, re-arm the timer for the new round and
    /// drop any round change request the new round supersedes.
    pub(super) fn start_round(&mut self, round: Round, now: Instant) {
        self.state.advance_round(round);
        if self.round_change_round <= round {
            self.round_change_round = NO_ROUND;
        }
        self.timer.reset(round, now);

        if let Some(leader) = select_leader(self.state.height, round, self.share()) {
            Event::StartRound(StartRoundEvent {
                timestamp: SystemTime::now(),
                height: self.state.height,
                round,
                leader,
            })
            .publish(&self.config.event_publisher);
        }
    }

    pub(super) fn decide(
        &mut self,
        value: Vec<u8>,
        round: Round,
        decided_message: DecidedMessage,
    ) -> Decided {
        self.state.decided = true;
        self.state.decided_value = Some(value.clone());
        self.timer.cancel();

        let decided = Decided {
            value,
            round,
            decided_message,
        };
        Event::Decide(DecideEvent {
            timestamp: SystemTime::now(),
            height: self.state.height,
            round,
            value: decided.value.clone(),
            committers: decided.committers(),
        })
        .publish(&self.config.event_publisher);

        self.decided = Some(decided.clone());
        decided
    }

    fn check_envelope(&self, msg: &SignedMessage) -> Result<(), QbftError> {
        if msg.message.identifier != self.state.id {
            return Err(QbftError::WrongIdentifier);
        }
        if msg.message.height != self.state.height {
            return Err(QbftError::WrongHeight {
                expected: self.state.height,
                actual: msg.message.height,
            });
        }
        msg.verify(self.share())?;
        Ok(())
    }

    fn handle(&mut self, msg: SignedMessage) -> Result<Option<Decided>, QbftError> {
        let now = Instant::now();
        match msg.message.msg_type {
            MessageType::Proposal => upon_proposal(self, msg, now).map(|_| None),
            MessageType::Prepare => upon_prepare(self, msg).map(|_| None),
            MessageType::Commit => upon_commit(self, msg),
            MessageType::RoundChange => upon_round_change(self, msg, now).map(|_| None),
        }
    }

    /// Broadcast and locally process every message in the outbox, including messages that processing
    /// adds to the outbox.
    fn flush_outbox(&mut self) -> Result<Option<Decided>, QbftError> {
        let mut decided = None;
        while let Some(msg) = self.outbox.pop_front() {
            self.config.network.broadcast(msg.clone().into());
            self.publish_sent(&msg);

            if self.decided.is_some() {
                continue;
            }
            match self.handle(msg) {
                Ok(Some(outcome)) => decided = Some(outcome),
                Ok(None) => (),
                Err(err) => log::warn!("could not process own message: {}", err),
            }
        }
        Ok(decided)
    }

    fn publish_sent(&self, msg: &SignedMessage) {
        let timestamp = SystemTime::now();
        let event = match msg.message.msg_type {
            MessageType::Proposal => Event::Propose(ProposeEvent {
                timestamp,
                proposal: msg.clone(),
            }),
            MessageType::Prepare => Event::Prepare(PrepareEvent {
                timestamp,
                prepare: msg.clone(),
            }),
            MessageType::Commit => Event::Commit(CommitEvent {
                timestamp,
                commit: msg.clone(),
            }),
            MessageType::RoundChange => Event::RoundChange(RoundChangeEvent {
                timestamp,
                round_change: msg.clone(),
            }),
        };
        event.publish(&self.config.event_publisher);
    }
}

/// The different ways a call to a method of an [`Instance`] or a
/// [`Controller`](super::controller::Controller) can fail.
#[derive(Debug)]
pub enum QbftError {
    // Validation errors.
    WrongIdentifier,
    WrongHeight { expected: Height, actual: Height },
    WrongRound { expected: Round, actual: Round },
    NotLeader { round: Round, signer: OperatorID },
    InvalidValue(String),
    DataMismatch,
    ProposalAlreadyAccepted(Round),
    InvalidJustification(&'static str),
    Message(MessageError),
    // Protocol-state errors.
    NoProposalForRound(Round),
    InstanceAlreadyRunning(Height),
    UnknownHeight(Height),
    Storage(StorageError),
}

impl Display for QbftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            QbftError::WrongIdentifier => f.write_str("message identifier does not match instance"),
            QbftError::WrongHeight { expected, actual } => {
                write!(f, "wrong height: expected {}, got {}", expected, actual)
            }
            QbftError::WrongRound { expected, actual } => {
                write!(f, "wrong round: expected {}, got {}", expected, actual)
            }
            QbftError::NotLeader { round, signer } => {
                write!(f, "operator {} is not the leader of round {}", signer, round)
            }
            QbftError::InvalidValue(reason) => write!(f, "proposed value is invalid: {}", reason),
            QbftError::DataMismatch => f.write_str("message data differs from accepted proposal data"),
            QbftError::ProposalAlreadyAccepted(round) => {
                write!(f, "a proposal was already accepted for round {}", round)
            }
            QbftError::InvalidJustification(reason) => {
                write!(f, "invalid justification: {}", reason)
            }
            QbftError::Message(err) => write!(f, "invalid message: {}", err),
            QbftError::NoProposalForRound(round) => {
                write!(f, "did not receive proposal for round {}", round)
            }
            QbftError::InstanceAlreadyRunning(height) => {
                write!(f, "instance for height {} is still running", height)
            }
            QbftError::UnknownHeight(height) => write!(f, "no instance for height {}", height),
            QbftError::Storage(err) => write!(f, "could not persist decided value: {}", err),
        }
    }
}

impl From<MessageError> for QbftError {
    fn from(value: MessageError) -> Self {
        QbftError::Message(value)
    }
}

impl From<StorageError> for QbftError {
    fn from(value: StorageError) -> Self {
        QbftError::Storage(value)
    }
}
