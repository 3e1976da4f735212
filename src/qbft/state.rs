/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable record of one QBFT instance's progress.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::hash,
    data_types::{Height, MessageID, Round, FIRST_ROUND, NO_ROUND},
    signing::encode,
};

use super::{messages::{MessageError, SignedMessage}, msg_container::MsgContainer};

/// Progress of one instance: where it is (height, round), what it has prepared, what proposal it has
/// accepted in the current round, what it has decided, and every message it has accepted so far.
///
/// The committee [`Share`](crate::types::share::Share) is not part of the state. Instances reach it
/// through their [`Config`](super::config::Config).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct State {
    pub id: MessageID,
    pub round: Round,
    pub height: Height,
    pub last_prepared_round: Round,
    pub last_prepared_value: Option<Vec<u8>>,
    pub proposal_accepted_for_current_round: Option<SignedMessage>,
    pub decided: bool,
    pub decided_value: Option<Vec<u8>>,
    pub propose_container: MsgContainer,
    pub prepare_container: MsgContainer,
    pub commit_container: MsgContainer,
    pub round_change_container: MsgContainer,
}

impl State {
    /// Create the state of a fresh instance at `height`, in [`FIRST_ROUND`] with empty containers.
    pub fn new(id: MessageID, height: Height) -> State {
        State {
            id,
            round: FIRST_ROUND,
            height,
            last_prepared_round: NO_ROUND,
            last_prepared_value: None,
            proposal_accepted_for_current_round: None,
            decided: false,
            decided_value: None,
            propose_container: MsgContainer::new(),
            prepare_container: MsgContainer::new(),
            commit_container: MsgContainer::new(),
            round_change_container: MsgContainer::new(),
        }
    }

    /// Record that a prepare quorum was reached for `value` in `round`.
    ///
    /// The record only moves forward: a quorum for a round not greater than `last_prepared_round` is
    /// ignored. Returns whether the record changed.
    pub(crate) fn record_prepared(&mut self, round: Round, value: &[u8]) -> bool {
        if round <= self.last_prepared_round {
            return false;
        }
        self.last_prepared_round = round;
        self.last_prepared_value = Some(value.to_vec());
        true
    }

    /// Move to `round`, forgetting the proposal accepted in the previous round.
    pub(crate) fn advance_round(&mut self, round: Round) {
        self.round = round;
        self.proposal_accepted_for_current_round = None;
    }

    /// Get the value of the proposal accepted in the current round, if any.
    pub fn accepted_value(&self) -> Result<Option<Vec<u8>>, MessageError> {
        match &self.proposal_accepted_for_current_round {
            Some(proposal) => Ok(Some(proposal.message.proposal_data()?.data)),
            None => Ok(None),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<State, MessageError> {
        State::try_from_slice(bytes).map_err(MessageError::Decode)
    }

    /// Deterministic digest of the state.
    pub fn root(&self) -> [u8; 32] {
        hash(&self.encode())
    }
}
