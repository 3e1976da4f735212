/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-round collection of signed messages of one [`MessageType`](super::messages::MessageType).

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{Height, OperatorID, Round};

use super::messages::SignedMessage;

/// Signed messages keyed by round, holding at most one message per signer per round.
///
/// The container does not evaluate quorums. Callers select the messages they care about and ask the
/// [`Share`](crate::types::share::Share) whether their signers form a quorum.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MsgContainer {
    msgs: BTreeMap<Round, Vec<SignedMessage>>,
}

impl MsgContainer {
    pub fn new() -> MsgContainer {
        MsgContainer {
            msgs: BTreeMap::new(),
        }
    }

    /// Add `msg` unless a message from the same signer for the same round is already stored.
    ///
    /// Returns whether the message was added.
    pub fn add_if_doesnt_exist(&mut self, msg: &SignedMessage) -> bool {
        let round_msgs = self.msgs.entry(msg.message.round).or_default();
        if round_msgs.iter().any(|stored| stored.signer == msg.signer) {
            return false;
        }
        round_msgs.push(msg.clone());
        true
    }

    /// Get every stored message for `height` and `round`, in insertion order.
    pub fn messages_for_height_and_round(&self, height: Height, round: Round) -> Vec<&SignedMessage> {
        self.msgs
            .get(&round)
            .map(|round_msgs| {
                round_msgs
                    .iter()
                    .filter(|msg| msg.message.height == height)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the stored messages for `height` and `round` whose payload satisfies `filter`.
    pub fn messages_for_height_and_round_where(
        &self,
        height: Height,
        round: Round,
        filter: impl Fn(&SignedMessage) -> bool,
    ) -> Vec<&SignedMessage> {
        self.messages_for_height_and_round(height, round)
            .into_iter()
            .filter(|msg| filter(msg))
            .collect()
    }

    /// Get every stored message for `height` in a round strictly greater than `round`.
    pub fn messages_for_height_above_round(&self, height: Height, round: Round) -> Vec<&SignedMessage> {
        self.msgs
            .range((std::ops::Bound::Excluded(round), std::ops::Bound::Unbounded))
            .flat_map(|(_, round_msgs)| round_msgs.iter())
            .filter(|msg| msg.message.height == height)
            .collect()
    }

    /// Check whether `signer` has a message stored for `round`.
    pub fn has_message_from(&self, round: Round, signer: &OperatorID) -> bool {
        self.msgs
            .get(&round)
            .is_some_and(|round_msgs| round_msgs.iter().any(|msg| &msg.signer == signer))
    }

    /// Get the number of messages stored across all rounds.
    pub fn len(&self) -> usize {
        self.msgs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
