/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer networking and the messages sent over it.
//!
//! The library user provides an implementation of [`Network`]. Sends are fire-and-forget: delivery is
//! not guaranteed, and every handler in the crate tolerates duplicated and reordered delivery.
//! `broadcast` is expected to reach every other member of the committee, but not the sender itself;
//! instances process their own messages locally.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    duty::partial_sig::SignedPartialSignatureMessage,
    qbft::messages::{DecidedMessage, SignedMessage},
    types::{data_types::MessageID, signing::encode},
};

pub trait Network: Send + Sync {
    /// Send `message` to every other member of the committee.
    fn broadcast(&self, message: Message);

    /// Send a `decided` message to every other member of the committee, and to any other party
    /// following the duty stream.
    fn broadcast_decided(&self, decided: DecidedMessage);
}

/// All message variants sent between operators.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Consensus(SignedMessage),
    Decided(DecidedMessage),
    PartialSignature(SignedPartialSignatureMessage),
}

impl Message {
    /// Get the identifier of the duty stream the message belongs to.
    pub fn identifier(&self) -> &MessageID {
        match self {
            Message::Consensus(msg) => &msg.message.identifier,
            Message::Decided(decided) => &decided.message.identifier,
            Message::PartialSignature(msg) => &msg.message.identifier,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> std::io::Result<Message> {
        Message::try_from_slice(bytes)
    }
}

impl From<SignedMessage> for Message {
    fn from(value: SignedMessage) -> Self {
        Message::Consensus(value)
    }
}

impl From<DecidedMessage> for Message {
    fn from(value: DecidedMessage) -> Self {
        Message::Decided(value)
    }
}

impl From<SignedPartialSignatureMessage> for Message {
    fn from(value: SignedPartialSignatureMessage) -> Self {
        Message::PartialSignature(value)
    }
}
