/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between operators as part of the
//! [QBFT](crate::qbft) protocol.
//!
//! A [`Message`] carries the type-independent header (type, height, round, identifier) and a borsh
//! encoded payload whose shape depends on the [`MessageType`]. Operators sign messages into
//! [`SignedMessage`]s, and a quorum of matching commits is aggregated into a [`DecidedMessage`].

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    io,
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::{hash, verify_signature, Keypair},
    data_types::{DomainType, Height, MessageID, OperatorID, Round, SignatureBytes, NO_ROUND},
    share::Share,
    signing::{compute_signing_root, encode, SignatureType},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MessageType {
    Proposal,
    Prepare,
    Commit,
    RoundChange,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Proposal => "Proposal",
            MessageType::Prepare => "Prepare",
            MessageType::Commit => "Commit",
            MessageType::RoundChange => "RoundChange",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub height: Height,
    pub round: Round,
    pub identifier: MessageID,
    pub data: Vec<u8>,
}

impl Message {
    /// Create a `Message` of `msg_type` whose `data` is the encoding of `payload`.
    pub fn new<P: BorshSerialize>(
        msg_type: MessageType,
        height: Height,
        round: Round,
        identifier: MessageID,
        payload: &P,
    ) -> Message {
        Message {
            msg_type,
            height,
            round,
            identifier,
            data: encode(payload),
        }
    }

    /// SHA-256 digest of the message's canonical encoding.
    pub fn root(&self) -> [u8; 32] {
        hash(&encode(self))
    }

    pub fn proposal_data(&self) -> Result<ProposalData, MessageError> {
        self.payload(MessageType::Proposal)
    }

    pub fn prepare_data(&self) -> Result<PrepareData, MessageError> {
        self.payload(MessageType::Prepare)
    }

    pub fn commit_data(&self) -> Result<CommitData, MessageError> {
        self.payload(MessageType::Commit)
    }

    pub fn round_change_data(&self) -> Result<RoundChangeData, MessageError> {
        self.payload(MessageType::RoundChange)
    }

    fn payload<P: BorshDeserialize>(&self, expected: MessageType) -> Result<P, MessageError> {
        if self.msg_type != expected {
            return Err(MessageError::WrongMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        P::try_from_slice(&self.data).map_err(MessageError::Decode)
    }
}

/// Payload of a [`MessageType::Proposal`].
///
/// Proposals for rounds after [`FIRST_ROUND`](crate::types::data_types::FIRST_ROUND) carry the
/// round-change quorum that moved the committee into the round, and, if any member of that quorum had
/// prepared a value, the prepare quorum for the highest prepared value.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalData {
    pub data: Vec<u8>,
    pub round_change_justification: Vec<SignedMessage>,
    pub prepare_justification: Vec<SignedMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrepareData {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitData {
    pub data: Vec<u8>,
}

/// Payload of a [`MessageType::RoundChange`].
///
/// `round_change_justification` is the prepare quorum for `(prepared_round, prepared_value)`, and is
/// empty when `prepared_round` is [`NO_ROUND`].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundChangeData {
    pub prepared_value: Vec<u8>,
    pub prepared_round: Round,
    pub round_change_justification: Vec<SignedMessage>,
}

impl RoundChangeData {
    pub fn has_prepared(&self) -> bool {
        self.prepared_round != NO_ROUND
    }
}

/// A [`Message`] signed by one operator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signer: OperatorID,
    pub signature: SignatureBytes,
}

impl SignedMessage {
    /// Sign `message` as operator `signer` using `keypair`.
    pub fn new(
        keypair: &Keypair,
        signer: OperatorID,
        domain: DomainType,
        message: Message,
    ) -> SignedMessage {
        let signature = keypair.sign(&signing_root(domain, &message));
        SignedMessage {
            message,
            signer,
            signature,
        }
    }

    /// Check that the signer is a member of the `share`'s committee and that the signature verifies
    /// under the share's signature domain.
    pub fn verify(&self, share: &Share) -> Result<(), MessageError> {
        verify_operator_signature(share, &self.signer, &self.message, &self.signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<SignedMessage, MessageError> {
        SignedMessage::try_from_slice(bytes).map_err(MessageError::Decode)
    }
}

/// Evidence that a quorum of operators committed to the value in `message`.
///
/// All commits for the same height, round and value have byte-identical [`Message`]s, so a single
/// message with one signature per committer suffices.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DecidedMessage {
    pub message: Message,
    pub signatures: BTreeMap<OperatorID, SignatureBytes>,
}

impl DecidedMessage {
    /// Aggregate `commits` into a `DecidedMessage`. Commits whose message differs from the first commit's
    /// are skipped. Returns `None` if `commits` is empty.
    pub fn aggregate<'a>(
        commits: impl IntoIterator<Item = &'a SignedMessage>,
    ) -> Option<DecidedMessage> {
        let mut commits = commits.into_iter();
        let first = commits.next()?;
        let mut signatures = BTreeMap::new();
        signatures.insert(first.signer, first.signature);
        for commit in commits {
            if commit.message == first.message {
                signatures.entry(commit.signer).or_insert(commit.signature);
            }
        }
        Some(DecidedMessage {
            message: first.message.clone(),
            signatures,
        })
    }

    pub fn height(&self) -> Height {
        self.message.height
    }

    pub fn signers(&self) -> impl Iterator<Item = &OperatorID> {
        self.signatures.keys()
    }

    /// Get the value that was decided.
    pub fn value(&self) -> Result<Vec<u8>, MessageError> {
        Ok(self.message.commit_data()?.data)
    }

    /// Check that the message is a commit, that its signers form a quorum, and that every signature
    /// verifies.
    pub fn verify(&self, share: &Share) -> Result<(), MessageError> {
        if self.message.msg_type != MessageType::Commit {
            return Err(MessageError::WrongMessageType {
                expected: MessageType::Commit,
                actual: self.message.msg_type,
            });
        }
        if !share.has_quorum(self.signers()) {
            return Err(MessageError::NoQuorum);
        }
        for (signer, signature) in &self.signatures {
            verify_operator_signature(share, signer, &self.message, signature)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<DecidedMessage, MessageError> {
        DecidedMessage::try_from_slice(bytes).map_err(MessageError::Decode)
    }
}

fn signing_root(domain: DomainType, message: &Message) -> [u8; 32] {
    compute_signing_root(domain, SignatureType::Qbft, &message.root())
}

fn verify_operator_signature(
    share: &Share,
    signer: &OperatorID,
    message: &Message,
    signature: &SignatureBytes,
) -> Result<(), MessageError> {
    let operator = share
        .operator(signer)
        .ok_or(MessageError::UnknownSigner(*signer))?;
    verify_signature(
        &operator.verifying_key,
        &signing_root(share.domain_type(), message),
        signature,
    )
    .map_err(|_| MessageError::InvalidSignature(*signer))
}

/// The different ways in which a message can fail to decode or verify.
#[derive(Debug)]
pub enum MessageError {
    Decode(io::Error),
    WrongMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    UnknownSigner(OperatorID),
    InvalidSignature(OperatorID),
    NoQuorum,
}

impl Display for MessageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Decode(err) => write!(f, "could not decode message: {}", err),
            MessageError::WrongMessageType { expected, actual } => {
                write!(f, "expected a {} message, got a {} message", expected, actual)
            }
            MessageError::UnknownSigner(signer) => {
                write!(f, "signer {} is not a committee member", signer)
            }
            MessageError::InvalidSignature(signer) => {
                write!(f, "invalid signature from signer {}", signer)
            }
            MessageError::NoQuorum => f.write_str("signers do not form a quorum"),
        }
    }
}

impl From<io::Error> for MessageError {
    fn from(value: io::Error) -> Self {
        MessageError::Decode(value)
    }
}
