/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Beacon chain duties, the objects operators agree on and sign for them, and the [`BeaconSigner`]
//! trait that signs those objects with an operator's key share.
//!
//! The beacon objects here carry the fields the duty layer needs to agree on and sign them. They are
//! encoded with borsh and hashed with SHA-256 to obtain their object roots.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    qbft::messages::MessageError,
    threshold::ThresholdError,
    types::{
        crypto_primitives::hash,
        data_types::{BlsPublicKeyBytes, BlsSignatureBytes, Slot},
        signing::encode,
    },
};

/// A 32-byte beacon chain root.
pub type Root = [u8; 32];

/// Largest number of validators in one beacon committee.
pub const MAX_VALIDATORS_PER_COMMITTEE: u64 = 2048;

/// The kinds of duty a validator performs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum BeaconRole {
    Attester,
    Aggregator,
    Proposer,
    SyncCommittee,
}

impl BeaconRole {
    /// Get the code that identifies this role in a [`MessageID`](crate::types::data_types::MessageID).
    pub const fn code(&self) -> u32 {
        match self {
            BeaconRole::Attester => 0,
            BeaconRole::Aggregator => 1,
            BeaconRole::Proposer => 2,
            BeaconRole::SyncCommittee => 3,
        }
    }

    pub const fn from_code(code: u32) -> Option<BeaconRole> {
        match code {
            0 => Some(BeaconRole::Attester),
            1 => Some(BeaconRole::Aggregator),
            2 => Some(BeaconRole::Proposer),
            3 => Some(BeaconRole::SyncCommittee),
            _ => None,
        }
    }
}

impl Display for BeaconRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            BeaconRole::Attester => "ATTESTER",
            BeaconRole::Aggregator => "AGGREGATOR",
            BeaconRole::Proposer => "PROPOSER",
            BeaconRole::SyncCommittee => "SYNC_COMMITTEE",
        };
        f.write_str(name)
    }
}

/// A duty assigned to a validator for one slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Duty {
    pub role: BeaconRole,
    pub pub_key: BlsPublicKeyBytes,
    pub slot: Slot,
    pub validator_index: u64,
    pub committee_index: u64,
    pub committee_length: u64,
    pub committees_at_slot: u64,
    pub validator_committee_index: u64,
}

impl Duty {
    /// Check that the duty places its validator inside a committee of a size the beacon chain allows.
    pub fn check_committee_position(&self) -> Result<(), SignerError> {
        check_committee_position(self.committee_length, self.validator_committee_index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub root: Root,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: u64,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

impl AttestationData {
    pub fn root(&self) -> Root {
        hash(&encode(self))
    }
}

/// Attestation data together with a (partial or reconstructed) validator signature over it.
///
/// `aggregation_bits` is a bitlist of `committee_length` bits with only the attesting validator's bit
/// set.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Attestation {
    pub aggregation_bits: Vec<u8>,
    pub data: AttestationData,
    pub signature: BlsSignatureBytes,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: u64,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
}

impl BeaconBlock {
    pub fn root(&self) -> Root {
        hash(&encode(self))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: BlsSignatureBytes,
}

/// The value a committee runs consensus on for one duty: the duty itself and the role-specific object
/// to sign.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ConsensusData {
    pub duty: Duty,
    pub attestation_data: Option<AttestationData>,
    pub block_data: Option<BeaconBlock>,
}

impl ConsensusData {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<ConsensusData, MessageError> {
        ConsensusData::try_from_slice(bytes).map_err(MessageError::Decode)
    }
}

/// Build the aggregation bitlist for the validator at `validator_committee_index` in a committee of
/// `committee_length` validators.
///
/// Fails unless `committee_length` is between 1 and [`MAX_VALIDATORS_PER_COMMITTEE`] and the index lies
/// inside the committee.
pub fn aggregation_bits(
    committee_length: u64,
    validator_committee_index: u64,
) -> Result<Vec<u8>, SignerError> {
    check_committee_position(committee_length, validator_committee_index)?;
    let mut bits = vec![0u8; ((committee_length + 7) / 8) as usize];
    bits[(validator_committee_index / 8) as usize] |= 1 << (validator_committee_index % 8);
    Ok(bits)
}

fn check_committee_position(
    committee_length: u64,
    validator_committee_index: u64,
) -> Result<(), SignerError> {
    if committee_length == 0
        || committee_length > MAX_VALIDATORS_PER_COMMITTEE
        || validator_committee_index >= committee_length
    {
        return Err(SignerError::InvalidCommitteePosition {
            committee_length,
            validator_committee_index,
        });
    }
    Ok(())
}

/// Signs beacon objects with the local operator's share of a validator key.
///
/// Each method returns the object carrying the operator's partial signature, and the signing root the
/// partial signature was made over.
pub trait BeaconSigner: Send + Sync {
    fn sign_attestation(
        &self,
        data: &AttestationData,
        duty: &Duty,
    ) -> Result<(Attestation, Vec<u8>), SignerError>;

    fn sign_beacon_block(
        &self,
        block: &BeaconBlock,
        duty: &Duty,
    ) -> Result<(SignedBeaconBlock, Vec<u8>), SignerError>;

    /// Get the public key of the local operator's key share for `validator_pub_key`.
    fn share_pub_key(&self, validator_pub_key: &BlsPublicKeyBytes) -> Option<BlsPublicKeyBytes>;
}

#[derive(Debug)]
pub enum SignerError {
    UnknownValidator(BlsPublicKeyBytes),
    InvalidCommitteePosition {
        committee_length: u64,
        validator_committee_index: u64,
    },
    Threshold(ThresholdError),
}

impl Display for SignerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SignerError::UnknownValidator(pub_key) => {
                write!(f, "no key share for validator {:?}", pub_key)
            }
            SignerError::InvalidCommitteePosition {
                committee_length,
                validator_committee_index,
            } => write!(
                f,
                "validator index {} is not in a committee of {} validators",
                validator_committee_index, committee_length
            ),
            SignerError::Threshold(err) => write!(f, "threshold signing failed: {}", err),
        }
    }
}

impl From<ThresholdError> for SignerError {
    fn from(value: ThresholdError) -> Self {
        SignerError::Threshold(value)
    }
}
