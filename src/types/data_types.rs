/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number of the consensus decision slot that a QBFT instance decides on.
///
/// A duty stream decides exactly one value per height. Heights start at [`FIRST_HEIGHT`] and never
/// decrease within a [`Controller`](crate::qbft::controller::Controller).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Height(u64);

/// Height of the first instance started by a `Controller`.
pub const FIRST_HEIGHT: Height = Height::new(1);

impl Height {
    /// Create a new `Height` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Height`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Height {
    type Output = Height;
    fn add(self, rhs: u64) -> Self::Output {
        Height::new(self.0 + rhs)
    }
}

/// An attempt at deciding a value within a single [`Height`].
///
/// Rounds start at [`FIRST_ROUND`]. [`NO_ROUND`] is a sentinel that means "no round recorded yet", and
/// is what e.g., `last_prepared_round` holds before the first prepare quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Round(u64);

/// Sentinel round value meaning "none".
pub const NO_ROUND: Round = Round::new(0);

/// The round every instance starts in.
pub const FIRST_ROUND: Round = Round::new(1);

impl Round {
    /// Create a new `Round` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Round`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Round {
    type Output = Round;
    fn add(self, rhs: u64) -> Self::Output {
        Round::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for Round {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Identifier of an operator (committee member).
///
/// Operator ids are non-zero. Besides identifying the signer of a message, an operator's id is the
/// x-coordinate of its key share in the [threshold scheme](crate::threshold).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct OperatorID(u64);

impl OperatorID {
    /// Create a new `OperatorID` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `OperatorID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for OperatorID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Beacon chain slot number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Slot(u64);

impl Slot {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Slot {
    type Output = Slot;
    fn add(self, rhs: u64) -> Self::Output {
        Slot::new(self.0.saturating_add(rhs))
    }
}

/// Four bytes that separate signatures made for one network (or fork) from signatures made for another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct DomainType([u8; 4]);

impl DomainType {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

/// An ed25519 signature created by an operator over a QBFT or partial-signature message.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({:02x?}..)", &self.0[..4])
    }
}

/// The 32 bytes of an operator's ed25519 verifying key, as stored in a [`Share`](super::share::Share).
pub type VerifyingKeyBytes = [u8; 32];

/// A compressed BLS12-381 G1 public key: either a validator's full public key, or one operator's share
/// of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlsPublicKeyBytes([u8; 48]);

impl BlsPublicKeyBytes {
    pub const fn new(bytes: [u8; 48]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 48] {
        self.0
    }
}

impl Debug for BlsPublicKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKeyBytes({:02x?}..)", &self.0[..4])
    }
}

/// A compressed BLS12-381 G2 signature: either a partial signature made with a key share, or a full
/// signature reconstructed from a quorum of partials.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlsSignatureBytes([u8; 96]);

impl BlsSignatureBytes {
    pub const fn new(bytes: [u8; 96]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 96] {
        self.0
    }
}

impl Debug for BlsSignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignatureBytes({:02x?}..)", &self.0[..4])
    }
}

/// Identifies one duty stream: the pair of a validator and a [beacon role](crate::duty::beacon::BeaconRole).
///
/// The identifier is the 48-byte validator public key followed by the role code in big-endian, and is
/// what every QBFT message and every instance [`State`](crate::qbft::state::State) carries as its
/// identifier.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct MessageID(Vec<u8>);

impl MessageID {
    pub fn new(validator_pk: &BlsPublicKeyBytes, role_code: u32) -> Self {
        let mut bytes = validator_pk.bytes().to_vec();
        bytes.extend_from_slice(&role_code.to_be_bytes());
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the role code encoded at the end of this identifier, if the identifier is well-formed.
    pub fn role_code(&self) -> Option<u32> {
        if self.0.len() != 52 {
            return None;
        }
        let mut code = [0u8; 4];
        code.copy_from_slice(&self.0[48..]);
        Some(u32::from_be_bytes(code))
    }
}

impl From<Vec<u8>> for MessageID {
    fn from(value: Vec<u8>) -> Self {
        MessageID(value)
    }
}

impl Debug for MessageID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageID({:02x?})", &self.0[..self.0.len().min(6)])
    }
}
