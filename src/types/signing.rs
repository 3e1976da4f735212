/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Canonical encoding and domain-separated signing roots.
//!
//! Every signature in the crate, whether an operator's ed25519 signature over a QBFT message or a BLS
//! partial signature over a beacon object, is made over a signing root computed by
//! [`compute_signing_root`]. Mixing the [`DomainType`] and [`SignatureType`] into the root keeps a
//! signature made for one purpose from being replayed for another.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{crypto_primitives::hash, data_types::DomainType};

/// What a signature is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SignatureType {
    /// An operator's signature over a QBFT [`Message`](crate::qbft::messages::Message).
    Qbft,
    /// An operator's signature over a
    /// [`PartialSignatureMessage`](crate::duty::partial_sig::PartialSignatureMessage).
    PartialSignature,
    /// A (partial) validator signature over attestation data.
    BeaconAttester,
    /// A (partial) validator signature over a beacon block.
    BeaconProposer,
}

/// Serialize `value` into its canonical borsh encoding.
///
/// Serializing into a `Vec` only fails for collections longer than `u32::MAX`, which the types in this
/// crate never hold.
pub(crate) fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    let _ = value.serialize(&mut bytes);
    bytes
}

/// Compute the root that is signed to attest to `object_root` under `domain` for `signature_type`.
pub fn compute_signing_root(
    domain: DomainType,
    signature_type: SignatureType,
    object_root: &[u8],
) -> [u8; 32] {
    hash(&encode(&(domain, signature_type, object_root.to_vec())))
}
