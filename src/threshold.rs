/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Threshold BLS signatures over BLS12-381.
//!
//! A validator's secret key is split with Shamir's scheme: a dealer picks a random polynomial of degree
//! `threshold - 1` whose constant term is the secret, and hands operator `i` the evaluation at `x = i`.
//! Operators sign with their share to produce partial signatures on G2. Any `threshold` partial
//! signatures over the same message combine, through Lagrange interpolation at `x = 0`, into the
//! signature the full secret key would have produced, so the full key is never reconstructed.
//!
//! Public keys live on G1 and signatures on G2, with messages hashed to G2 under the Ethereum
//! proof-of-possession ciphersuite.
//!
//! [`ShareKeyManager`] puts an operator's key share behind the [`BeaconSigner`] trait.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
};

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use group::{ff::Field, Curve, Group};
use rand_core::RngCore;

use crate::{
    duty::{
        beacon::{
            aggregation_bits, Attestation, AttestationData, BeaconBlock, BeaconSigner, Duty,
            SignedBeaconBlock, SignerError,
        },
        partial_sig::ensure_root,
    },
    types::{
        data_types::{BlsPublicKeyBytes, BlsSignatureBytes, DomainType, OperatorID},
        signing::{compute_signing_root, SignatureType},
    },
};

/// Domain separation tag for hashing messages to G2.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// One operator's share of a validator's secret key: the dealer polynomial evaluated at the operator's
/// id.
#[derive(Clone)]
pub struct SecretKeyShare {
    operator_id: OperatorID,
    scalar: Scalar,
}

impl SecretKeyShare {
    /// Restore a key share from its little-endian scalar encoding.
    pub fn from_bytes(operator_id: OperatorID, bytes: &[u8; 32]) -> Result<SecretKeyShare, ThresholdError> {
        let scalar: Option<Scalar> = Scalar::from_bytes_le(bytes).into();
        let scalar = scalar.ok_or(ThresholdError::InvalidSecretKey)?;
        Ok(SecretKeyShare {
            operator_id,
            scalar,
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.scalar.to_bytes_le()
    }

    pub fn operator_id(&self) -> OperatorID {
        self.operator_id
    }

    pub fn public_key(&self) -> BlsPublicKeyBytes {
        public_key_of(&self.scalar)
    }

    /// Produce this share's partial signature over `message`.
    pub fn sign(&self, message: &[u8]) -> BlsSignatureBytes {
        let signature = hash_to_g2(message) * self.scalar;
        BlsSignatureBytes::new(signature.to_affine().to_compressed())
    }
}

/// Split a freshly generated validator key among `operator_ids` so that any `threshold` of them can
/// sign.
///
/// Returns the validator's public key and one [`SecretKeyShare`] per operator, in the order of
/// `operator_ids`.
pub fn deal(
    mut rng: impl RngCore,
    operator_ids: &[OperatorID],
    threshold: usize,
) -> Result<(BlsPublicKeyBytes, Vec<SecretKeyShare>), ThresholdError> {
    if threshold == 0 || threshold > operator_ids.len() {
        return Err(ThresholdError::InsufficientShares {
            needed: threshold,
            got: operator_ids.len(),
        });
    }
    check_operator_ids(operator_ids.iter())?;

    let coefficients: Vec<Scalar> = (0..threshold).map(|_| Scalar::random(&mut rng)).collect();
    let shares = operator_ids
        .iter()
        .map(|operator_id| SecretKeyShare {
            operator_id: *operator_id,
            scalar: evaluate(&coefficients, &Scalar::from(operator_id.int())),
        })
        .collect();

    Ok((public_key_of(&coefficients[0]), shares))
}

/// Check that `signature` is a valid signature of `message` under `public_key`.
///
/// This works for both partial signatures under a share public key and reconstructed signatures
/// under a validator public key.
pub fn verify(
    public_key: &BlsPublicKeyBytes,
    message: &[u8],
    signature: &BlsSignatureBytes,
) -> Result<(), ThresholdError> {
    let public_key = decode_public_key(public_key)?;
    let signature: Option<G2Affine> = G2Affine::from_compressed(&signature.bytes()).into();
    let signature = signature.ok_or(ThresholdError::InvalidSignatureEncoding)?;

    let lhs = pairing(&public_key, &hash_to_g2(message).to_affine());
    let rhs = pairing(&G1Projective::generator().to_affine(), &signature);
    if lhs == rhs {
        Ok(())
    } else {
        Err(ThresholdError::InvalidSignature)
    }
}

/// Combine partial signatures over the same message into the signature of the full key.
///
/// The partials must come from at least `threshold` distinct operators for the result to be valid. The
/// partials themselves are not verified here.
pub fn reconstruct(
    partials: &BTreeMap<OperatorID, BlsSignatureBytes>,
) -> Result<BlsSignatureBytes, ThresholdError> {
    if partials.is_empty() {
        return Err(ThresholdError::InsufficientShares { needed: 1, got: 0 });
    }
    check_operator_ids(partials.keys())?;

    let xs: Vec<Scalar> = partials
        .keys()
        .map(|operator_id| Scalar::from(operator_id.int()))
        .collect();

    let mut signature = G2Projective::identity();
    for (i, (operator_id, partial)) in partials.iter().enumerate() {
        let point: Option<G2Affine> = G2Affine::from_compressed(&partial.bytes()).into();
        let point = point.ok_or(ThresholdError::InvalidPartialSignature(*operator_id))?;
        signature += G2Projective::from(point) * lagrange_at_zero(&xs, i)?;
    }

    Ok(BlsSignatureBytes::new(signature.to_affine().to_compressed()))
}

/// The Lagrange basis polynomial for `xs[i]` evaluated at zero: the product over `j != i` of
/// `xs[j] / (xs[j] - xs[i])`.
fn lagrange_at_zero(xs: &[Scalar], i: usize) -> Result<Scalar, ThresholdError> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for (j, x_j) in xs.iter().enumerate() {
        if j == i {
            continue;
        }
        numerator *= x_j;
        denominator *= *x_j - xs[i];
    }
    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inverse| numerator * inverse)
        .ok_or(ThresholdError::DuplicateOperatorID)
}

fn evaluate(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

fn check_operator_ids<'a>(
    operator_ids: impl Iterator<Item = &'a OperatorID>,
) -> Result<(), ThresholdError> {
    let mut seen = BTreeSet::new();
    for operator_id in operator_ids {
        if operator_id.int() == 0 {
            return Err(ThresholdError::ZeroOperatorID);
        }
        if !seen.insert(operator_id) {
            return Err(ThresholdError::DuplicateOperatorID);
        }
    }
    Ok(())
}

fn hash_to_g2(message: &[u8]) -> G2Projective {
    G2Projective::hash_to_curve(message, DST, &[])
}

fn public_key_of(scalar: &Scalar) -> BlsPublicKeyBytes {
    BlsPublicKeyBytes::new((G1Projective::generator() * scalar).to_affine().to_compressed())
}

fn decode_public_key(public_key: &BlsPublicKeyBytes) -> Result<G1Affine, ThresholdError> {
    let point: Option<G1Affine> = G1Affine::from_compressed(&public_key.bytes()).into();
    point.ok_or(ThresholdError::InvalidPublicKey)
}

/// Holds the local operator's key share of one validator and signs beacon objects with it.
pub struct ShareKeyManager {
    validator_pub_key: BlsPublicKeyBytes,
    key_share: SecretKeyShare,
    domain: DomainType,
}

impl ShareKeyManager {
    pub fn new(
        validator_pub_key: BlsPublicKeyBytes,
        key_share: SecretKeyShare,
        domain: DomainType,
    ) -> ShareKeyManager {
        ShareKeyManager {
            validator_pub_key,
            key_share,
            domain,
        }
    }

    fn check_validator(&self, duty: &Duty) -> Result<(), SignerError> {
        if duty.pub_key != self.validator_pub_key {
            return Err(SignerError::UnknownValidator(duty.pub_key));
        }
        Ok(())
    }
}

impl BeaconSigner for ShareKeyManager {
    fn sign_attestation(
        &self,
        data: &AttestationData,
        duty: &Duty,
    ) -> Result<(Attestation, Vec<u8>), SignerError> {
        self.check_validator(duty)?;
        let root = ensure_root(&compute_signing_root(
            self.domain,
            SignatureType::BeaconAttester,
            &data.root(),
        ));
        let attestation = Attestation {
            aggregation_bits: aggregation_bits(
                duty.committee_length,
                duty.validator_committee_index,
            )?,
            data: data.clone(),
            signature: self.key_share.sign(&root),
        };
        Ok((attestation, root))
    }

    fn sign_beacon_block(
        &self,
        block: &BeaconBlock,
        duty: &Duty,
    ) -> Result<(SignedBeaconBlock, Vec<u8>), SignerError> {
        self.check_validator(duty)?;
        let root = ensure_root(&compute_signing_root(
            self.domain,
            SignatureType::BeaconProposer,
            &block.root(),
        ));
        let signed_block = SignedBeaconBlock {
            message: block.clone(),
            signature: self.key_share.sign(&root),
        };
        Ok((signed_block, root))
    }

    fn share_pub_key(&self, validator_pub_key: &BlsPublicKeyBytes) -> Option<BlsPublicKeyBytes> {
        (validator_pub_key == &self.validator_pub_key).then(|| self.key_share.public_key())
    }
}

#[derive(Debug)]
pub enum ThresholdError {
    InvalidPublicKey,
    InvalidSecretKey,
    InvalidSignatureEncoding,
    InvalidSignature,
    InvalidPartialSignature(OperatorID),
    InsufficientShares { needed: usize, got: usize },
    ZeroOperatorID,
    DuplicateOperatorID,
}

impl Display for ThresholdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdError::InvalidPublicKey => f.write_str("public key is not a valid G1 point"),
            ThresholdError::InvalidSecretKey => f.write_str("secret key is not a valid scalar"),
            ThresholdError::InvalidSignatureEncoding => {
                f.write_str("signature is not a valid G2 point")
            }
            ThresholdError::InvalidSignature => f.write_str("signature does not verify"),
            ThresholdError::InvalidPartialSignature(operator_id) => {
                write!(f, "invalid partial signature from operator {}", operator_id)
            }
            ThresholdError::InsufficientShares { needed, got } => {
                write!(f, "need {} shares, got {}", needed, got)
            }
            ThresholdError::ZeroOperatorID => f.write_str("operator id 0 cannot hold a share"),
            ThresholdError::DuplicateOperatorID => f.write_str("operator ids are not distinct"),
        }
    }
}
