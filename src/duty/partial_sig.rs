/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages that carry an operator's partial signature over a decided duty.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    qbft::messages::MessageError,
    types::{
        crypto_primitives::{hash, verify_signature, Keypair},
        data_types::{BlsSignatureBytes, DomainType, Height, MessageID, OperatorID, SignatureBytes},
        share::Share,
        signing::{compute_signing_root, encode, SignatureType},
    },
};

/// An operator's partial signature over the signing root of the duty decided at `height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PartialSignatureMessage {
    pub identifier: MessageID,
    pub height: Height,
    pub partial_signature: BlsSignatureBytes,
    pub signing_root: Vec<u8>,
    pub signer: OperatorID,
}

impl PartialSignatureMessage {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn root(&self) -> [u8; 32] {
        hash(&self.encode())
    }
}

/// A [`PartialSignatureMessage`] authenticated with its signer's operator key.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedPartialSignatureMessage {
    pub message: PartialSignatureMessage,
    pub signature: SignatureBytes,
}

impl SignedPartialSignatureMessage {
    pub fn new(
        keypair: &Keypair,
        domain: DomainType,
        message: PartialSignatureMessage,
    ) -> SignedPartialSignatureMessage {
        let signature = keypair.sign(&signing_root(domain, &message));
        SignedPartialSignatureMessage { message, signature }
    }

    pub fn signer(&self) -> OperatorID {
        self.message.signer
    }

    /// Check that the signer is a committee member and that the operator signature verifies. The BLS
    /// partial signature inside is not checked here.
    pub fn verify(&self, share: &Share) -> Result<(), MessageError> {
        let signer = self.message.signer;
        let operator = share
            .operator(&signer)
            .ok_or(MessageError::UnknownSigner(signer))?;
        verify_signature(
            &operator.verifying_key,
            &signing_root(share.domain_type(), &self.message),
            &self.signature,
        )
        .map_err(|_| MessageError::InvalidSignature(signer))
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<SignedPartialSignatureMessage, MessageError> {
        SignedPartialSignatureMessage::try_from_slice(bytes).map_err(MessageError::Decode)
    }
}

fn signing_root(domain: DomainType, message: &PartialSignatureMessage) -> [u8; 32] {
    compute_signing_root(domain, SignatureType::PartialSignature, &message.root())
}

/// Copy `root`, padding an empty root to a single zero byte.
///
/// Signing and verification routines reject zero-length messages, so roots pass through here before
/// they are signed or compared.
pub fn ensure_root(root: &[u8]) -> Vec<u8> {
    if root.is_empty() {
        vec![0]
    } else {
        root.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::types::{data_types::BlsPublicKeyBytes, share::Operator};

    #[test]
    fn ensure_root_pads_only_empty_roots() {
        assert_eq!(ensure_root(&[]), vec![0]);
        assert_eq!(ensure_root(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn verify_rejects_tampered_messages() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let share = Share::new(
            OperatorID::new(1),
            BlsPublicKeyBytes::new([0; 48]),
            vec![Operator {
                operator_id: OperatorID::new(1),
                verifying_key: keypair.public_bytes(),
                share_pub_key: BlsPublicKeyBytes::new([0; 48]),
            }],
            DomainType::new([0; 4]),
            1,
            1,
        );
        let msg = SignedPartialSignatureMessage::new(
            &keypair,
            share.domain_type(),
            PartialSignatureMessage {
                identifier: MessageID::new(&BlsPublicKeyBytes::new([0; 48]), 0),
                height: Height::new(1),
                partial_signature: BlsSignatureBytes::new([1; 96]),
                signing_root: vec![1, 2, 3],
                signer: OperatorID::new(1),
            },
        );
        assert!(msg.verify(&share).is_ok());

        let decoded = SignedPartialSignatureMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);

        let mut tampered = msg.clone();
        tampered.message.signing_root = vec![9];
        assert!(matches!(
            tampered.verify(&share),
            Err(MessageError::InvalidSignature(_))
        ));

        let mut outsider = msg;
        outsider.message.signer = OperatorID::new(7);
        assert!(matches!(
            outsider.verify(&share),
            Err(MessageError::UnknownSigner(_))
        ));
    }
}
