//! A committee of operators with freshly generated operator keys and validator key shares.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use borsh::BorshSerialize;
use ed25519_dalek::SigningKey;
use qbft_rs::{
    networking::Network,
    qbft::{
        config::Config,
        messages::{Message, MessageType, SignedMessage},
    },
    storage::Storage,
    threshold::{self, SecretKeyShare, ShareKeyManager},
    types::{
        crypto_primitives::Keypair,
        data_types::{BlsPublicKeyBytes, DomainType, Height, MessageID, OperatorID, Round},
        share::{quorum_for, Operator, Share},
    },
};
use rand_core::OsRng;

pub(crate) const DOMAIN: DomainType = DomainType::new([0, 0, 0x30, 0x12]);

pub(crate) const ROUND_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct Committee {
    signing_keys: BTreeMap<OperatorID, SigningKey>,
    key_shares: BTreeMap<OperatorID, SecretKeyShare>,
    validator_pub_key: BlsPublicKeyBytes,
    quorum: u64,
    partial_quorum: u64,
}

impl Committee {
    /// Create a committee of operators `1..=n` whose validator key can be reconstructed from any
    /// `partial_quorum` of them.
    pub(crate) fn new(n: u64, partial_quorum: u64) -> Committee {
        let mut csprg = OsRng {};
        let ids: Vec<OperatorID> = (1..=n).map(OperatorID::new).collect();
        let signing_keys = ids
            .iter()
            .map(|id| (*id, SigningKey::generate(&mut csprg)))
            .collect();
        let (validator_pub_key, shares) =
            threshold::deal(OsRng {}, &ids, partial_quorum as usize).unwrap();
        let key_shares = shares
            .into_iter()
            .map(|share| (share.operator_id(), share))
            .collect();

        Committee {
            signing_keys,
            key_shares,
            validator_pub_key,
            quorum: quorum_for(n),
            partial_quorum,
        }
    }

    pub(crate) fn ids(&self) -> Vec<OperatorID> {
        self.signing_keys.keys().copied().collect()
    }

    pub(crate) fn validator_pub_key(&self) -> BlsPublicKeyBytes {
        self.validator_pub_key
    }

    pub(crate) fn signing_key(&self, id: u64) -> SigningKey {
        self.signing_keys[&OperatorID::new(id)].clone()
    }

    pub(crate) fn key_share(&self, id: u64) -> &SecretKeyShare {
        &self.key_shares[&OperatorID::new(id)]
    }

    /// Get the committee descriptor as seen by operator `id`.
    pub(crate) fn share(&self, id: u64) -> Arc<Share> {
        let operators = self
            .signing_keys
            .iter()
            .map(|(operator_id, signing_key)| Operator {
                operator_id: *operator_id,
                verifying_key: signing_key.verifying_key().to_bytes(),
                share_pub_key: self.key_shares[operator_id].public_key(),
            })
            .collect();
        Arc::new(Share::new(
            OperatorID::new(id),
            self.validator_pub_key,
            operators,
            DOMAIN,
            self.quorum,
            self.partial_quorum,
        ))
    }

    pub(crate) fn signer(&self, id: u64) -> Arc<ShareKeyManager> {
        Arc::new(ShareKeyManager::new(
            self.validator_pub_key,
            self.key_share(id).clone(),
            DOMAIN,
        ))
    }

    /// Build the QBFT configuration of operator `id`, accepting every value.
    pub(crate) fn config(
        &self,
        id: u64,
        network: Arc<dyn Network>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Config> {
        Arc::new(
            Config::builder()
                .keypair(self.signing_key(id))
                .share(self.share(id))
                .value_check(|_: &[u8]| Ok(()))
                .network(network)
                .storage(storage)
                .round_timeout(ROUND_TIMEOUT)
                .build(),
        )
    }

    /// Sign a QBFT message as operator `signer`.
    pub(crate) fn sign<P: BorshSerialize>(
        &self,
        signer: u64,
        msg_type: MessageType,
        identifier: &MessageID,
        height: Height,
        round: Round,
        payload: &P,
    ) -> SignedMessage {
        let message = Message::new(msg_type, height, round, identifier.clone(), payload);
        SignedMessage::new(
            &Keypair::new(self.signing_key(signer)),
            OperatorID::new(signer),
            DOMAIN,
            message,
        )
    }
}
