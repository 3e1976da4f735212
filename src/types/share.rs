/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The committee descriptor shared by every instance and runner of one validator.
//!
//! A [`Share`] is constructed once per validator and never mutated afterwards. Components that need it
//! hold an `Arc<Share>`.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{BlsPublicKeyBytes, DomainType, OperatorID, VerifyingKeyBytes};

/// A member of a validator's committee.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Operator {
    pub operator_id: OperatorID,
    /// Verifying key used to check the operator's QBFT and partial-signature messages.
    pub verifying_key: VerifyingKeyBytes,
    /// The operator's share of the validator's BLS public key.
    pub share_pub_key: BlsPublicKeyBytes,
}

/// The local operator's view of a validator's committee.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Share {
    operator_id: OperatorID,
    validator_pub_key: BlsPublicKeyBytes,
    committee: Vec<Operator>,
    domain_type: DomainType,
    quorum: u64,
    partial_quorum: u64,
}

impl Share {
    /// Create a `Share` for the local operator `operator_id`.
    ///
    /// `committee` is stored sorted by operator id, with later duplicates of an id dropped. `quorum`
    /// is the number of distinct signers needed to certify a QBFT value; `partial_quorum` is the number of
    /// partial signatures needed to reconstruct the validator's signature.
    pub fn new(
        operator_id: OperatorID,
        validator_pub_key: BlsPublicKeyBytes,
        mut committee: Vec<Operator>,
        domain_type: DomainType,
        quorum: u64,
        partial_quorum: u64,
    ) -> Share {
        committee.sort_by_key(|operator| operator.operator_id);
        committee.dedup_by_key(|operator| operator.operator_id);
        Share {
            operator_id,
            validator_pub_key,
            committee,
            domain_type,
            quorum,
            partial_quorum,
        }
    }

    pub fn operator_id(&self) -> OperatorID {
        self.operator_id
    }

    pub fn validator_pub_key(&self) -> &BlsPublicKeyBytes {
        &self.validator_pub_key
    }

    /// Get the local operator's share of the validator public key, if the local operator is in the
    /// committee.
    pub fn share_pub_key(&self) -> Option<&BlsPublicKeyBytes> {
        self.operator(&self.operator_id)
            .map(|operator| &operator.share_pub_key)
    }

    /// Get the committee, sorted by operator id.
    pub fn committee(&self) -> &[Operator] {
        &self.committee
    }

    pub fn committee_size(&self) -> usize {
        self.committee.len()
    }

    pub fn operator(&self, operator_id: &OperatorID) -> Option<&Operator> {
        self.committee
            .binary_search_by_key(operator_id, |operator| operator.operator_id)
            .ok()
            .map(|pos| &self.committee[pos])
    }

    pub fn domain_type(&self) -> DomainType {
        self.domain_type
    }

    pub fn quorum(&self) -> u64 {
        self.quorum
    }

    pub fn partial_quorum(&self) -> u64 {
        self.partial_quorum
    }

    /// Check whether the distinct committee members among `signers` number at least
    /// [`quorum`](Self::quorum).
    pub fn has_quorum<'a>(&self, signers: impl IntoIterator<Item = &'a OperatorID>) -> bool {
        self.distinct_members(signers) as u64 >= self.quorum
    }

    /// Check whether the distinct committee members among `signers` number at least `n - quorum + 1`,
    /// i.e., enough that at least one of them is honest.
    pub fn has_weak_quorum<'a>(&self, signers: impl IntoIterator<Item = &'a OperatorID>) -> bool {
        let weak_quorum = (self.committee.len() as u64).saturating_sub(self.quorum) + 1;
        self.distinct_members(signers) as u64 >= weak_quorum
    }

    /// Check whether `count` distinct partial signatures are enough to reconstruct the validator's
    /// signature.
    pub fn has_partial_quorum(&self, count: usize) -> bool {
        count as u64 >= self.partial_quorum
    }

    fn distinct_members<'a>(&self, signers: impl IntoIterator<Item = &'a OperatorID>) -> usize {
        signers
            .into_iter()
            .filter(|signer| self.operator(signer).is_some())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Compute the quorum size `2f + 1` for a committee of `n = 3f + 1` operators.
pub const fn quorum_for(n: u64) -> u64 {
    (n * 2) / 3 + 1
}

/// Compute the partial-signature quorum size `f + 1` for a committee of `n = 3f + 1` operators.
pub const fn partial_quorum_for(n: u64) -> u64 {
    (n.saturating_sub(1)) / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committee(n: u64) -> Vec<Operator> {
        (1..=n)
            .map(|id| Operator {
                operator_id: OperatorID::new(id),
                verifying_key: [id as u8; 32],
                share_pub_key: BlsPublicKeyBytes::new([id as u8; 48]),
            })
            .collect()
    }

    #[test]
    fn quorum_sizes_follow_3f_plus_1() {
        assert_eq!(quorum_for(4), 3);
        assert_eq!(quorum_for(7), 5);
        assert_eq!(quorum_for(10), 7);
        assert_eq!(partial_quorum_for(4), 2);
        assert_eq!(partial_quorum_for(7), 3);
    }

    #[test]
    fn has_quorum_is_exact_and_counts_distinct_members() {
        let share = Share::new(
            OperatorID::new(1),
            BlsPublicKeyBytes::new([0; 48]),
            committee(4),
            DomainType::new([0; 4]),
            3,
            2,
        );

        for k in 0..=4u64 {
            let signers: Vec<OperatorID> = (1..=k).map(OperatorID::new).collect();
            assert_eq!(share.has_quorum(&signers), k >= 3);
        }

        let duplicated = [OperatorID::new(1), OperatorID::new(1), OperatorID::new(2)];
        assert!(!share.has_quorum(&duplicated));

        let outsider = [OperatorID::new(1), OperatorID::new(2), OperatorID::new(9)];
        assert!(!share.has_quorum(&outsider));

        assert!(share.has_weak_quorum(&[OperatorID::new(3), OperatorID::new(4)]));
        assert!(!share.has_weak_quorum(&[OperatorID::new(3)]));
    }

    #[test]
    fn committee_is_sorted_and_looked_up_by_id() {
        let mut operators = committee(4);
        operators.reverse();
        let share = Share::new(
            OperatorID::new(2),
            BlsPublicKeyBytes::new([0; 48]),
            operators,
            DomainType::new([0; 4]),
            3,
            2,
        );
        let ids: Vec<u64> = share
            .committee()
            .iter()
            .map(|operator| operator.operator_id.int())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(share.share_pub_key(), Some(&BlsPublicKeyBytes::new([2; 48])));
        assert!(share.operator(&OperatorID::new(5)).is_none());
    }
}
