/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine which operator plays which role in a given height and round.

use crate::types::{
    data_types::{Height, OperatorID, Round},
    share::Share,
};

/// Deterministically select the operator that proposes in `round` of `height`.
///
/// The leader is the operator at position `(height + round) mod n` of the committee sorted by operator
/// id, so leadership rotates by one position every round and every height. Returns `None` only for an
/// empty committee.
pub fn select_leader(height: Height, round: Round, share: &Share) -> Option<OperatorID> {
    let committee = share.committee();
    if committee.is_empty() {
        return None;
    }
    let index = height.int().wrapping_add(round.int()) % committee.len() as u64;
    Some(committee[index as usize].operator_id)
}

/// Check whether `operator` is the leader of `round` of `height`.
pub fn is_leader(operator: &OperatorID, height: Height, round: Round, share: &Share) -> bool {
    select_leader(height, round, share).as_ref() == Some(operator)
}

#[test]
fn select_leader_fairness_test() {
    use crate::types::{
        data_types::{BlsPublicKeyBytes, DomainType},
        share::Operator,
    };

    let n = 7;
    let committee = (1..=n)
        .map(|id| Operator {
            operator_id: OperatorID::new(id),
            verifying_key: [id as u8; 32],
            share_pub_key: BlsPublicKeyBytes::new([id as u8; 48]),
        })
        .collect();
    let share = Share::new(
        OperatorID::new(1),
        BlsPublicKeyBytes::new([0; 48]),
        committee,
        DomainType::new([0; 4]),
        5,
        3,
    );

    // Over n consecutive rounds of one height, every operator leads exactly once.
    let leader_sequence: Vec<OperatorID> = (1..=n)
        .filter_map(|round| select_leader(Height::new(3), Round::new(round), &share))
        .collect();
    share.committee().iter().for_each(|operator| {
        assert_eq!(
            leader_sequence
                .iter()
                .filter(|leader| **leader == operator.operator_id)
                .count(),
            1
        )
    });

    // The next round and the next height both hand leadership to the next operator.
    let leader = select_leader(Height::new(3), Round::new(1), &share);
    assert_ne!(leader, select_leader(Height::new(3), Round::new(2), &share));
    assert_ne!(leader, select_leader(Height::new(4), Round::new(1), &share));
    assert_eq!(
        select_leader(Height::new(4), Round::new(1), &share),
        select_leader(Height::new(3), Round::new(2), &share)
    );
}
