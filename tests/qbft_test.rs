/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tests of the QBFT instance and controller.
//!
//! Single-instance tests drive one operator's [`Instance`] by hand, signing the other operators'
//! messages with keys from a test [`Committee`]. Cluster tests run one [`Controller`] per operator over
//! a mock [`NetworkStub`], and deliver the messages the operators broadcast either in order, or shuffled
//! and duplicated alongside messages from a Byzantine operator.

mod common;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use log::LevelFilter;
use qbft_rs::{
    duty::beacon::BeaconRole,
    networking::Message as NetworkMessage,
    qbft::{
        config::Config,
        controller::{Controller, INSTANCE_HISTORY},
        instance::{Decided, Instance, QbftError},
        messages::{
            CommitData, MessageError, MessageType, PrepareData, ProposalData, RoundChangeData,
            SignedMessage,
        },
        roles::select_leader,
        state::State,
    },
    storage::{KVStorage, Storage},
    types::data_types::{Height, MessageID, OperatorID, Round, FIRST_HEIGHT, FIRST_ROUND, NO_ROUND},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use common::{
    committee::{Committee, ROUND_TIMEOUT},
    logging::setup_logger,
    mem_db::MemDB,
    network::{mock_network, NetworkStub, RecordingNetwork},
};

const VALUE: [u8; 4] = [1, 2, 3, 4];

/// Operator 1's instance at the first height of a 4 operator committee. Operator 3 leads the first
/// round.
struct LocalInstance {
    committee: Committee,
    identifier: MessageID,
    network: Arc<RecordingNetwork>,
    instance: Instance,
}

impl LocalInstance {
    fn start(now: Instant) -> LocalInstance {
        let committee = Committee::new(4, 2);
        let identifier = MessageID::new(&committee.validator_pub_key(), BeaconRole::Attester.code());
        let network = Arc::new(RecordingNetwork::default());
        let config = committee.config(1, network.clone(), MemDB::storage());
        let mut instance = Instance::new(
            config,
            identifier.clone(),
            FIRST_HEIGHT,
            b"operator 1's value".to_vec(),
        );
        assert!(instance.start(now).unwrap().is_none());

        LocalInstance {
            committee,
            identifier,
            network,
            instance,
        }
    }

    fn proposal(&self, signer: u64, value: &[u8]) -> SignedMessage {
        let proposal_data = ProposalData {
            data: value.to_vec(),
            round_change_justification: Vec::new(),
            prepare_justification: Vec::new(),
        };
        self.sign(signer, MessageType::Proposal, FIRST_ROUND, &proposal_data)
    }

    fn prepare(&self, signer: u64, value: &[u8]) -> SignedMessage {
        self.sign(signer, MessageType::Prepare, FIRST_ROUND, &PrepareData { data: value.to_vec() })
    }

    fn commit(&self, signer: u64, value: &[u8]) -> SignedMessage {
        self.sign(signer, MessageType::Commit, FIRST_ROUND, &CommitData { data: value.to_vec() })
    }

    fn round_change(&self, signer: u64, round: Round) -> SignedMessage {
        let round_change_data = RoundChangeData {
            prepared_value: Vec::new(),
            prepared_round: NO_ROUND,
            round_change_justification: Vec::new(),
        };
        self.sign(signer, MessageType::RoundChange, round, &round_change_data)
    }

    /// Sign a prepare for `value` in `round` of the duty stream `identifier`.
    fn prepare_in(
        &self,
        identifier: &MessageID,
        signer: u64,
        round: Round,
        value: &[u8],
    ) -> SignedMessage {
        self.committee.sign(
            signer,
            MessageType::Prepare,
            identifier,
            FIRST_HEIGHT,
            round,
            &PrepareData { data: value.to_vec() },
        )
    }

    /// Sign a round change for `round` of the duty stream `identifier`. If `prepared` is given, the round
    /// change reports that value as prepared in the first round, justified by the given prepares.
    fn round_change_in(
        &self,
        identifier: &MessageID,
        signer: u64,
        round: Round,
        prepared: Option<(&[u8], Vec<SignedMessage>)>,
    ) -> SignedMessage {
        let round_change_data = match prepared {
            Some((value, prepares)) => RoundChangeData {
                prepared_value: value.to_vec(),
                prepared_round: FIRST_ROUND,
                round_change_justification: prepares,
            },
            None => RoundChangeData {
                prepared_value: Vec::new(),
                prepared_round: NO_ROUND,
                round_change_justification: Vec::new(),
            },
        };
        self.committee.sign(
            signer,
            MessageType::RoundChange,
            identifier,
            FIRST_HEIGHT,
            round,
            &round_change_data,
        )
    }

    fn justified_proposal(
        &self,
        signer: u64,
        round: Round,
        value: &[u8],
        round_change_justification: Vec<SignedMessage>,
        prepare_justification: Vec<SignedMessage>,
    ) -> SignedMessage {
        let proposal_data = ProposalData {
            data: value.to_vec(),
            round_change_justification,
            prepare_justification,
        };
        self.sign(signer, MessageType::Proposal, round, &proposal_data)
    }

    /// Accept operator 3's first round proposal for `value` and see it prepared by operators 1, 2 and 3.
    fn prepare_first_round(&mut self, value: &[u8]) {
        self.process(self.proposal(3, value)).unwrap();
        self.process(self.prepare(2, value)).unwrap();
        self.process(self.prepare(3, value)).unwrap();
        assert_eq!(self.instance.state().last_prepared_round, FIRST_ROUND);
        assert_eq!(self.instance.state().last_prepared_value, Some(value.to_vec()));
    }

    /// Assert that the instance is still in the first round, with `value` accepted.
    fn assert_still_in_first_round(&self, value: &[u8]) {
        assert_eq!(self.instance.round(), FIRST_ROUND);
        assert_eq!(self.instance.state().accepted_value().unwrap(), Some(value.to_vec()));
    }

    fn sign<P: borsh::BorshSerialize>(
        &self,
        signer: u64,
        msg_type: MessageType,
        round: Round,
        payload: &P,
    ) -> SignedMessage {
        self.committee
            .sign(signer, msg_type, &self.identifier, FIRST_HEIGHT, round, payload)
    }

    fn process(&mut self, msg: SignedMessage) -> Result<Option<Decided>, QbftError> {
        self.instance.process_msg(msg)
    }

    /// Get the QBFT messages of `msg_type` operator 1 broadcast so far.
    fn sent(&self, msg_type: MessageType) -> Vec<SignedMessage> {
        self.network
            .sent()
            .into_iter()
            .filter_map(|message| match message {
                NetworkMessage::Consensus(msg) if msg.message.msg_type == msg_type => Some(msg),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn prepare_and_commit_quorums_decide_the_proposed_value_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    assert_eq!(
        select_leader(FIRST_HEIGHT, FIRST_ROUND, &local.committee.share(1)),
        Some(OperatorID::new(3))
    );

    assert!(local.process(local.proposal(3, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().accepted_value().unwrap(), Some(VALUE.to_vec()));
    assert_eq!(local.sent(MessageType::Prepare).len(), 1);

    // Operator 1's own prepare and operator 2's are not yet a quorum.
    assert!(local.process(local.prepare(2, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().last_prepared_round, NO_ROUND);
    assert!(local.sent(MessageType::Commit).is_empty());

    assert!(local.process(local.prepare(3, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().last_prepared_round, FIRST_ROUND);
    assert_eq!(local.instance.state().last_prepared_value, Some(VALUE.to_vec()));
    assert_eq!(local.sent(MessageType::Commit).len(), 1);

    // A fourth prepare does not trigger a second commit.
    assert!(local.process(local.prepare(4, &VALUE)).unwrap().is_none());
    assert_eq!(local.sent(MessageType::Commit).len(), 1);

    assert!(local.process(local.commit(2, &VALUE)).unwrap().is_none());
    let decided = local.process(local.commit(3, &VALUE)).unwrap().unwrap();
    assert_eq!(decided.value, VALUE.to_vec());
    assert_eq!(decided.round, FIRST_ROUND);
    assert_eq!(
        decided.committers(),
        vec![OperatorID::new(1), OperatorID::new(2), OperatorID::new(3)]
    );
    assert_eq!(local.instance.is_decided(), (true, Some(&VALUE[..])));
    assert!(local.instance.state().decided);
    assert!(local.instance.timer().armed_round().is_none());

    // Decided instances ignore further messages.
    assert!(local.process(local.commit(4, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().commit_container.len(), 3);
}

#[test]
fn commit_for_a_different_value_is_rejected_without_state_change_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.process(local.proposal(3, &VALUE)).unwrap();

    let before = local.instance.state().clone();
    let result = local.process(local.commit(2, &[9, 9, 9]));
    assert!(matches!(result, Err(QbftError::DataMismatch)));
    assert_eq!(local.instance.state(), &before);
    assert!(local.instance.state().commit_container.is_empty());
}

#[test]
fn repeated_commit_from_the_same_signer_is_a_no_op_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.process(local.proposal(3, &VALUE)).unwrap();
    local.process(local.prepare(2, &VALUE)).unwrap();
    local.process(local.prepare(3, &VALUE)).unwrap();

    // Operator 1's own commit is already in the container.
    assert!(local.process(local.commit(2, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().commit_container.len(), 2);
    assert!(local.process(local.commit(2, &VALUE)).unwrap().is_none());
    assert_eq!(local.instance.state().commit_container.len(), 2);
    assert!(!local.instance.is_decided().0);

    assert!(local.process(local.commit(3, &VALUE)).unwrap().is_some());
}

#[test]
fn commit_before_any_proposal_is_rejected_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());

    let result = local.process(local.commit(2, &VALUE));
    assert!(matches!(result, Err(QbftError::NoProposalForRound(round)) if round == FIRST_ROUND));
    assert!(local.instance.state().commit_container.is_empty());

    let result = local.process(local.prepare(2, &VALUE));
    assert!(matches!(result, Err(QbftError::NoProposalForRound(_))));
}

#[test]
fn invalid_messages_never_change_state_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    let before = local.instance.state().clone();

    // Not the leader of the first round.
    let result = local.process(local.proposal(2, &VALUE));
    assert!(matches!(result, Err(QbftError::NotLeader { .. })));

    // Signed by operator 4 but claiming to be from operator 3.
    let mut forged = local.proposal(4, &VALUE);
    forged.signer = OperatorID::new(3);
    let result = local.process(forged);
    assert!(matches!(
        result,
        Err(QbftError::Message(MessageError::InvalidSignature(_)))
    ));

    // From outside the committee.
    let mut outsider = local.proposal(3, &VALUE);
    outsider.signer = OperatorID::new(9);
    let result = local.process(outsider);
    assert!(matches!(
        result,
        Err(QbftError::Message(MessageError::UnknownSigner(_)))
    ));

    // For another height.
    let wrong_height = local.committee.sign(
        3,
        MessageType::Proposal,
        &local.identifier,
        Height::new(7),
        FIRST_ROUND,
        &ProposalData {
            data: VALUE.to_vec(),
            round_change_justification: Vec::new(),
            prepare_justification: Vec::new(),
        },
    );
    let result = local.process(wrong_height);
    assert!(matches!(result, Err(QbftError::WrongHeight { .. })));

    // For another duty stream.
    let other_identifier = MessageID::new(&local.committee.validator_pub_key(), BeaconRole::Proposer.code());
    let wrong_identifier = local.committee.sign(
        3,
        MessageType::Prepare,
        &other_identifier,
        FIRST_HEIGHT,
        FIRST_ROUND,
        &PrepareData { data: VALUE.to_vec() },
    );
    let result = local.process(wrong_identifier);
    assert!(matches!(result, Err(QbftError::WrongIdentifier)));

    assert_eq!(local.instance.state(), &before);
    assert!(local.network.sent().is_empty());

    // A second proposal for an already accepted round.
    local.process(local.proposal(3, &VALUE)).unwrap();
    let result = local.process(local.proposal(3, &[5, 5]));
    assert!(matches!(result, Err(QbftError::ProposalAlreadyAccepted(_))));
    assert_eq!(local.instance.state().accepted_value().unwrap(), Some(VALUE.to_vec()));
}

#[test]
fn duplicate_delivery_is_idempotent_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.process(local.proposal(3, &VALUE)).unwrap();

    let prepare = local.prepare(2, &VALUE);
    local.process(prepare.clone()).unwrap();
    let after_first = local.instance.state().clone();
    assert_eq!(after_first.prepare_container.len(), 2);

    local.process(prepare).unwrap();
    assert_eq!(local.instance.state(), &after_first);

    // Re-delivering the accepted proposal is rejected and changes nothing either.
    let result = local.process(local.proposal(3, &VALUE));
    assert!(matches!(result, Err(QbftError::ProposalAlreadyAccepted(_))));
    assert_eq!(local.instance.state(), &after_first);
}

#[test]
fn state_encoding_round_trips_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.process(local.proposal(3, &VALUE)).unwrap();
    local.process(local.prepare(2, &VALUE)).unwrap();
    local.process(local.prepare(3, &VALUE)).unwrap();
    local.process(local.round_change(4, Round::new(2))).unwrap();

    let encoded = local.instance.state().encode();
    let decoded = State::decode(&encoded).unwrap();
    assert_eq!(&decoded, local.instance.state());
    assert_eq!(decoded.encode(), encoded);
    assert_eq!(decoded.root(), local.instance.state().root());
}

#[test]
fn round_timer_expiry_broadcasts_a_round_change_test() {
    setup_logger(LevelFilter::Warn);
    let start = Instant::now();
    let mut local = LocalInstance::start(start);
    local.process(local.proposal(3, &VALUE)).unwrap();
    local.process(local.prepare(2, &VALUE)).unwrap();
    local.process(local.prepare(3, &VALUE)).unwrap();

    assert!(local.instance.tick(start + ROUND_TIMEOUT / 2).unwrap().is_none());
    assert!(local.sent(MessageType::RoundChange).is_empty());

    local.instance.tick(start + ROUND_TIMEOUT).unwrap();
    let round_changes = local.sent(MessageType::RoundChange);
    assert_eq!(round_changes.len(), 1);
    assert_eq!(round_changes[0].message.round, Round::new(2));
    let round_change_data = round_changes[0].message.round_change_data().unwrap();
    assert_eq!(round_change_data.prepared_round, FIRST_ROUND);
    assert_eq!(round_change_data.prepared_value, VALUE.to_vec());
    assert_eq!(round_change_data.round_change_justification.len(), 3);

    // Asking for a round change does not leave the current round; it re-arms the timer for the next.
    assert_eq!(local.instance.round(), FIRST_ROUND);
    assert_eq!(local.instance.timer().armed_round(), Some(Round::new(2)));

    // Round 2 lasts twice as long as round 1.
    let round_two_deadline = start + ROUND_TIMEOUT + ROUND_TIMEOUT * 2;
    local.instance.tick(round_two_deadline - Duration::from_millis(1)).unwrap();
    assert_eq!(local.sent(MessageType::RoundChange).len(), 1);
    local.instance.tick(round_two_deadline).unwrap();
    let round_changes = local.sent(MessageType::RoundChange);
    assert_eq!(round_changes.len(), 2);
    assert_eq!(round_changes[1].message.round, Round::new(3));
}

#[test]
fn weak_quorum_of_round_changes_is_joined_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    let round_three = Round::new(3);
    assert_eq!(
        select_leader(FIRST_HEIGHT, round_three, &local.committee.share(1)),
        Some(OperatorID::new(1))
    );

    local.process(local.round_change(2, round_three)).unwrap();
    assert!(local.sent(MessageType::RoundChange).is_empty());
    assert_eq!(local.instance.round(), FIRST_ROUND);

    // Two operators ask for round 3: at least one of them is honest, so operator 1 joins them. Its own
    // round change completes a quorum, and as round 3's leader it proposes its own value.
    local.process(local.round_change(4, round_three)).unwrap();
    let round_changes = local.sent(MessageType::RoundChange);
    assert_eq!(round_changes.len(), 1);
    assert_eq!(round_changes[0].message.round, round_three);
    assert_eq!(local.instance.round(), round_three);

    let proposals = local.sent(MessageType::Proposal);
    assert_eq!(proposals.len(), 1);
    let proposal_data = proposals[0].message.proposal_data().unwrap();
    assert_eq!(proposal_data.data, b"operator 1's value".to_vec());
    assert_eq!(proposal_data.round_change_justification.len(), 3);
    assert!(proposal_data.prepare_justification.is_empty());
    assert_eq!(
        local.instance.state().accepted_value().unwrap(),
        Some(b"operator 1's value".to_vec())
    );

    // A round change for a round already left behind is rejected.
    let result = local.process(local.round_change(2, Round::new(2)));
    assert!(matches!(result, Err(QbftError::WrongRound { .. })));
}

#[test]
fn round_change_with_forged_prepared_claim_is_rejected_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    let forged = local.sign(
        2,
        MessageType::RoundChange,
        Round::new(2),
        &RoundChangeData {
            prepared_value: VALUE.to_vec(),
            prepared_round: FIRST_ROUND,
            round_change_justification: vec![local.prepare(2, &VALUE)],
        },
    );
    let result = local.process(forged);
    assert!(matches!(result, Err(QbftError::InvalidJustification(_))));
    assert!(local.instance.state().round_change_container.is_empty());
}

const LOCKED: &[u8] = b"locked";

const OTHER: &[u8] = b"other";

#[test]
fn justification_from_another_duty_stream_is_rejected_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.prepare_first_round(LOCKED);
    let round_two = Round::new(2);
    assert_eq!(
        select_leader(FIRST_HEIGHT, round_two, &local.committee.share(1)),
        Some(OperatorID::new(4))
    );

    // Round changes with nothing prepared, taken from the proposer stream of the same validator.
    let proposer_stream =
        MessageID::new(&local.committee.validator_pub_key(), BeaconRole::Proposer.code());
    let round_changes = [2, 3, 4]
        .into_iter()
        .map(|signer| local.round_change_in(&proposer_stream, signer, round_two, None))
        .collect();
    let proposal = local.justified_proposal(4, round_two, OTHER, round_changes, Vec::new());
    assert!(matches!(
        local.process(proposal),
        Err(QbftError::InvalidJustification(_))
    ));
    local.assert_still_in_first_round(LOCKED);

    // Round changes from this stream, whose prepared claim rests on prepares from the proposer stream.
    let foreign_prepares: Vec<SignedMessage> = [1, 2, 3]
        .into_iter()
        .map(|signer| local.prepare_in(&proposer_stream, signer, FIRST_ROUND, OTHER))
        .collect();
    let identifier = local.identifier.clone();
    let round_changes = [2, 3, 4]
        .into_iter()
        .map(|signer| {
            local.round_change_in(
                &identifier,
                signer,
                round_two,
                Some((OTHER, foreign_prepares.clone())),
            )
        })
        .collect();
    let proposal = local.justified_proposal(4, round_two, OTHER, round_changes, foreign_prepares);
    assert!(matches!(
        local.process(proposal),
        Err(QbftError::InvalidJustification(_))
    ));
    local.assert_still_in_first_round(LOCKED);
}

#[test]
fn proposal_must_carry_the_highest_prepared_value_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.prepare_first_round(LOCKED);
    let round_two = Round::new(2);
    let identifier = local.identifier.clone();

    let prepares: Vec<SignedMessage> = [1, 2, 3]
        .into_iter()
        .map(|signer| local.prepare_in(&identifier, signer, FIRST_ROUND, LOCKED))
        .collect();
    let round_changes = vec![
        local.round_change_in(&identifier, 2, round_two, Some((LOCKED, prepares.clone()))),
        local.round_change_in(&identifier, 3, round_two, None),
        local.round_change_in(&identifier, 4, round_two, None),
    ];

    let proposal =
        local.justified_proposal(4, round_two, OTHER, round_changes.clone(), prepares.clone());
    assert!(matches!(
        local.process(proposal),
        Err(QbftError::InvalidJustification(_))
    ));
    local.assert_still_in_first_round(LOCKED);

    // The same justification does support a proposal for the prepared value.
    let proposal = local.justified_proposal(4, round_two, LOCKED, round_changes, prepares);
    local.process(proposal).unwrap();
    assert_eq!(local.instance.round(), round_two);
    assert_eq!(local.instance.state().accepted_value().unwrap(), Some(LOCKED.to_vec()));
}

#[test]
fn proposal_with_a_faulty_prepare_justification_is_rejected_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.prepare_first_round(LOCKED);
    let round_two = Round::new(2);
    let identifier = local.identifier.clone();

    let prepares: Vec<SignedMessage> = [1, 2, 3]
        .into_iter()
        .map(|signer| local.prepare_in(&identifier, signer, FIRST_ROUND, LOCKED))
        .collect();
    let round_changes: Vec<SignedMessage> = [2, 3, 4]
        .into_iter()
        .map(|signer| {
            local.round_change_in(&identifier, signer, round_two, Some((LOCKED, prepares.clone())))
        })
        .collect();

    let too_few = prepares[..2].to_vec();
    let wrong_round = [1, 2, 3]
        .into_iter()
        .map(|signer| local.prepare_in(&identifier, signer, round_two, LOCKED))
        .collect();
    let wrong_value = [1, 2, 3]
        .into_iter()
        .map(|signer| local.prepare_in(&identifier, signer, FIRST_ROUND, OTHER))
        .collect();
    for prepare_justification in [too_few, wrong_round, wrong_value] {
        let proposal = local.justified_proposal(
            4,
            round_two,
            LOCKED,
            round_changes.clone(),
            prepare_justification,
        );
        assert!(matches!(
            local.process(proposal),
            Err(QbftError::InvalidJustification(_))
        ));
        local.assert_still_in_first_round(LOCKED);
    }
}

#[test]
fn proposal_with_round_changes_for_another_round_is_rejected_test() {
    setup_logger(LevelFilter::Warn);
    let mut local = LocalInstance::start(Instant::now());
    local.process(local.proposal(3, &VALUE)).unwrap();
    let round_two = Round::new(2);
    let identifier = local.identifier.clone();

    let for_round_three = [2, 3, 4]
        .into_iter()
        .map(|signer| local.round_change_in(&identifier, signer, Round::new(3), None))
        .collect();
    let proposal = local.justified_proposal(4, round_two, OTHER, for_round_three, Vec::new());
    assert!(matches!(
        local.process(proposal),
        Err(QbftError::InvalidJustification(_))
    ));
    local.assert_still_in_first_round(&VALUE);

    let too_few = [3, 4]
        .into_iter()
        .map(|signer| local.round_change_in(&identifier, signer, round_two, None))
        .collect();
    let proposal = local.justified_proposal(4, round_two, OTHER, too_few, Vec::new());
    assert!(matches!(
        local.process(proposal),
        Err(QbftError::InvalidJustification(_))
    ));
    local.assert_still_in_first_round(&VALUE);
}

/// A committee with one [`Controller`] per running operator, connected through a mock network.
struct Cluster {
    committee: Committee,
    identifier: MessageID,
    networks: BTreeMap<OperatorID, NetworkStub>,
    controllers: BTreeMap<OperatorID, Controller>,
    storages: BTreeMap<OperatorID, Arc<KVStorage<MemDB>>>,
}

impl Cluster {
    /// Create controllers for the `running` operators of `committee`. Messages to other operators are
    /// discarded.
    fn new(committee: Committee, running: &[u64]) -> Cluster {
        let identifier = MessageID::new(&committee.validator_pub_key(), BeaconRole::Attester.code());
        let networks = mock_network(committee.ids().into_iter());
        let mut controllers = BTreeMap::new();
        let mut storages = BTreeMap::new();
        for id in running {
            let operator_id = OperatorID::new(*id);
            let storage = MemDB::storage();
            let config = committee.config(
                *id,
                Arc::new(networks[&operator_id].clone()),
                storage.clone(),
            );
            controllers.insert(operator_id, Controller::new(identifier.clone(), config));
            storages.insert(operator_id, storage);
        }

        Cluster {
            committee,
            identifier,
            networks,
            controllers,
            storages,
        }
    }

    fn start(&mut self, height: Height, now: Instant) {
        for (id, controller) in self.controllers.iter_mut() {
            assert!(controller
                .start_new_instance(start_value(*id, height), now)
                .unwrap()
                .is_none());
            assert_eq!(controller.height(), height);
        }
    }

    fn tick(&mut self, now: Instant) {
        for controller in self.controllers.values_mut() {
            controller.tick(now).unwrap();
        }
    }

    /// Deliver messages to each running operator in the order they were sent, until no messages are
    /// left. Messages for which `drop` returns true are discarded instead.
    fn deliver_all(&mut self, drop: impl Fn(&OperatorID, &NetworkMessage) -> bool) -> Delivery {
        let mut delivery = Delivery::default();
        loop {
            let mut progressed = false;
            for (id, network) in &self.networks {
                for (_, message) in network.drain() {
                    progressed = true;
                    let controller = match self.controllers.get_mut(id) {
                        Some(controller) if !drop(id, &message) => controller,
                        _ => continue,
                    };
                    match deliver(controller, message) {
                        Ok(Some(decided)) => delivery.decisions.entry(*id).or_default().push(decided),
                        Ok(None) => (),
                        Err(err) => delivery.errors.push(err),
                    }
                }
            }
            if !progressed {
                return delivery;
            }
        }
    }

    /// Move every message waiting in a running operator's inbox into `pool`.
    fn collect_into(&self, pool: &mut Vec<Pending>) {
        for (id, network) in &self.networks {
            for (_, message) in network.drain() {
                if self.controllers.contains_key(id) {
                    pool.push(Pending {
                        to: *id,
                        message,
                        attempts: 0,
                        duplicate: false,
                    });
                }
            }
        }
    }

    fn sign<P: borsh::BorshSerialize>(
        &self,
        signer: u64,
        msg_type: MessageType,
        round: Round,
        payload: &P,
    ) -> SignedMessage {
        self.committee
            .sign(signer, msg_type, &self.identifier, FIRST_HEIGHT, round, payload)
    }
}

#[derive(Default)]
struct Delivery {
    decisions: BTreeMap<OperatorID, Vec<Decided>>,
    errors: Vec<QbftError>,
}

impl Delivery {
    fn decided_value(&self, id: u64) -> Vec<u8> {
        let decisions = &self.decisions[&OperatorID::new(id)];
        assert_eq!(decisions.len(), 1);
        decisions[0].value.clone()
    }
}

#[derive(Clone)]
struct Pending {
    to: OperatorID,
    message: NetworkMessage,
    attempts: u32,
    duplicate: bool,
}

fn start_value(id: OperatorID, height: Height) -> Vec<u8> {
    format!("value of operator {} at height {}", id, height).into_bytes()
}

fn deliver(controller: &mut Controller, message: NetworkMessage) -> Result<Option<Decided>, QbftError> {
    match message {
        NetworkMessage::Consensus(msg) => controller.process_msg(msg),
        NetworkMessage::Decided(decided_message) => controller.process_decided_msg(decided_message),
        NetworkMessage::PartialSignature(_) => Ok(None),
    }
}

#[test]
fn committee_decides_consecutive_heights_test() {
    setup_logger(LevelFilter::Warn);
    let mut cluster = Cluster::new(Committee::new(4, 2), &[1, 2, 3, 4]);

    cluster.start(FIRST_HEIGHT, Instant::now());
    let delivery = cluster.deliver_all(|_, _| false);
    assert!(delivery.errors.is_empty());
    let leader_value = start_value(OperatorID::new(3), FIRST_HEIGHT);
    for id in 1..=4 {
        assert_eq!(delivery.decided_value(id), leader_value);
        let highest_decided = cluster.storages[&OperatorID::new(id)]
            .highest_decided(&cluster.identifier)
            .unwrap()
            .unwrap();
        assert_eq!(highest_decided.height(), FIRST_HEIGHT);
        assert_eq!(highest_decided.value().unwrap(), leader_value);
    }

    let second_height = FIRST_HEIGHT + 1;
    cluster.start(second_height, Instant::now());
    let delivery = cluster.deliver_all(|_, _| false);
    assert!(delivery.errors.is_empty());
    let leader_value = start_value(OperatorID::new(4), second_height);
    for id in 1..=4 {
        assert_eq!(delivery.decided_value(id), leader_value);
        let highest_decided = cluster.storages[&OperatorID::new(id)]
            .highest_decided(&cluster.identifier)
            .unwrap()
            .unwrap();
        assert_eq!(highest_decided.height(), second_height);
    }
}

#[test]
fn crashed_leader_is_replaced_through_round_change_test() {
    setup_logger(LevelFilter::Warn);
    // Operator 3 leads round 1 but never starts.
    let mut cluster = Cluster::new(Committee::new(4, 2), &[1, 2, 4]);
    let start = Instant::now();
    cluster.start(FIRST_HEIGHT, start);
    let delivery = cluster.deliver_all(|_, _| false);
    assert!(delivery.decisions.is_empty());

    cluster.tick(start + ROUND_TIMEOUT);
    let delivery = cluster.deliver_all(|_, _| false);

    // Operator 4 leads round 2. Nobody prepared anything, so it proposes its own value.
    let round_two_leader_value = start_value(OperatorID::new(4), FIRST_HEIGHT);
    for id in [1, 2, 4] {
        assert_eq!(delivery.decided_value(id), round_two_leader_value);
        assert_eq!(delivery.decisions[&OperatorID::new(id)][0].round, Round::new(2));
    }
}

#[test]
fn round_change_carries_the_prepared_value_into_the_next_round_test() {
    setup_logger(LevelFilter::Warn);
    let mut cluster = Cluster::new(Committee::new(4, 2), &[1, 2, 3, 4]);
    let start = Instant::now();
    cluster.start(FIRST_HEIGHT, start);

    // Every operator prepares operator 3's value, but no commit gets through.
    let delivery = cluster.deliver_all(|_, message| {
        matches!(message, NetworkMessage::Consensus(msg) if msg.message.msg_type == MessageType::Commit)
    });
    assert!(delivery.decisions.is_empty());
    let prepared_value = start_value(OperatorID::new(3), FIRST_HEIGHT);
    for controller in cluster.controllers.values() {
        let state = controller.instance_for_height(FIRST_HEIGHT).unwrap().state();
        assert_eq!(state.last_prepared_round, FIRST_ROUND);
        assert_eq!(state.last_prepared_value, Some(prepared_value.clone()));
    }

    // Operator 4 leads round 2 and must re-propose the prepared value instead of its own.
    cluster.tick(start + ROUND_TIMEOUT);
    let delivery = cluster.deliver_all(|_, _| false);
    for id in 1..=4 {
        assert_eq!(delivery.decided_value(id), prepared_value);
        assert_eq!(delivery.decisions[&OperatorID::new(id)][0].round, Round::new(2));
    }

    // Last prepared round moved forward, never back.
    for controller in cluster.controllers.values() {
        let state = controller.instance_for_height(FIRST_HEIGHT).unwrap().state();
        assert_eq!(state.last_prepared_round, Round::new(2));
    }
}

#[test]
fn lagging_operator_decides_from_a_decided_message_test() {
    setup_logger(LevelFilter::Warn);
    let mut cluster = Cluster::new(Committee::new(4, 2), &[1, 2, 3, 4]);
    cluster.start(FIRST_HEIGHT, Instant::now());

    // Operator 1 is partitioned away from everything but decided messages.
    let operator_1 = OperatorID::new(1);
    let delivery = cluster.deliver_all(|to, message| {
        *to == operator_1 && !matches!(message, NetworkMessage::Decided(_))
    });
    assert!(delivery.errors.is_empty());

    let leader_value = start_value(OperatorID::new(3), FIRST_HEIGHT);
    assert_eq!(delivery.decided_value(1), leader_value);
    let instance = cluster.controllers[&operator_1]
        .instance_for_height(FIRST_HEIGHT)
        .unwrap();
    assert_eq!(instance.is_decided(), (true, Some(&leader_value[..])));

    let highest_decided = cluster.storages[&operator_1]
        .highest_decided(&cluster.identifier)
        .unwrap()
        .unwrap();
    assert_eq!(highest_decided.value().unwrap(), leader_value);

    // A decided message without a quorum of signatures is rejected.
    let mut thin = highest_decided.clone();
    let first_signer = *thin.signers().next().unwrap();
    thin.signatures.remove(&first_signer);
    thin.signatures.remove(&OperatorID::new(4));
    let result = cluster
        .controllers
        .get_mut(&operator_1)
        .unwrap()
        .process_decided_msg(thin);
    assert!(matches!(result, Err(QbftError::Message(MessageError::NoQuorum))));
}

/// Maximum number of times a rejected message is re-queued. Honest messages are only rejected when
/// they overtake the proposal they depend on.
const MAX_ATTEMPTS: u32 = 64;

/// Messages operator 4 sends to every honest operator, none of which may sway a decision.
fn byzantine_messages(cluster: &Cluster) -> Vec<Pending> {
    let other_value = b"byzantine value".to_vec();
    let no_justification = ProposalData {
        data: other_value.clone(),
        round_change_justification: Vec::new(),
        prepare_justification: Vec::new(),
    };

    let mut forged = cluster.sign(4, MessageType::Commit, FIRST_ROUND, &CommitData { data: other_value.clone() });
    forged.signer = OperatorID::new(1);

    let messages = vec![
        // Not the leader of round 1.
        cluster.sign(4, MessageType::Proposal, FIRST_ROUND, &no_justification),
        // Leader of round 2, but without a round change quorum.
        cluster.sign(4, MessageType::Proposal, Round::new(2), &no_justification),
        cluster.sign(4, MessageType::Prepare, FIRST_ROUND, &PrepareData { data: other_value.clone() }),
        cluster.sign(4, MessageType::Commit, FIRST_ROUND, &CommitData { data: other_value.clone() }),
        // Claims a prepared value it cannot justify.
        cluster.sign(
            4,
            MessageType::RoundChange,
            Round::new(5),
            &RoundChangeData {
                prepared_value: other_value.clone(),
                prepared_round: FIRST_ROUND,
                round_change_justification: Vec::new(),
            },
        ),
        // Valid, but a single operator cannot move anyone to a new round.
        cluster.sign(
            4,
            MessageType::RoundChange,
            Round::new(2),
            &RoundChangeData {
                prepared_value: Vec::new(),
                prepared_round: NO_ROUND,
                round_change_justification: Vec::new(),
            },
        ),
        forged,
    ];

    cluster
        .controllers
        .keys()
        .flat_map(|to| {
            messages.iter().map(|msg| Pending {
                to: *to,
                message: NetworkMessage::Consensus(msg.clone()),
                attempts: 0,
                duplicate: false,
            })
        })
        .collect()
}

#[test]
fn shuffled_duplicated_and_byzantine_delivery_is_safe_test() {
    setup_logger(LevelFilter::Warn);
    for seed in 0..4 {
        // Operator 4 is Byzantine: it runs no instance and only sends the messages above.
        let mut cluster = Cluster::new(Committee::new(4, 2), &[1, 2, 3]);
        cluster.start(FIRST_HEIGHT, Instant::now());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut pool = byzantine_messages(&cluster);
        cluster.collect_into(&mut pool);
        let mut decisions: BTreeMap<OperatorID, Vec<Vec<u8>>> = BTreeMap::new();

        while !pool.is_empty() {
            let pending = pool.swap_remove(rng.gen_range(0..pool.len()));
            if !pending.duplicate && rng.gen_bool(0.25) {
                pool.push(Pending {
                    attempts: 0,
                    duplicate: true,
                    ..pending.clone()
                });
            }

            let controller = cluster.controllers.get_mut(&pending.to).unwrap();
            match deliver(controller, pending.message.clone()) {
                Ok(Some(decided)) => decisions.entry(pending.to).or_default().push(decided.value),
                Ok(None) => (),
                Err(_) if pending.attempts < MAX_ATTEMPTS => pool.push(Pending {
                    attempts: pending.attempts + 1,
                    ..pending
                }),
                Err(err) => log::debug!("dropping message to {}: {}", pending.to, err),
            }
            cluster.collect_into(&mut pool);
        }

        let leader_value = start_value(OperatorID::new(3), FIRST_HEIGHT);
        for id in 1..=3 {
            assert_eq!(
                decisions.get(&OperatorID::new(id)),
                Some(&vec![leader_value.clone()]),
                "seed {}",
                seed
            );
        }
    }
}

#[test]
fn controller_runs_one_instance_at_a_time_test() {
    setup_logger(LevelFilter::Warn);
    let committee = Committee::new(4, 2);
    let identifier = MessageID::new(&committee.validator_pub_key(), BeaconRole::Attester.code());
    let network = Arc::new(RecordingNetwork::default());
    let mut controller = Controller::new(
        identifier.clone(),
        committee.config(1, network, MemDB::storage()),
    );
    assert_eq!(controller.height(), FIRST_HEIGHT);
    assert!(controller.instance_for_height(FIRST_HEIGHT).is_none());

    let now = Instant::now();
    controller.start_new_instance(VALUE.to_vec(), now).unwrap();
    assert!(controller.instance_for_height(FIRST_HEIGHT).is_some());

    let result = controller.start_new_instance(VALUE.to_vec(), now);
    assert!(matches!(result, Err(QbftError::InstanceAlreadyRunning(height)) if height == FIRST_HEIGHT));
    assert_eq!(controller.height(), FIRST_HEIGHT);

    let unknown_height = committee.sign(
        3,
        MessageType::Prepare,
        &identifier,
        Height::new(9),
        FIRST_ROUND,
        &PrepareData { data: VALUE.to_vec() },
    );
    let result = controller.process_msg(unknown_height);
    assert!(matches!(result, Err(QbftError::UnknownHeight(_))));

    let other_stream = committee.sign(
        3,
        MessageType::Prepare,
        &MessageID::new(&committee.validator_pub_key(), BeaconRole::Proposer.code()),
        FIRST_HEIGHT,
        FIRST_ROUND,
        &PrepareData { data: VALUE.to_vec() },
    );
    let result = controller.process_msg(other_stream);
    assert!(matches!(result, Err(QbftError::WrongIdentifier)));
}

#[test]
fn controller_keeps_a_bounded_instance_history_test() {
    setup_logger(LevelFilter::Warn);
    // A committee of one decides every instance as soon as it starts.
    let committee = Committee::new(1, 1);
    let identifier = MessageID::new(&committee.validator_pub_key(), BeaconRole::Attester.code());
    let network = Arc::new(RecordingNetwork::default());
    let storage = MemDB::storage();
    let mut controller = Controller::new(
        identifier.clone(),
        committee.config(1, network.clone(), storage.clone()),
    );

    let heights = INSTANCE_HISTORY as u64 + 2;
    for h in 1..=heights {
        let value = format!("value {}", h).into_bytes();
        let decided = controller
            .start_new_instance(value.clone(), Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(decided.height(), Height::new(h));
        assert_eq!(decided.value, value);
        assert_eq!(controller.height(), Height::new(h));
    }

    assert!(controller.instance_for_height(Height::new(1)).is_none());
    assert!(controller.instance_for_height(Height::new(2)).is_none());
    for h in 3..=heights {
        assert!(controller.instance_for_height(Height::new(h)).is_some());
    }

    assert_eq!(network.decided().len(), heights as usize);
    let highest_decided = storage.highest_decided(&identifier).unwrap().unwrap();
    assert_eq!(highest_decided.height(), Height::new(heights));
}

#[test]
fn controller_rejects_start_values_failing_the_value_check_test() {
    setup_logger(LevelFilter::Warn);
    let committee = Committee::new(4, 2);
    let identifier = MessageID::new(&committee.validator_pub_key(), BeaconRole::Attester.code());
    let config = Config::builder()
        .keypair(committee.signing_key(1))
        .share(committee.share(1))
        .value_check(|value: &[u8]| {
            if value.is_empty() {
                Err(String::from("empty value"))
            } else {
                Ok(())
            }
        })
        .network(Arc::new(RecordingNetwork::default()))
        .storage(MemDB::storage())
        .round_timeout(ROUND_TIMEOUT)
        .build();
    let mut controller = Controller::new(identifier, Arc::new(config));

    let result = controller.start_new_instance(Vec::new(), Instant::now());
    assert!(matches!(result, Err(QbftError::InvalidValue(_))));
    assert!(controller.instance_for_height(FIRST_HEIGHT).is_none());

    controller.start_new_instance(VALUE.to_vec(), Instant::now()).unwrap();
    assert!(controller.instance_for_height(FIRST_HEIGHT).is_some());
}
