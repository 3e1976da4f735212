/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The proposal phase: accepting the round leader's value.
//!
//! A proposal is accepted if:
//! 1. No proposal was accepted yet in its round, and its round is not behind the instance's.
//! 2. It was signed by the [leader](super::roles::select_leader) of its height and round.
//! 3. Its value passes the configured [`ValueCheck`](super::config::ValueCheck).
//! 4. It is [justified](is_proposal_justified).
//!
//! On acceptance the instance moves into the proposal's round if it is behind, stores the proposal and
//! prepares its value.

use std::time::{Instant, SystemTime};

use crate::{
    events::{Event, ReceiveProposalEvent},
    types::{
        data_types::{Height, MessageID, Round, FIRST_ROUND},
        share::Share,
    },
};

use super::{
    instance::{Instance, QbftError},
    messages::{Message, MessageType, ProposalData, SignedMessage},
    prepare::create_prepare,
    roles::is_leader,
    round_change::{highest_prepared, validate_prepare_quorum, validate_round_change},
};

pub(super) fn upon_proposal(
    instance: &mut Instance,
    signed_proposal: SignedMessage,
    now: Instant,
) -> Result<(), QbftError> {
    Event::ReceiveProposal(ReceiveProposalEvent {
        timestamp: SystemTime::now(),
        origin: signed_proposal.signer,
        proposal: signed_proposal.clone(),
    })
    .publish(&instance.config.event_publisher);

    let proposal_data = validate_proposal(instance, &signed_proposal)?;
    let round = signed_proposal.message.round;

    instance
        .state
        .propose_container
        .add_if_doesnt_exist(&signed_proposal);
    if round > instance.state.round {
        instance.start_round(round, now);
    }
    instance.state.proposal_accepted_for_current_round = Some(signed_proposal);

    let prepare = create_prepare(instance, round, proposal_data.data);
    instance.outbox.push_back(prepare);
    Ok(())
}

fn validate_proposal(
    instance: &Instance,
    signed_proposal: &SignedMessage,
) -> Result<ProposalData, QbftError> {
    let state = &instance.state;
    let proposal_data = signed_proposal.message.proposal_data()?;
    let round = signed_proposal.message.round;

    if round < state.round {
        return Err(QbftError::WrongRound {
            expected: state.round,
            actual: round,
        });
    }
    if round == state.round && state.proposal_accepted_for_current_round.is_some() {
        return Err(QbftError::ProposalAlreadyAccepted(round));
    }
    if !is_leader(&signed_proposal.signer, state.height, round, instance.share()) {
        return Err(QbftError::NotLeader {
            round,
            signer: signed_proposal.signer,
        });
    }
    (instance.config.value_check)(&proposal_data.data).map_err(QbftError::InvalidValue)?;
    is_proposal_justified(instance.share(), &state.id, state.height, round, &proposal_data)?;

    Ok(proposal_data)
}

/// Check that a proposal for `round` may propose `proposal_data.data`.
///
/// First-round proposals need no justification. A proposal for a later round must carry a quorum of
/// valid round changes for that round. If any of those round changes reports a prepared value, the
/// proposal must propose the [highest prepared](highest_prepared) value and carry the prepare quorum
/// for it. If none does, any value is justified. Every nested message must belong to the duty stream
/// `identifier`.
pub(super) fn is_proposal_justified(
    share: &Share,
    identifier: &MessageID,
    height: Height,
    round: Round,
    proposal_data: &ProposalData,
) -> Result<(), QbftError> {
    if round == FIRST_ROUND {
        return Ok(());
    }

    let round_changes = &proposal_data.round_change_justification;
    for round_change in round_changes {
        if round_change.message.round != round {
            return Err(QbftError::InvalidJustification(
                "round change is for a different round than the proposal",
            ));
        }
        validate_round_change(share, identifier, height, round_change)?;
    }
    if !share.has_quorum(round_changes.iter().map(|round_change| &round_change.signer)) {
        return Err(QbftError::InvalidJustification(
            "round changes do not form a quorum",
        ));
    }

    match highest_prepared(round_changes)? {
        None => Ok(()),
        Some((prepared_round, prepared_value, _)) => {
            if proposal_data.data != prepared_value {
                return Err(QbftError::InvalidJustification(
                    "proposed value is not the highest prepared value",
                ));
            }
            validate_prepare_quorum(
                share,
                identifier,
                height,
                prepared_round,
                &prepared_value,
                &proposal_data.prepare_justification,
            )
        }
    }
}

pub(super) fn create_proposal(
    instance: &Instance,
    round: Round,
    value: Vec<u8>,
    round_change_justification: Vec<SignedMessage>,
    prepare_justification: Vec<SignedMessage>,
) -> SignedMessage {
    let message = Message::new(
        MessageType::Proposal,
        instance.state.height,
        round,
        instance.state.id.clone(),
        &ProposalData {
            data: value,
            round_change_justification,
            prepare_justification,
        },
    );
    SignedMessage::new(
        &instance.config.keypair,
        instance.me(),
        instance.config.domain(),
        message,
    )
}
