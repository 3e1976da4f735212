/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The prepare phase: waiting for a quorum to agree on the accepted proposal's value, then committing.

use std::time::SystemTime;

use crate::{
    events::{Event, ReceivePrepareEvent, UpdateLastPreparedEvent},
    types::data_types::Round,
};

use super::{
    instance::{Instance, QbftError},
    messages::{Message, MessageType, PrepareData, SignedMessage},
    commit::create_commit,
};

pub(super) fn upon_prepare(
    instance: &mut Instance,
    signed_prepare: SignedMessage,
) -> Result<(), QbftError> {
    Event::ReceivePrepare(ReceivePrepareEvent {
        timestamp: SystemTime::now(),
        origin: signed_prepare.signer,
        prepare: signed_prepare.clone(),
    })
    .publish(&instance.config.event_publisher);

    let value = validate_prepare(instance, &signed_prepare)?;
    if !instance
        .state
        .prepare_container
        .add_if_doesnt_exist(&signed_prepare)
    {
        return Ok(());
    }

    let height = instance.state.height;
    let round = instance.state.round;
    let prepares = instance
        .state
        .prepare_container
        .messages_for_height_and_round_where(height, round, |msg| {
            has_prepare_value(&msg.message, &value)
        });
    if !instance
        .share()
        .has_quorum(prepares.iter().map(|prepare| &prepare.signer))
    {
        return Ok(());
    }
    if did_send_commit_for_height_and_round(instance) {
        return Ok(());
    }

    if instance.state.record_prepared(round, &value) {
        Event::UpdateLastPrepared(UpdateLastPreparedEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            value: value.clone(),
        })
        .publish(&instance.config.event_publisher);
    }

    let commit = create_commit(instance, value);
    instance.outbox.push_back(commit);
    Ok(())
}

/// Check the prepare against the accepted proposal, returning the prepared value.
fn validate_prepare(instance: &Instance, signed_prepare: &SignedMessage) -> Result<Vec<u8>, QbftError> {
    let state = &instance.state;
    let accepted_value = state
        .accepted_value()?
        .ok_or(QbftError::NoProposalForRound(state.round))?;
    let prepare_data = signed_prepare.message.prepare_data()?;

    if signed_prepare.message.round != state.round {
        return Err(QbftError::WrongRound {
            expected: state.round,
            actual: signed_prepare.message.round,
        });
    }
    if prepare_data.data != accepted_value {
        return Err(QbftError::DataMismatch);
    }
    Ok(prepare_data.data)
}

/// Check whether this operator already committed in the instance's current round.
fn did_send_commit_for_height_and_round(instance: &Instance) -> bool {
    instance
        .state
        .commit_container
        .has_message_from(instance.state.round, &instance.me())
        || instance
            .outbox
            .iter()
            .any(|msg| msg.message.msg_type == MessageType::Commit)
}

pub(super) fn has_prepare_value(message: &Message, value: &[u8]) -> bool {
    message
        .prepare_data()
        .map(|prepare_data| prepare_data.data == value)
        .unwrap_or(false)
}

pub(super) fn create_prepare(instance: &Instance, round: Round, value: Vec<u8>) -> SignedMessage {
    let message = Message::new(
        MessageType::Prepare,
        instance.state.height,
        round,
        instance.state.id.clone(),
        &PrepareData { data: value },
    );
    SignedMessage::new(
        &instance.config.keypair,
        instance.me(),
        instance.config.domain(),
        message,
    )
}
