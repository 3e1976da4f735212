/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The commit phase: deciding once a quorum commits to the accepted proposal's value.

use std::time::SystemTime;

use crate::events::{Event, ReceiveCommitEvent};

use super::{
    instance::{Decided, Instance, QbftError},
    messages::{CommitData, DecidedMessage, Message, MessageType, SignedMessage},
};

pub(super) fn upon_commit(
    instance: &mut Instance,
    signed_commit: SignedMessage,
) -> Result<Option<Decided>, QbftError> {
    Event::ReceiveCommit(ReceiveCommitEvent {
        timestamp: SystemTime::now(),
        origin: signed_commit.signer,
        commit: signed_commit.clone(),
    })
    .publish(&instance.config.event_publisher);

    let value = validate_commit(instance, &signed_commit)?;
    if !instance
        .state
        .commit_container
        .add_if_doesnt_exist(&signed_commit)
    {
        return Ok(None);
    }

    let state = &instance.state;
    let commits = state
        .commit_container
        .messages_for_height_and_round_where(state.height, state.round, |msg| {
            has_commit_value(&msg.message, &value)
        });
    if !instance
        .share()
        .has_quorum(commits.iter().map(|commit| &commit.signer))
    {
        return Ok(None);
    }

    let round = state.round;
    match DecidedMessage::aggregate(commits) {
        Some(decided_message) => Ok(Some(instance.decide(value, round, decided_message))),
        None => Ok(None),
    }
}

/// Check the commit against the accepted proposal, returning the committed value.
fn validate_commit(instance: &Instance, signed_commit: &SignedMessage) -> Result<Vec<u8>, QbftError> {
    let state = &instance.state;
    let accepted_value = state
        .accepted_value()?
        .ok_or(QbftError::NoProposalForRound(state.round))?;
    let commit_data = signed_commit.message.commit_data()?;

    if signed_commit.message.round != state.round {
        return Err(QbftError::WrongRound {
            expected: state.round,
            actual: signed_commit.message.round,
        });
    }
    if commit_data.data != accepted_value {
        return Err(QbftError::DataMismatch);
    }
    Ok(commit_data.data)
}

fn has_commit_value(message: &Message, value: &[u8]) -> bool {
    message
        .commit_data()
        .map(|commit_data| commit_data.data == value)
        .unwrap_or(false)
}

/// Create a commit for `value` in the instance's current round.
pub(super) fn create_commit(instance: &Instance, value: Vec<u8>) -> SignedMessage {
    let message = Message::new(
        MessageType::Commit,
        instance.state.height,
        instance.state.round,
        instance.state.id.clone(),
        &CommitData { data: value },
    );
    SignedMessage::new(
        &instance.config.keypair,
        instance.me(),
        instance.config.domain(),
        message,
    )
}
