/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Round changes: abandoning a round that failed to decide.
//!
//! ## Requesting a round change
//!
//! When the round timer expires for round `r`, an operator broadcasts a round change for round `r + 1`
//! (or for one past the round it last requested, whichever is higher) and re-arms its timer for that
//! round. The round change carries the operator's last prepared round and value, and the prepare quorum
//! that justifies them.
//!
//! ## Joining
//!
//! An operator that sees round changes for rounds above its own from a weak quorum (`f + 1`) of distinct
//! operators joins them: it broadcasts a round change for the lowest of those rounds without waiting
//! for its own timer.
//!
//! ## Moving to a new round
//!
//! Upon a quorum of round changes for a round above its current one, an operator moves into that
//! round. If it leads the round, it proposes the highest prepared value reported by the quorum, or its
//! own start value if no member of the quorum prepared anything, justified by the quorum.

use std::time::{Instant, SystemTime};

use crate::{
    events::{Event, ReceiveRoundChangeEvent, RoundTimeoutEvent},
    types::{
        data_types::{Height, MessageID, Round, NO_ROUND},
        share::Share,
    },
};

use super::{
    instance::{Instance, QbftError},
    messages::{Message, MessageType, RoundChangeData, SignedMessage},
    prepare::has_prepare_value,
    proposal::create_proposal,
    roles::is_leader,
};

pub(super) fn upon_round_timeout(instance: &mut Instance, timed_out_round: Round, now: Instant) {
    Event::RoundTimeout(RoundTimeoutEvent {
        timestamp: SystemTime::now(),
        height: instance.state.height,
        round: timed_out_round,
        timeout: instance.timer.timeout_for(timed_out_round),
    })
    .publish(&instance.config.event_publisher);

    let next_round = timed_out_round.max(instance.round_change_round) + 1;
    send_round_change(instance, next_round, now);
}

pub(super) fn upon_round_change(
    instance: &mut Instance,
    signed_round_change: SignedMessage,
    now: Instant,
) -> Result<(), QbftError> {
    Event::ReceiveRoundChange(ReceiveRoundChangeEvent {
        timestamp: SystemTime::now(),
        origin: signed_round_change.signer,
        round_change: signed_round_change.clone(),
    })
    .publish(&instance.config.event_publisher);

    let height = instance.state.height;
    let round = signed_round_change.message.round;
    if round < instance.state.round {
        return Err(QbftError::WrongRound {
            expected: instance.state.round,
            actual: round,
        });
    }
    validate_round_change(
        instance.share(),
        &instance.state.id,
        height,
        &signed_round_change,
    )?;

    if !instance
        .state
        .round_change_container
        .add_if_doesnt_exist(&signed_round_change)
    {
        return Ok(());
    }

    try_join_round_change(instance, now);

    if round <= instance.state.round {
        return Ok(());
    }
    let round_changes: Vec<SignedMessage> = instance
        .state
        .round_change_container
        .messages_for_height_and_round(height, round)
        .into_iter()
        .cloned()
        .collect();
    if !instance
        .share()
        .has_quorum(round_changes.iter().map(|round_change| &round_change.signer))
    {
        return Ok(());
    }

    instance.start_round(round, now);
    if is_leader(&instance.me(), height, round, instance.share()) {
        let (value, prepare_justification) = match highest_prepared(&round_changes)? {
            Some((_, prepared_value, prepares)) => (prepared_value, prepares),
            None => (instance.start_value.clone(), Vec::new()),
        };
        let proposal = create_proposal(
            instance,
            round,
            value,
            round_changes,
            prepare_justification,
        );
        instance.outbox.push_back(proposal);
    }
    Ok(())
}

/// Join the lowest round above this operator's own that a weak quorum of operators asks to move to.
fn try_join_round_change(instance: &mut Instance, now: Instant) {
    let floor = instance.state.round.max(instance.round_change_round);
    let ahead = instance
        .state
        .round_change_container
        .messages_for_height_above_round(instance.state.height, floor);
    if !instance
        .share()
        .has_weak_quorum(ahead.iter().map(|round_change| &round_change.signer))
    {
        return;
    }
    let lowest_round = ahead
        .iter()
        .map(|round_change| round_change.message.round)
        .min();
    if let Some(lowest_round) = lowest_round {
        send_round_change(instance, lowest_round, now);
    }
}

/// Request a move to `round`: re-arm the timer for it and queue a round change for broadcast.
fn send_round_change(instance: &mut Instance, round: Round, now: Instant) {
    instance.round_change_round = round;
    instance.timer.reset(round, now);
    let round_change = create_round_change(instance, round);
    instance.outbox.push_back(round_change);
}

pub(super) fn create_round_change(instance: &Instance, round: Round) -> SignedMessage {
    let state = &instance.state;
    let data = match &state.last_prepared_value {
        Some(prepared_value) if state.last_prepared_round != NO_ROUND => {
            let round_change_justification = state
                .prepare_container
                .messages_for_height_and_round_where(
                    state.height,
                    state.last_prepared_round,
                    |msg| has_prepare_value(&msg.message, prepared_value),
                )
                .into_iter()
                .cloned()
                .collect();
            RoundChangeData {
                prepared_value: prepared_value.clone(),
                prepared_round: state.last_prepared_round,
                round_change_justification,
            }
        }
        _ => RoundChangeData {
            prepared_value: Vec::new(),
            prepared_round: NO_ROUND,
            round_change_justification: Vec::new(),
        },
    };

    let message = Message::new(
        MessageType::RoundChange,
        state.height,
        round,
        state.id.clone(),
        &data,
    );
    SignedMessage::new(
        &instance.config.keypair,
        instance.me(),
        instance.config.domain(),
        message,
    )
}

/// Check a round change's duty stream, signature, height and, if it reports a prepared value, the
/// prepare quorum that justifies it.
pub(super) fn validate_round_change(
    share: &Share,
    identifier: &MessageID,
    height: Height,
    signed_round_change: &SignedMessage,
) -> Result<RoundChangeData, QbftError> {
    let data = signed_round_change.message.round_change_data()?;
    if signed_round_change.message.identifier != *identifier {
        return Err(QbftError::InvalidJustification(
            "round change is for a different duty stream",
        ));
    }
    if signed_round_change.message.height != height {
        return Err(QbftError::WrongHeight {
            expected: height,
            actual: signed_round_change.message.height,
        });
    }
    signed_round_change.verify(share)?;

    if data.has_prepared() {
        if data.prepared_round >= signed_round_change.message.round {
            return Err(QbftError::InvalidJustification(
                "prepared round is not below the round change's round",
            ));
        }
        validate_prepare_quorum(
            share,
            identifier,
            height,
            data.prepared_round,
            &data.prepared_value,
            &data.round_change_justification,
        )?;
    } else if !data.round_change_justification.is_empty() {
        return Err(QbftError::InvalidJustification(
            "round change without a prepared value carries prepares",
        ));
    }
    Ok(data)
}

/// Check that `prepares` is a quorum of valid prepares for `value` in `round` of `height`, all from
/// the duty stream `identifier`.
pub(super) fn validate_prepare_quorum(
    share: &Share,
    identifier: &MessageID,
    height: Height,
    round: Round,
    value: &[u8],
    prepares: &[SignedMessage],
) -> Result<(), QbftError> {
    for prepare in prepares {
        let prepare_data = prepare.message.prepare_data()?;
        if prepare.message.identifier != *identifier {
            return Err(QbftError::InvalidJustification(
                "prepare is for a different duty stream",
            ));
        }
        if prepare.message.height != height || prepare.message.round != round {
            return Err(QbftError::InvalidJustification(
                "prepare is for a different height or round",
            ));
        }
        if prepare_data.data != value {
            return Err(QbftError::InvalidJustification(
                "prepare is for a different value",
            ));
        }
        prepare.verify(share)?;
    }
    if !share.has_quorum(prepares.iter().map(|prepare| &prepare.signer)) {
        return Err(QbftError::InvalidJustification(
            "prepares do not form a quorum",
        ));
    }
    Ok(())
}

/// Among `round_changes`, find the one with the highest prepared round, breaking ties in favour of the
/// lowest signer id. Returns its prepared round, prepared value and prepare quorum, or `None` if no round
/// change reports a prepared value.
pub(super) fn highest_prepared<'a>(
    round_changes: impl IntoIterator<Item = &'a SignedMessage>,
) -> Result<Option<(Round, Vec<u8>, Vec<SignedMessage>)>, QbftError> {
    let mut highest: Option<(Round, &'a SignedMessage, RoundChangeData)> = None;
    for round_change in round_changes {
        let data = round_change.message.round_change_data()?;
        if !data.has_prepared() {
            continue;
        }
        let is_higher = match &highest {
            None => true,
            Some((highest_round, highest_msg, _)) => {
                data.prepared_round > *highest_round
                    || (data.prepared_round == *highest_round
                        && round_change.signer < highest_msg.signer)
            }
        };
        if is_higher {
            highest = Some((data.prepared_round, round_change, data));
        }
    }

    Ok(highest.map(|(round, _, data)| {
        (
            round,
            data.prepared_value,
            data.round_change_justification,
        )
    }))
}
