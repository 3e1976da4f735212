/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for deciding one value per height among a committee of `n = 3f + 1` operators.
//!
//! ## Phases
//!
//! QBFT decides a value in up to three phases per round:
//! 1. "Propose" phase: the [leader](roles::select_leader) of the round broadcasts a
//!    [`Proposal`](messages::MessageType::Proposal) for a value. Operators check that the proposal comes
//!    from the leader, that its value passes the [`ValueCheck`](config::ValueCheck), and, in rounds after
//!    the first, that it is justified by a quorum of round changes.
//! 2. "Prepare" phase: operators that accepted the proposal broadcast a
//!    [`Prepare`](messages::MessageType::Prepare) for its value. On a quorum of prepares for that exact
//!    value, an operator records the value as its last prepared value.
//! 3. "Commit" phase: operators that saw a prepare quorum broadcast a
//!    [`Commit`](messages::MessageType::Commit). On a quorum of commits for that exact value, the
//!    instance decides.
//!
//! ## Round changes
//!
//! Every round is guarded by a [timer](timer::RoundTimer). When it expires, operators broadcast a
//! [`RoundChange`](messages::MessageType::RoundChange) carrying their last prepared round and value and
//! the prepare quorum that justifies them. A quorum of round changes for a higher round moves an
//! operator into that round, and the new round's leader must re-propose the highest prepared value
//! among them if there is one. This is what keeps a value that may have been decided in an earlier
//! round from being replaced in a later one.
//!
//! ## Quorums
//!
//! Quorums are always counted over distinct signers, and prepare and commit quorums only count messages
//! for the exact value in question. Quorum sizes come from the committee [`Share`](crate::types::share::Share).
//!
//! ## Components
//!
//! - [`Instance`](instance::Instance) runs one height to a decision.
//! - [`Controller`](controller::Controller) starts instances at increasing heights and persists decisions.
//! - [`Config`](config::Config) bundles the collaborators both need.

pub mod messages;

pub mod msg_container;

pub mod state;

pub mod config;

pub mod roles;

pub mod timer;

pub mod instance;

pub mod controller;

mod proposal;

mod prepare;

mod commit;

mod round_change;
