/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of QBFT consensus for distributed validators, together with the duty layer
//! that turns each decided duty into a validator signature through threshold BLS.
//!
//! A committee of `n = 3f + 1` operators holds shares of one validator's BLS key. For every duty the
//! beacon chain assigns the validator, the committee:
//! 1. Runs a [QBFT](qbft) instance to agree on exactly one value to sign, despite up to `f` faulty
//!    operators.
//! 2. Has every operator partially sign the decided value with its key share, and
//!    [reconstructs](threshold) the validator's signature from a quorum of partial signatures.
//!
//! Library users start a [`Validator`](duty::validator::Validator) from a
//! [`ValidatorSpec`](duty::validator::ValidatorSpec), and provide the pluggable
//! [networking](networking::Network), [storage](storage::Storage) and
//! [signing](duty::beacon::BeaconSigner) implementations.

pub mod types;

pub mod qbft;

pub mod duty;

pub mod threshold;

pub mod networking;

pub mod storage;

pub mod events;

pub mod event_bus;

pub mod logging;
