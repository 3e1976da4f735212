/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across the QBFT subprotocol and the duty layer.
//!
//! Types specific to a single component live next to that component, e.g.,
//! [`crate::qbft::messages`] or [`crate::duty::beacon`].

pub mod crypto_primitives;

pub mod data_types;

pub mod share;

pub mod signing;
