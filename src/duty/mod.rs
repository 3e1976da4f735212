/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The duty layer: runs one [QBFT](crate::qbft) instance per beacon duty, then turns the decided duty
//! into a validator signature by collecting partial signatures from a quorum of operators.

pub mod beacon;

pub mod partial_sig;

pub mod runner;

pub mod collection;

pub mod validator;
