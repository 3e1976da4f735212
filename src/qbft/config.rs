/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The static dependency bundle shared by a [`Controller`](super::controller::Controller) and every
//! [`Instance`](super::instance::Instance) it creates.

use std::{
    sync::{mpsc::Sender, Arc},
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    events::Event,
    networking::Network,
    storage::Storage,
    types::{crypto_primitives::Keypair, data_types::DomainType, share::Share},
};

/// Predicate that decides whether a proposed value may be accepted, e.g., whether signing it would be
/// slashable. Returns a description of the problem if the value must be rejected.
pub type ValueCheck = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

/// Everything an instance needs besides its own [`State`](super::state::State).
///
/// Instances hold a `Config` behind an `Arc` and never mutate it.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Config]. On the builder call the following methods to construct a valid [Config].

    Required:
    - `.keypair(...)`
    - `.share(...)`
    - `.value_check(...)`
    - `.network(...)`
    - `.storage(...)`
    - `.round_timeout(...)`

    Optional:
    - `.event_publisher(...)`
"))]
pub struct Config {
    #[builder(setter(
        transform = |signing_key: SigningKey| Keypair::new(signing_key),
        doc = "Set the operator's keypair, used to sign QBFT messages. Required."
    ))]
    pub keypair: Keypair,
    #[builder(setter(doc = "Set the committee descriptor. Required."))]
    pub share: Arc<Share>,
    #[builder(setter(
        transform = |check: impl Fn(&[u8]) -> Result<(), String> + Send + Sync + 'static| Arc::new(check) as ValueCheck,
        doc = "Set the predicate that proposed values must pass. Required."
    ))]
    pub value_check: ValueCheck,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    pub network: Arc<dyn Network>,
    #[builder(setter(doc = "Set the storage for decided values. Required."))]
    pub storage: Arc<dyn Storage>,
    #[builder(setter(doc = "Set the duration of the first round. Later rounds last exponentially longer. Required."))]
    pub round_timeout: Duration,
    #[builder(default, setter(doc = "Set the channel that events are published into. Optional."))]
    pub event_publisher: Option<Sender<Event>>,
}

impl Config {
    pub fn domain(&self) -> DomainType {
        self.share.domain_type()
    }
}
