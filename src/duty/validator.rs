/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Entry point of the library: one [`Validator`] runs the duties of one validator for a set of roles.
//!
//! ## Starting a validator
//!
//! A validator is started from a [`ValidatorSpec`], built with the builder pattern:
//!
//! ```ignore
//! let validator =
//!     ValidatorSpec::builder()
//!     .keypair(operator_signing_key)
//!     .share(share)
//!     .signer(signer)
//!     .network(network)
//!     .storage(storage)
//!     .round_timeout(Duration::from_secs(2))
//!     .signature_collection_timeout(Duration::from_secs(4))
//!     .build()
//!     .start();
//! ```
//!
//! ## Driving a validator
//!
//! The validator runs no protocol threads of its own. The library user:
//! 1. Calls [`start_duty`](Validator::start_duty) when the beacon node assigns a duty.
//! 2. Passes every message received from the network to [`process_message`](Validator::process_message).
//! 3. Calls [`tick`](Validator::tick) regularly so that round timers fire.
//! 4. Calls [`collect_post_consensus_sigs`](Validator::collect_post_consensus_sigs) once a duty has
//!    decided to wait for the reconstructed signature.
//!
//! All of these take `&self`, and may be called from different threads. Each role's [`DutyRunner`]
//! sits behind its own lock, so messages for different roles are processed in parallel while messages
//! for the same role are processed one at a time.

use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    event_bus::{start_event_bus, EventHandlers, HandlerPtr},
    events::Event,
    networking::{Message, Network},
    qbft::{config::Config, instance::QbftError},
    storage::Storage,
    types::{
        data_types::{BlsPublicKeyBytes, MessageID},
        share::Share,
    },
};

use super::{
    beacon::{BeaconRole, BeaconSigner, ConsensusData},
    collection,
    partial_sig::SignedPartialSignatureMessage,
    runner::{DutyError, DutyRunner, SignedDuty},
};

/// Predicate over a proposed duty, e.g., a slashing protection check. Returns a description of the
/// problem if the duty must not be signed.
pub type DutyCheck = Arc<dyn Fn(&ConsensusData) -> Result<(), String> + Send + Sync>;

/// Stores everything needed to start a [`Validator`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ValidatorSpec]. On the builder call the following methods to construct a valid [ValidatorSpec].

    Required:
    - `.keypair(...)`
    - `.share(...)`
    - `.signer(...)`
    - `.network(...)`
    - `.storage(...)`
    - `.round_timeout(...)`
    - `.signature_collection_timeout(...)`

    Optional:
    - `.duty_check(...)`
    - `.roles(...)`
    - `.log_events(...)`
    - `.handlers(...)`
"))]
pub struct ValidatorSpec {
    #[builder(setter(doc = "Set the operator's keypair, used to sign QBFT and partial signature messages. Required."))]
    keypair: SigningKey,
    #[builder(setter(doc = "Set the committee descriptor of the validator. Required."))]
    share: Arc<Share>,
    #[builder(setter(doc = "Set the signer holding the operator's share of the validator key. Required."))]
    signer: Arc<dyn BeaconSigner>,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    network: Arc<dyn Network>,
    #[builder(setter(doc = "Set the storage for decided values and duties. Required."))]
    storage: Arc<dyn Storage>,
    #[builder(setter(doc = "Set the duration of the first round of every instance. Required."))]
    round_timeout: Duration,
    #[builder(setter(doc = "Set how long to wait for a quorum of partial signatures after a duty decides. Required."))]
    signature_collection_timeout: Duration,
    #[builder(
        default = Arc::new(|_: &ConsensusData| -> Result<(), String> { Ok(()) }) as DutyCheck,
        setter(
            transform = |check: impl Fn(&ConsensusData) -> Result<(), String> + Send + Sync + 'static| Arc::new(check) as DutyCheck,
            doc = "Set the check that proposed duties must pass besides matching the runner's role and validator. Optional."
        )
    )]
    duty_check: DutyCheck,
    #[builder(
        default = vec![BeaconRole::Attester, BeaconRole::Proposer],
        setter(doc = "Set the roles to run duties for. Optional, defaults to attester and proposer.")
    )]
    roles: Vec<BeaconRole>,
    #[builder(default = true, setter(doc = "Enable the default event loggers? Optional, defaults to true."))]
    log_events: bool,
    #[builder(default, setter(doc = "Set additional handlers for the events the validator publishes. Optional."))]
    handlers: Vec<HandlerPtr<Event>>,
}

impl ValidatorSpec {
    /// Create a [`DutyRunner`] for every role and start the event bus, if there are event handlers.
    pub fn start(self) -> Validator {
        let event_handlers = EventHandlers::new(self.log_events, self.handlers);
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let validator_pub_key = *self.share.validator_pub_key();
        let runners = self
            .roles
            .into_iter()
            .map(|role| {
                let duty_check = self.duty_check.clone();
                let config = Config::builder()
                    .keypair(self.keypair.clone())
                    .share(self.share.clone())
                    .value_check(move |value: &[u8]| {
                        check_consensus_data(value, role, &validator_pub_key, &duty_check)
                    })
                    .network(self.network.clone())
                    .storage(self.storage.clone())
                    .round_timeout(self.round_timeout)
                    .event_publisher(event_publisher.clone())
                    .build();
                let runner = DutyRunner::new(role, Arc::new(config), self.signer.clone());
                (role, Mutex::new(runner))
            })
            .collect();

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(shutdown_receiver)) => Some(start_event_bus(
                event_handlers,
                event_subscriber,
                shutdown_receiver,
            )),
            _ => None,
        };

        Validator {
            share: self.share,
            runners,
            signature_collection_timeout: self.signature_collection_timeout,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// Check that `value` is an encoded [`ConsensusData`] for `role` of the validator, that an attester
/// duty places the validator inside its committee, and that it passes `duty_check`.
fn check_consensus_data(
    value: &[u8],
    role: BeaconRole,
    validator_pub_key: &BlsPublicKeyBytes,
    duty_check: &DutyCheck,
) -> Result<(), String> {
    let data = ConsensusData::decode(value).map_err(|err| err.to_string())?;
    if data.duty.role != role {
        return Err(format!("duty role {} != runner role {}", data.duty.role, role));
    }
    if &data.duty.pub_key != validator_pub_key {
        return Err(String::from("duty pk != validator pk"));
    }
    if role == BeaconRole::Attester {
        data.duty
            .check_committee_position()
            .map_err(|err| err.to_string())?;
    }
    duty_check(&data)
}

/// A handle to the duty runners of one validator. When this value is dropped, the event bus thread is
/// shut down.
pub struct Validator {
    share: Arc<Share>,
    runners: BTreeMap<BeaconRole, Mutex<DutyRunner>>,
    signature_collection_timeout: Duration,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Validator {
    /// Start consensus on `data` in the runner of its duty's role.
    pub fn start_duty(
        &self,
        data: &ConsensusData,
        now: Instant,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let runner = self
            .runners
            .get(&data.duty.role)
            .ok_or(DutyError::UnsupportedDuty(data.duty.role))?;
        let mut runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
        runner.can_start_new_duty(&data.duty)?;
        runner.start_new_instance(data, now)
    }

    /// Route a message received from the network to the runner of its duty stream.
    pub fn process_message(
        &self,
        message: Message,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let runner = self.runner_for(message.identifier())?;
        let mut runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
        match message {
            Message::Consensus(msg) => runner.process_consensus_msg(msg),
            Message::Decided(decided_message) => runner.process_decided_msg(decided_message),
            Message::PartialSignature(msg) => runner.process_partial_sig_msg(&msg).map(|_| None),
        }
    }

    /// Drive the round timers of every runner.
    pub fn tick(&self, now: Instant) -> Result<(), DutyError> {
        for runner in self.runners.values() {
            let mut runner = runner.lock().map_err(|_| DutyError::Poisoned)?;
            runner.tick(now)?;
        }
        Ok(())
    }

    /// Wait for a quorum of partial signatures for the current duty of `role`, reading them from
    /// `partial_sigs`, and reconstruct the signed duty.
    pub fn collect_post_consensus_sigs(
        &self,
        role: BeaconRole,
        partial_sigs: &Receiver<SignedPartialSignatureMessage>,
    ) -> Result<SignedDuty, DutyError> {
        let runner = self
            .runners
            .get(&role)
            .ok_or(DutyError::UnsupportedDuty(role))?;
        collection::collect_post_consensus_sigs(
            runner,
            partial_sigs,
            self.signature_collection_timeout,
        )
    }

    pub fn runner(&self, role: BeaconRole) -> Option<&Mutex<DutyRunner>> {
        self.runners.get(&role)
    }

    pub fn share(&self) -> &Arc<Share> {
        &self.share
    }

    fn runner_for(&self, identifier: &MessageID) -> Result<&Mutex<DutyRunner>, DutyError> {
        let role = identifier
            .role_code()
            .and_then(BeaconRole::from_code)
            .ok_or(DutyError::Qbft(QbftError::WrongIdentifier))?;
        if identifier != &MessageID::new(self.share.validator_pub_key(), role.code()) {
            return Err(DutyError::Qbft(QbftError::WrongIdentifier));
        }
        self.runners
            .get(&role)
            .ok_or(DutyError::UnsupportedDuty(role))
    }
}

impl Drop for Validator {
    fn drop(&mut self) {
        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("event bus thread panicked");
            }
        }
    }
}
