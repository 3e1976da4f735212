/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Owner of the sequence of [`Instance`]s of one duty stream.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::types::data_types::{Height, MessageID, FIRST_HEIGHT};

use super::{
    config::Config,
    instance::{Decided, Instance, QbftError},
    messages::{DecidedMessage, SignedMessage},
};

/// Number of most recent instances a `Controller` keeps. Older instances are dropped.
pub const INSTANCE_HISTORY: usize = 5;

/// Runs at most one undecided [`Instance`] at a time for one duty stream, at strictly increasing heights.
///
/// Every decision the controller reports has been saved through the [`Storage`](crate::storage::Storage)
/// in its [`Config`] and broadcast as a [`DecidedMessage`] before the call that reports it returns.
pub struct Controller {
    identifier: MessageID,
    height: Height,
    instances: BTreeMap<Height, Instance>,
    config: Arc<Config>,
}

impl Controller {
    pub fn new(identifier: MessageID, config: Arc<Config>) -> Controller {
        Controller {
            identifier,
            height: FIRST_HEIGHT,
            instances: BTreeMap::new(),
            config,
        }
    }

    /// Start an instance for `value` at the next height.
    ///
    /// Fails if the instance at the current height is still running, or if `value` itself fails the
    /// configured value check.
    pub fn start_new_instance(
        &mut self,
        value: Vec<u8>,
        now: Instant,
    ) -> Result<Option<Decided>, QbftError> {
        if let Some(current) = self.instances.get(&self.height) {
            if current.decided().is_none() {
                return Err(QbftError::InstanceAlreadyRunning(self.height));
            }
        }
        (self.config.value_check)(&value).map_err(QbftError::InvalidValue)?;

        let height = if self.instances.is_empty() {
            self.height
        } else {
            self.height + 1
        };
        let mut instance = Instance::new(self.config.clone(), self.identifier.clone(), height, value);
        let decided = instance.start(now)?;
        self.instances.insert(height, instance);
        self.height = height;
        self.prune();

        self.on_decided(decided)
    }

    /// Route a QBFT message to the instance of its height.
    pub fn process_msg(&mut self, msg: SignedMessage) -> Result<Option<Decided>, QbftError> {
        if msg.message.identifier != self.identifier {
            return Err(QbftError::WrongIdentifier);
        }
        let height = msg.message.height;
        let decided = self
            .instances
            .get_mut(&height)
            .ok_or(QbftError::UnknownHeight(height))?
            .process_msg(msg)?;
        self.on_decided(decided)
    }

    /// Accept a decided message from a peer.
    ///
    /// A verified decided message for a running instance forces that instance to decide. Whatever its
    /// height, the message is persisted if it is higher than the stored highest decided message.
    pub fn process_decided_msg(
        &mut self,
        decided_message: DecidedMessage,
    ) -> Result<Option<Decided>, QbftError> {
        if decided_message.message.identifier != self.identifier {
            return Err(QbftError::WrongIdentifier);
        }
        decided_message.verify(&self.config.share)?;

        let decided = match self.instances.get_mut(&decided_message.height()) {
            Some(instance) => instance.force_decide(decided_message.clone())?,
            None => None,
        };
        self.config.storage.save_highest_decided(&decided_message)?;
        if let Some(decided) = &decided {
            log::debug!(
                "decided height {} through a peer's decided message",
                decided.height()
            );
        }
        Ok(decided)
    }

    /// Drive the round timer of the instance at the current height.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Decided>, QbftError> {
        let decided = match self.instances.get_mut(&self.height) {
            Some(instance) => instance.tick(now)?,
            None => None,
        };
        self.on_decided(decided)
    }

    /// Get the instance at `height`, if the controller still holds one.
    pub fn instance_for_height(&self, height: Height) -> Option<&Instance> {
        self.instances.get(&height)
    }

    pub fn instance_for_height_mut(&mut self, height: Height) -> Option<&mut Instance> {
        self.instances.get_mut(&height)
    }

    /// Get the height of the most recently started instance, or [`FIRST_HEIGHT`] if none was started.
    pub fn height(&self) -> Height {
        self.height
    }

    pub fn identifier(&self) -> &MessageID {
        &self.identifier
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Persist and broadcast a fresh decision before reporting it.
    fn on_decided(&self, decided: Option<Decided>) -> Result<Option<Decided>, QbftError> {
        if let Some(decided) = &decided {
            self.config
                .storage
                .save_highest_decided(&decided.decided_message)?;
            self.config
                .network
                .broadcast_decided(decided.decided_message.clone());
        }
        Ok(decided)
    }

    fn prune(&mut self) {
        while self.instances.len() > INSTANCE_HISTORY {
            self.instances.pop_first();
        }
    }
}
