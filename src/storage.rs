/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence of decided values.
//!
//! The protocol code talks to a [`Storage`]. Library users either implement `Storage` directly, or
//! implement the lower level [`KVStore`] trait for their key-value database of choice and wrap it in a
//! [`KVStorage`].
//!
//! ## Stored variables
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Highest Decided|[`MessageID`] -> [`DecidedMessage`]|The highest decided message of each duty stream. Overwritten only by decided messages of a higher height.|
//! |Decided Duty|[`MessageID`] -> [`ConsensusData`]|The consensus data of the most recent duty that a duty runner decided on.|
//!
//! `Storage` methods are called synchronously, and a decision is only reported to the rest of the
//! crate after `save_highest_decided` returns `Ok`.

use std::{
    fmt::{self, Display, Formatter},
    io,
    sync::Mutex,
};

use borsh::BorshDeserialize;

use crate::{
    duty::beacon::ConsensusData,
    qbft::messages::DecidedMessage,
    types::{data_types::MessageID, signing::encode},
};

pub trait Storage: Send + Sync {
    /// Save `decided` as the highest decided message of its duty stream, unless a decided message of a
    /// higher height is already stored.
    fn save_highest_decided(&self, decided: &DecidedMessage) -> Result<(), StorageError>;

    fn highest_decided(&self, identifier: &MessageID) -> Result<Option<DecidedMessage>, StorageError>;

    /// Save the consensus data a duty runner decided on.
    fn save_decided_duty(
        &self,
        identifier: &MessageID,
        data: &ConsensusData,
    ) -> Result<(), StorageError>;

    fn decided_duty(&self, identifier: &MessageID) -> Result<Option<ConsensusData>, StorageError>;
}

pub trait KVStore: KVGet + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn highest_decided(&self, identifier: &MessageID) -> Result<Option<DecidedMessage>, StorageError> {
        self.get_and_decode(&concat(&HIGHEST_DECIDED, identifier.bytes()))
    }

    fn decided_duty(&self, identifier: &MessageID) -> Result<Option<ConsensusData>, StorageError> {
        self.get_and_decode(&concat(&DECIDED_DUTY, identifier.bytes()))
    }

    fn get_and_decode<T: BorshDeserialize>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.get(key) {
            Some(bytes) => Ok(Some(
                T::deserialize(&mut bytes.as_slice()).map_err(|source| {
                    StorageError::DeserializeValueError {
                        key: key.to_vec(),
                        source,
                    }
                })?,
            )),
            None => Ok(None),
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub(crate) const HIGHEST_DECIDED: [u8; 1] = [0];
pub(crate) const DECIDED_DUTY: [u8; 1] = [1];

/// Takes references to two byteslices and returns a vector containing the bytes of the first one, and
/// then the bytes of the second one.
pub(crate) fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// A [`Storage`] on top of a [`KVStore`].
pub struct KVStorage<K: KVStore> {
    kv_store: Mutex<K>,
}

impl<K: KVStore> KVStorage<K> {
    pub fn new(kv_store: K) -> KVStorage<K> {
        KVStorage {
            kv_store: Mutex::new(kv_store),
        }
    }
}

impl<K: KVStore> Storage for KVStorage<K> {
    fn save_highest_decided(&self, decided: &DecidedMessage) -> Result<(), StorageError> {
        let mut kv_store = self.kv_store.lock().map_err(|_| StorageError::Poisoned)?;
        let identifier = &decided.message.identifier;
        if let Some(stored) = kv_store.highest_decided(identifier)? {
            if stored.height() > decided.height() {
                return Ok(());
            }
        }

        let mut wb = K::WriteBatch::new();
        wb.set(&concat(&HIGHEST_DECIDED, identifier.bytes()), &encode(decided));
        kv_store.write(wb);
        Ok(())
    }

    fn highest_decided(&self, identifier: &MessageID) -> Result<Option<DecidedMessage>, StorageError> {
        let kv_store = self.kv_store.lock().map_err(|_| StorageError::Poisoned)?;
        kv_store.highest_decided(identifier)
    }

    fn save_decided_duty(
        &self,
        identifier: &MessageID,
        data: &ConsensusData,
    ) -> Result<(), StorageError> {
        let mut kv_store = self.kv_store.lock().map_err(|_| StorageError::Poisoned)?;
        let mut wb = K::WriteBatch::new();
        wb.set(&concat(&DECIDED_DUTY, identifier.bytes()), &encode(data));
        kv_store.write(wb);
        Ok(())
    }

    fn decided_duty(&self, identifier: &MessageID) -> Result<Option<ConsensusData>, StorageError> {
        let kv_store = self.kv_store.lock().map_err(|_| StorageError::Poisoned)?;
        kv_store.decided_duty(identifier)
    }
}

#[derive(Debug)]
pub enum StorageError {
    DeserializeValueError { key: Vec<u8>, source: io::Error },
    Poisoned,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::DeserializeValueError { key, source } => {
                write!(f, "could not deserialize value at key {:02x?}: {}", key, source)
            }
            StorageError::Poisoned => f.write_str("storage lock poisoned"),
        }
    }
}
