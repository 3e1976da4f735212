/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of one duty at a time, from consensus to the reconstructed validator signature.
//!
//! ## Duty life-cycle
//!
//! 1. [`can_start_new_duty`](DutyRunner::can_start_new_duty) checks that the previous duty is done.
//! 2. [`start_new_instance`](DutyRunner::start_new_instance) starts a QBFT instance for the duty's
//!    [`ConsensusData`] and replaces the runner's [`DutyExecutionState`].
//! 3. The runner feeds QBFT messages to its [`Controller`]. When the running instance decides, the runner
//!    [decides](DutyRunner::decide_running_instance): it saves the decided duty, partially signs the
//!    decided object and broadcasts the partial signature.
//! 4. The runner collects other operators' partial signatures. Once it holds a partial quorum, it
//!    [reconstructs](DutyRunner::reconstruct_signed_duty) the validator's signature.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::{Instant, SystemTime},
};

use crate::{
    events::{CollectPartialSigEvent, Event, ReconstructSignatureEvent, SignPartialEvent, StartDutyEvent},
    qbft::{
        config::Config,
        controller::Controller,
        instance::{Decided, QbftError},
        messages::{DecidedMessage, MessageError, SignedMessage},
    },
    storage::StorageError,
    threshold::{self, ThresholdError},
    types::{
        data_types::{BlsPublicKeyBytes, BlsSignatureBytes, Height, MessageID, OperatorID, Slot},
        share::Share,
    },
};

use super::{
    beacon::{Attestation, BeaconRole, BeaconSigner, ConsensusData, Duty, SignedBeaconBlock, SignerError},
    partial_sig::{ensure_root, PartialSignatureMessage, SignedPartialSignatureMessage},
};

/// Number of slots after a decided duty's slot during which a new duty may not start unless the
/// decided duty's partial signatures reached a quorum.
pub const POST_CONSENSUS_SIG_COLLECTION_SLOT_TIMEOUT: u64 = 32;

/// Post-consensus progress of the duty a runner is executing.
pub struct DutyExecutionState {
    share: Arc<Share>,
    height: Height,
    decided_value: Option<ConsensusData>,
    signed_attestation: Option<Attestation>,
    signed_proposal: Option<SignedBeaconBlock>,
    collected_partial_sigs: BTreeMap<OperatorID, BlsSignatureBytes>,
    /// Partial signatures received before the duty decided, checked against the signing root once it
    /// is known.
    pending_partial_sigs: BTreeMap<OperatorID, PartialSignatureMessage>,
    post_consensus_sig_root: Vec<u8>,
}

impl DutyExecutionState {
    /// Create the execution state of a duty whose consensus runs at `height`.
    pub fn new(share: Arc<Share>, height: Height) -> DutyExecutionState {
        DutyExecutionState {
            share,
            height,
            decided_value: None,
            signed_attestation: None,
            signed_proposal: None,
            collected_partial_sigs: BTreeMap::new(),
            pending_partial_sigs: BTreeMap::new(),
            post_consensus_sig_root: Vec::new(),
        }
    }

    /// Record `msg`'s partial signature, unless one from the same signer is already recorded.
    ///
    /// Returns whether the partial signature was recorded.
    pub fn add_partial_sig(&mut self, msg: &PartialSignatureMessage) -> bool {
        if self.collected_partial_sigs.contains_key(&msg.signer) {
            return false;
        }
        self.collected_partial_sigs
            .insert(msg.signer, msg.partial_signature);
        true
    }

    pub fn has_post_consensus_sig_quorum(&self) -> bool {
        self.share
            .has_partial_quorum(self.collected_partial_sigs.len())
    }

    /// Reconstruct the validator's signature over the decided attestation and return the attestation
    /// carrying it.
    pub fn reconstruct_attestation_sig(&self) -> Result<Attestation, DutyError> {
        let attestation = self
            .signed_attestation
            .as_ref()
            .ok_or(DutyError::NotDecided(self.height))?;
        Ok(Attestation {
            signature: self.reconstruct_signature()?,
            ..attestation.clone()
        })
    }

    /// Reconstruct the validator's signature over the decided beacon block.
    pub fn reconstruct_beacon_block_sig(&self) -> Result<SignedBeaconBlock, DutyError> {
        let signed_block = self
            .signed_proposal
            .as_ref()
            .ok_or(DutyError::NotDecided(self.height))?;
        Ok(SignedBeaconBlock {
            signature: self.reconstruct_signature()?,
            ..signed_block.clone()
        })
    }

    /// Combine the collected partial signatures into a validator signature over the post-consensus
    /// signing root.
    ///
    /// Fails without a partial quorum, if any collected partial signature does not verify under its
    /// signer's share public key, or if the result does not verify under the validator public key.
    pub fn reconstruct_signature(&self) -> Result<BlsSignatureBytes, DutyError> {
        if !self.has_post_consensus_sig_quorum() {
            return Err(DutyError::NoPostConsensusQuorum {
                needed: self.share.partial_quorum(),
                got: self.collected_partial_sigs.len(),
            });
        }
        for (signer, partial_signature) in &self.collected_partial_sigs {
            let operator = self
                .share
                .operator(signer)
                .ok_or(MessageError::UnknownSigner(*signer))?;
            threshold::verify(
                &operator.share_pub_key,
                &self.post_consensus_sig_root,
                partial_signature,
            )
            .map_err(|_| DutyError::InvalidPartialSignature(*signer))?;
        }

        let signature = threshold::reconstruct(&self.collected_partial_sigs)?;
        threshold::verify(
            self.share.validator_pub_key(),
            &self.post_consensus_sig_root,
            &signature,
        )?;
        Ok(signature)
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn decided_value(&self) -> Option<&ConsensusData> {
        self.decided_value.as_ref()
    }

    pub fn signed_attestation(&self) -> Option<&Attestation> {
        self.signed_attestation.as_ref()
    }

    pub fn signed_proposal(&self) -> Option<&SignedBeaconBlock> {
        self.signed_proposal.as_ref()
    }

    pub fn collected_partial_sigs(&self) -> &BTreeMap<OperatorID, BlsSignatureBytes> {
        &self.collected_partial_sigs
    }

    pub fn post_consensus_sig_root(&self) -> &[u8] {
        &self.post_consensus_sig_root
    }

    pub fn pending_partial_sigs(&self) -> &BTreeMap<OperatorID, PartialSignatureMessage> {
        &self.pending_partial_sigs
    }

    /// Hold `msg` until the duty decides. Only the first message from each signer is held.
    fn hold_partial_sig(&mut self, msg: &PartialSignatureMessage) {
        self.pending_partial_sigs
            .entry(msg.signer)
            .or_insert_with(|| msg.clone());
    }

    /// Move the held partial signatures over the post-consensus signing root into the collection and
    /// drop the rest. Returns the signers whose partial signatures were recorded.
    fn release_pending_partial_sigs(&mut self) -> Vec<OperatorID> {
        let pending = std::mem::take(&mut self.pending_partial_sigs);
        let mut recorded = Vec::new();
        for (signer, msg) in pending {
            if msg.signing_root != self.post_consensus_sig_root {
                log::warn!(
                    "dropping early partial signature from operator {}: over a different root",
                    signer
                );
                continue;
            }
            if self.add_partial_sig(&msg) {
                recorded.push(signer);
            }
        }
        recorded
    }
}

/// A duty's decided object carrying the reconstructed validator signature, ready for submission to
/// the beacon chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignedDuty {
    Attestation(Attestation),
    BeaconBlock(SignedBeaconBlock),
}

/// Executes the duties of one role of one validator, one duty at a time.
pub struct DutyRunner {
    role: BeaconRole,
    controller: Controller,
    signer: Arc<dyn BeaconSigner>,
    duty_execution_state: Option<DutyExecutionState>,
}

impl DutyRunner {
    pub fn new(role: BeaconRole, config: Arc<Config>, signer: Arc<dyn BeaconSigner>) -> DutyRunner {
        let identifier = MessageID::new(config.share.validator_pub_key(), role.code());
        DutyRunner {
            role,
            controller: Controller::new(identifier, config),
            signer,
            duty_execution_state: None,
        }
    }

    /// Check whether `duty` may start now.
    ///
    /// A new duty may start if no duty ran before, or if the running duty's instance decided and either
    /// its partial signatures reached a quorum or [`POST_CONSENSUS_SIG_COLLECTION_SLOT_TIMEOUT`] slots
    /// passed since its slot. Duties for another role or validator are always rejected.
    pub fn can_start_new_duty(&self, duty: &Duty) -> Result<(), DutyError> {
        if duty.role != self.role {
            return Err(DutyError::RoleMismatch {
                expected: self.role,
                actual: duty.role,
            });
        }
        if &duty.pub_key != self.validator_pub_key() {
            return Err(DutyError::ValidatorMismatch);
        }

        let state = match &self.duty_execution_state {
            Some(state) => state,
            None => return Ok(()),
        };
        let decided = self
            .controller
            .instance_for_height(state.height)
            .map_or(true, |instance| instance.is_decided().0);
        if !decided {
            return Err(DutyError::ConsensusRunning);
        }
        if let Some(decided_value) = &state.decided_value {
            if !state.has_post_consensus_sig_quorum()
                && decided_value.duty.slot + POST_CONSENSUS_SIG_COLLECTION_SLOT_TIMEOUT > duty.slot
            {
                return Err(DutyError::PostConsensusRunning);
            }
        }
        Ok(())
    }

    /// Start a QBFT instance for `data` at the controller's next height, replacing the execution state
    /// of the previous duty.
    ///
    /// Returns the runner's own partial signature message if the instance decided immediately.
    pub fn start_new_instance(
        &mut self,
        data: &ConsensusData,
        now: Instant,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let decided = self.controller.start_new_instance(data.encode(), now)?;
        let height = self.controller.height();
        self.duty_execution_state = Some(DutyExecutionState::new(
            self.controller.config().share.clone(),
            height,
        ));

        Event::StartDuty(StartDutyEvent {
            timestamp: SystemTime::now(),
            role: self.role,
            slot: data.duty.slot,
            height,
        })
        .publish(&self.controller.config().event_publisher);

        self.on_decided(decided)
    }

    /// Get the execution state of the duty whose consensus ran at `height`, if it is the current duty.
    pub fn post_consensus_state_for_height(&self, height: Height) -> Option<&DutyExecutionState> {
        self.duty_execution_state
            .as_ref()
            .filter(|state| state.height == height)
    }

    fn post_consensus_state_for_height_mut(
        &mut self,
        height: Height,
    ) -> Option<&mut DutyExecutionState> {
        self.duty_execution_state
            .as_mut()
            .filter(|state| state.height == height)
    }

    /// Save `decided_value` and partially sign its role-specific object.
    ///
    /// The runner's own partial signature is recorded in the execution state and broadcast; the signed
    /// message is also returned.
    pub fn decide_running_instance(
        &mut self,
        decided_value: ConsensusData,
    ) -> Result<SignedPartialSignatureMessage, DutyError> {
        let height = self
            .duty_execution_state
            .as_ref()
            .map(|state| state.height)
            .ok_or(DutyError::NoRunningDuty)?;
        if decided_value.duty.role != self.role {
            return Err(DutyError::RoleMismatch {
                expected: self.role,
                actual: decided_value.duty.role,
            });
        }

        let config = self.controller.config().clone();
        config
            .storage
            .save_decided_duty(self.controller.identifier(), &decided_value)?;

        let (partial_signature, root, signed_attestation, signed_proposal) = match self.role {
            BeaconRole::Attester => {
                let attestation_data = decided_value
                    .attestation_data
                    .as_ref()
                    .ok_or(DutyError::MissingDutyData(self.role))?;
                let (attestation, root) = self
                    .signer
                    .sign_attestation(attestation_data, &decided_value.duty)?;
                (attestation.signature, root, Some(attestation), None)
            }
            BeaconRole::Proposer => {
                let block = decided_value
                    .block_data
                    .as_ref()
                    .ok_or(DutyError::MissingDutyData(self.role))?;
                let (signed_block, root) =
                    self.signer.sign_beacon_block(block, &decided_value.duty)?;
                (signed_block.signature, root, None, Some(signed_block))
            }
            BeaconRole::Aggregator | BeaconRole::SyncCommittee => {
                return Err(DutyError::UnsupportedDuty(decided_value.duty.role))
            }
        };
        let root = ensure_root(&root);

        let message = PartialSignatureMessage {
            identifier: self.controller.identifier().clone(),
            height,
            partial_signature,
            signing_root: root.clone(),
            signer: config.share.operator_id(),
        };
        let signed = SignedPartialSignatureMessage::new(&config.keypair, config.domain(), message);

        let state = self
            .duty_execution_state
            .as_mut()
            .ok_or(DutyError::NoRunningDuty)?;
        state.decided_value = Some(decided_value);
        state.signed_attestation = signed_attestation;
        state.signed_proposal = signed_proposal;
        state.post_consensus_sig_root = root.clone();
        state.collected_partial_sigs = BTreeMap::new();
        state.add_partial_sig(&signed.message);
        let released = state.release_pending_partial_sigs();

        Event::SignPartial(SignPartialEvent {
            timestamp: SystemTime::now(),
            role: self.role,
            height,
            signing_root: root,
        })
        .publish(&config.event_publisher);
        for signer in released {
            Event::CollectPartialSig(CollectPartialSigEvent {
                timestamp: SystemTime::now(),
                role: self.role,
                height,
                signer,
            })
            .publish(&config.event_publisher);
        }

        config.network.broadcast(signed.clone().into());
        Ok(signed)
    }

    /// Feed a QBFT message to the controller, deciding the running duty if the message completes its
    /// instance.
    pub fn process_consensus_msg(
        &mut self,
        msg: SignedMessage,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let decided = self.controller.process_msg(msg)?;
        self.on_decided(decided)
    }

    /// Feed a peer's decided message to the controller, deciding the running duty if the message is for
    /// its instance.
    pub fn process_decided_msg(
        &mut self,
        decided_message: DecidedMessage,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let decided = self.controller.process_decided_msg(decided_message)?;
        self.on_decided(decided)
    }

    /// Drive the round timer of the running instance.
    pub fn tick(&mut self, now: Instant) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let decided = self.controller.tick(now)?;
        self.on_decided(decided)
    }

    /// Record a peer's partial signature for the current duty.
    ///
    /// The message must verify under its signer's operator key, be for the height of the current duty,
    /// and be over the post-consensus signing root this runner computed. A message that arrives before
    /// the current duty decided is held, and recorded when the duty decides if it is over the signing
    /// root computed then. Returns whether the partial signature was newly recorded.
    pub fn process_partial_sig_msg(
        &mut self,
        msg: &SignedPartialSignatureMessage,
    ) -> Result<bool, DutyError> {
        msg.verify(&self.controller.config().share)?;
        if &msg.message.identifier != self.controller.identifier() {
            return Err(QbftError::WrongIdentifier.into());
        }

        let role = self.role;
        let height = msg.message.height;
        let event_publisher = self.controller.config().event_publisher.clone();
        let state = self
            .post_consensus_state_for_height_mut(height)
            .ok_or(DutyError::NoDutyForHeight(height))?;
        if state.decided_value.is_none() {
            state.hold_partial_sig(&msg.message);
            return Ok(false);
        }
        if msg.message.signing_root != state.post_consensus_sig_root {
            return Err(DutyError::WrongSigningRoot(msg.signer()));
        }

        let added = state.add_partial_sig(&msg.message);
        if added {
            Event::CollectPartialSig(CollectPartialSigEvent {
                timestamp: SystemTime::now(),
                role,
                height,
                signer: msg.signer(),
            })
            .publish(&event_publisher);
        }
        Ok(added)
    }

    /// Reconstruct the validator signature over the current duty's decided object.
    pub fn reconstruct_signed_duty(&self) -> Result<SignedDuty, DutyError> {
        let state = self
            .duty_execution_state
            .as_ref()
            .ok_or(DutyError::NoRunningDuty)?;
        let signed_duty = match self.role {
            BeaconRole::Attester => SignedDuty::Attestation(state.reconstruct_attestation_sig()?),
            BeaconRole::Proposer => SignedDuty::BeaconBlock(state.reconstruct_beacon_block_sig()?),
            BeaconRole::Aggregator | BeaconRole::SyncCommittee => {
                return Err(DutyError::UnsupportedDuty(self.role))
            }
        };

        let signature = match &signed_duty {
            SignedDuty::Attestation(attestation) => attestation.signature,
            SignedDuty::BeaconBlock(signed_block) => signed_block.signature,
        };
        Event::ReconstructSignature(ReconstructSignatureEvent {
            timestamp: SystemTime::now(),
            role: self.role,
            height: state.height,
            signature,
        })
        .publish(&self.controller.config().event_publisher);
        Ok(signed_duty)
    }

    pub fn role(&self) -> BeaconRole {
        self.role
    }

    pub fn validator_pub_key(&self) -> &BlsPublicKeyBytes {
        self.controller.config().share.validator_pub_key()
    }

    pub fn identifier(&self) -> &MessageID {
        self.controller.identifier()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn duty_execution_state(&self) -> Option<&DutyExecutionState> {
        self.duty_execution_state.as_ref()
    }

    /// Slot of the decided duty, if the current duty has decided.
    pub fn decided_slot(&self) -> Option<Slot> {
        self.duty_execution_state
            .as_ref()
            .and_then(|state| state.decided_value.as_ref())
            .map(|decided_value| decided_value.duty.slot)
    }

    /// Decide the current duty if `decided` is for its instance.
    fn on_decided(
        &mut self,
        decided: Option<Decided>,
    ) -> Result<Option<SignedPartialSignatureMessage>, DutyError> {
        let decided = match decided {
            Some(decided) => decided,
            None => return Ok(None),
        };
        let is_current_duty = self
            .duty_execution_state
            .as_ref()
            .is_some_and(|state| state.height == decided.height() && state.decided_value.is_none());
        if !is_current_duty {
            return Ok(None);
        }
        let decided_value = ConsensusData::decode(&decided.value)?;
        self.decide_running_instance(decided_value).map(Some)
    }
}

/// The different ways in which executing a duty can fail.
#[derive(Debug)]
pub enum DutyError {
    // Duty admission.
    RoleMismatch { expected: BeaconRole, actual: BeaconRole },
    ValidatorMismatch,
    ConsensusRunning,
    PostConsensusRunning,
    UnsupportedDuty(BeaconRole),
    MissingDutyData(BeaconRole),
    // Post-consensus.
    NoRunningDuty,
    NoDutyForHeight(Height),
    NotDecided(Height),
    WrongSigningRoot(OperatorID),
    NoPostConsensusQuorum { needed: u64, got: usize },
    InvalidPartialSignature(OperatorID),
    SignatureCollectionTimeout { collected: usize },
    CollectionChannelClosed,
    Poisoned,
    // Wrapped.
    Qbft(QbftError),
    Message(MessageError),
    Threshold(ThresholdError),
    Signer(SignerError),
    Storage(StorageError),
}

impl Display for DutyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DutyError::RoleMismatch { expected, actual } => {
                write!(f, "duty runner role {} != duty role {}", expected, actual)
            }
            DutyError::ValidatorMismatch => f.write_str("duty runner validator pk != duty pk"),
            DutyError::ConsensusRunning => f.write_str("consensus on duty is running"),
            DutyError::PostConsensusRunning => {
                f.write_str("post consensus sig collection is running")
            }
            DutyError::UnsupportedDuty(role) => write!(f, "unknown duty {}", role),
            DutyError::MissingDutyData(role) => {
                write!(f, "decided value has no data to sign for duty {}", role)
            }
            DutyError::NoRunningDuty => f.write_str("no duty is running"),
            DutyError::NoDutyForHeight(height) => write!(f, "no duty running at height {}", height),
            DutyError::NotDecided(height) => write!(f, "duty at height {} has not decided", height),
            DutyError::WrongSigningRoot(signer) => {
                write!(f, "partial signature from {} is over a different root", signer)
            }
            DutyError::NoPostConsensusQuorum { needed, got } => {
                write!(f, "need {} partial signatures, got {}", needed, got)
            }
            DutyError::InvalidPartialSignature(signer) => {
                write!(f, "partial signature from {} does not verify", signer)
            }
            DutyError::SignatureCollectionTimeout { collected } => write!(
                f,
                "timed out waiting for post consensus signatures ({} collected)",
                collected
            ),
            DutyError::CollectionChannelClosed => {
                f.write_str("partial signature channel closed")
            }
            DutyError::Poisoned => f.write_str("duty runner lock poisoned"),
            DutyError::Qbft(err) => write!(f, "could not run QBFT instance: {}", err),
            DutyError::Message(err) => write!(f, "invalid message: {}", err),
            DutyError::Threshold(err) => write!(f, "could not reconstruct signature: {}", err),
            DutyError::Signer(err) => write!(f, "failed to sign duty: {}", err),
            DutyError::Storage(err) => write!(f, "could not save decided duty: {}", err),
        }
    }
}

impl From<QbftError> for DutyError {
    fn from(value: QbftError) -> Self {
        DutyError::Qbft(value)
    }
}

impl From<MessageError> for DutyError {
    fn from(value: MessageError) -> Self {
        DutyError::Message(value)
    }
}

impl From<ThresholdError> for DutyError {
    fn from(value: ThresholdError) -> Self {
        DutyError::Threshold(value)
    }
}

impl From<SignerError> for DutyError {
    fn from(value: SignerError) -> Self {
        DutyError::Signer(value)
    }
}

impl From<StorageError> for DutyError {
    fn from(value: StorageError) -> Self {
        DutyError::Storage(value)
    }
}
