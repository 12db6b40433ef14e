//! The Security Manager Protocol pairing engine.
//!
//! [`Pairing`] drives a single [`PairingControlBlock`] through the state machine in
//! Vol 3 Part H Section 2.3: association-model selection, legacy or Secure Connections
//! key agreement, and the key-distribution walk. Only one pairing is in progress at a
//! time, matching the "single global SMP control block" resource model — a host that
//! needs concurrent pairings across multiple links runs one [`Pairing`] per link.
//!
//! The engine never blocks. Anything that would ("send ECDH keypair request to the
//! crypto collaborator", "wait for the application's IO-capability reply") parks the
//! state machine in the corresponding `Wait*` state; the resuming event is delivered
//! later through one of `Pairing`'s `on_*`/`complete_*` methods, called by the host's
//! event loop.

pub mod codec;
pub mod keys;
pub mod model;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::config::SmpConfig;
use crate::crypto::ecdh::{InvalidPublicKey, PublicKey};
use crate::crypto::{CryptoToolbox, EcdhSecret};
use crate::device_address::DeviceAddress;
use crate::smp::codec::{
    AuthReq, Code, Command, IoCapability, KeyDistribution, OobDataFlag, PairingFailedReason,
    PairingFeatures,
};
use crate::smp::keys::{gate_link_key, next_key_to_send, strip_sc_derived_bits, DistributedKey};
use crate::smp::model::{select_association_model, AssociationModel};
use crate::time::{Duration, Instant, Timer};
use crate::transport::{Psm, Transport, TransportHandle};
use rand_core::{CryptoRng, RngCore};

/// Whether `deadline` has been reached as of `now`. `Instant` only exposes wrapping
/// arithmetic, so this compares via `duration_since`-style wrapping subtraction
/// rather than ordering `Instant`s directly.
fn has_elapsed(now: Instant, deadline: Instant) -> bool {
    let since = Duration::from_micros(now.raw_micros().wrapping_sub(deadline.raw_micros()));
    since < Instant::MAX_TIME_BETWEEN
}

/// Errors surfaced by the pairing engine.
///
/// Every variant here maps to one reaction defined by the propagation policy: `MalformedPdu`
/// and `UnknownOpcode` become `INVALID_PARAMETERS`/dropped depending on PDU direction,
/// `StateViolation` is dropped for responses and replied to for requests, everything else
/// terminates the pairing with the corresponding `AUTH_CMPL` reason.
#[derive(Debug, thiserror::Error)]
pub enum SmpError {
    #[error("malformed SMP PDU")]
    MalformedPdu,
    #[error("unknown SMP opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("PDU not expected in the current pairing state")]
    StateViolation,
    #[error("pairing refused by policy")]
    PolicyRefused,
    #[error("peer reported pairing failure: {0:?}")]
    PeerFailure(PairingFailedReason),
    #[error("cryptographic verification failed")]
    CryptoFailure,
    #[error("transport lost")]
    TransportLost,
    #[error("pairing timed out")]
    Timeout,
}

impl SmpError {
    /// Maps this error to the PDU reason code sent back to the peer, if any.
    ///
    /// Receiving a `Pairing Failed` is itself represented as `PeerFailure` and must never
    /// trigger another `Pairing Failed` in response.
    fn reason(&self) -> Option<PairingFailedReason> {
        Some(match self {
            SmpError::MalformedPdu => PairingFailedReason::InvalidParameters,
            SmpError::UnknownOpcode(_) => PairingFailedReason::CommandNotSupported,
            SmpError::StateViolation => PairingFailedReason::UnspecifiedReason,
            SmpError::PolicyRefused => PairingFailedReason::AuthenticationRequirements,
            SmpError::CryptoFailure => PairingFailedReason::DhKeyCheckFailed,
            SmpError::PeerFailure(_) => return None,
            SmpError::TransportLost | SmpError::Timeout => return None,
        })
    }
}

/// Which side of the pairing this control block represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// States of the LE-transport state machine (Vol 3 Part H Section 2.3.1 / Figure 2.2-2.8).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    WaitAppRsp,
    SecReqPending,
    PairReqSent,
    PairRspPending,
    WaitConfirm,
    ConfirmSent,
    RandPending,
    PublicKeyExch,
    ScPhase1Start,
    WaitNonce,
    ScPhase2Start,
    WaitDhkCheck,
    EncryptionPending,
    BondPending,
    Release,
}

/// States of the parallel cross-transport (BR/EDR) key-derivation state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrState {
    Idle,
    WaitApp,
    PairReqRspPending,
    BondPending,
    Release,
}

/// The outcome reported to the application when a pairing attempt concludes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Success {
        authenticated: bool,
        /// A cross-transport BR/EDR link key derived from the LE LTK (§4.3.6), when
        /// both sides negotiated it. `None` when no derivation was negotiated, or
        /// when a BR key already at least as authenticated as this LE link blocked
        /// the overwrite (the policy guard in §4.3.6).
        derived_link_key: Option<[u8; 16]>,
    },
    Failed(PairingFailedReason),
}

/// Events the application callback surface receives (Section 6, "Application callback").
#[derive(Debug)]
pub enum AppEvent {
    IoCapabilityRequest,
    PasskeyRequest,
    PasskeyNotify(u32),
    NumericComparison(u32),
    ConsentRequest,
    OobRequest,
    PairingComplete(PairingOutcome),
}

/// Per-link pairing state, allocated for the duration of one pairing attempt and
/// zeroized (replaced by a fresh default) on completion or failure.
pub struct PairingControlBlock {
    pub peer: DeviceAddress,
    pub role: Role,
    pub state: State,
    pub br_state: BrState,
    pub model: Option<AssociationModel>,

    pub local_io_cap: IoCapability,
    pub peer_io_cap: Option<IoCapability>,
    pub local_auth_req: AuthReq,
    pub peer_auth_req: Option<AuthReq>,
    pub local_oob: OobDataFlag,
    pub peer_oob: Option<OobDataFlag>,
    pub encryption_key_size: u8,

    pub ltk: Option<[u8; 16]>,
    pub csrk: Option<[u8; 16]>,
    pub irk: Option<[u8; 16]>,

    pub local_nonce: Option<[u8; 16]>,
    pub peer_nonce: Option<[u8; 16]>,
    pub local_commitment: Option<[u8; 16]>,
    pub peer_commitment: Option<[u8; 16]>,
    pub local_dhk_check: Option<[u8; 16]>,
    pub peer_dhk_check: Option<[u8; 16]>,

    /// Raw 7-byte encodings (opcode + 6-byte feature body) of the Pairing Request and
    /// Pairing Response PDUs actually exchanged, needed verbatim by legacy `c1` as
    /// `preq`/`pres`. Populated on both sides regardless of who sent which.
    pub preq_bytes: Option<[u8; 7]>,
    pub pres_bytes: Option<[u8; 7]>,

    pub local_public_key: Option<PublicKey>,
    pub peer_public_key: Option<PublicKey>,
    pub local_secret: Option<EcdhSecret>,
    pub dhkey: Option<[u8; 32]>,

    pub local_i_key: KeyDistribution,
    pub local_r_key: KeyDistribution,

    pub passkey_round: u8,
    pub passkey: Option<u32>,
    pub secure_connections: bool,
    pub over_br: bool,
    pub derive_link_key: bool,
    /// Set by the host (from the device database collaborator) before pairing
    /// completes: whether the peer already has a BR/EDR link key at least as
    /// authenticated as the LE link being established. Blocks the derivation
    /// overwrite per §4.3.6's policy guard.
    pub existing_br_key_authenticated: bool,
    pub we_initiated: bool,

    pub delayed_auth_deadline: Option<Instant>,
    pub unacked_tx: u8,

    pub handle: Option<TransportHandle>,
}

impl PairingControlBlock {
    fn new(peer: DeviceAddress, role: Role, local_io_cap: IoCapability, local_auth_req: AuthReq) -> Self {
        PairingControlBlock {
            peer,
            role,
            state: State::Idle,
            br_state: BrState::Idle,
            model: None,
            local_io_cap,
            peer_io_cap: None,
            local_auth_req,
            peer_auth_req: None,
            local_oob: OobDataFlag::NotPresent,
            peer_oob: None,
            encryption_key_size: 16,
            ltk: None,
            csrk: None,
            irk: None,
            local_nonce: None,
            peer_nonce: None,
            local_commitment: None,
            peer_commitment: None,
            local_dhk_check: None,
            peer_dhk_check: None,
            preq_bytes: None,
            pres_bytes: None,
            local_public_key: None,
            peer_public_key: None,
            local_secret: None,
            dhkey: None,
            local_i_key: KeyDistribution::empty(),
            local_r_key: KeyDistribution::empty(),
            passkey_round: 0,
            passkey: None,
            secure_connections: false,
            over_br: false,
            derive_link_key: false,
            existing_br_key_authenticated: false,
            we_initiated: role == Role::Initiator,
            delayed_auth_deadline: None,
            unacked_tx: 0,
            handle: None,
        }
    }
}

/// Configuration the policy gate in [`model`] consults.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Reject any pairing whose selected model isn't Secure Connections (and isn't
    /// SC Just Works, which the core spec still treats as insufficiently authenticated).
    pub secure_connections_only: bool,
    /// Whether cross-transport link-key derivation is permitted at all.
    pub allow_link_key_derivation: bool,
    /// Delay before declaring success once both key-distribution masks reach zero
    /// (Section 4.3.3's "tail delay"). The core spec leaves the exact value
    /// unspecified beyond "on the order of 500 ms"; exposed here per that note.
    pub delayed_auth_tail: Duration,
    /// Maximum number of unsolicited pairing attempts accepted before treating further
    /// retries as `REPEATED_ATTEMPTS`.
    pub max_repeated_attempts: u8,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            secure_connections_only: false,
            allow_link_key_derivation: true,
            delayed_auth_tail: Duration::from_millis(500),
            max_repeated_attempts: 3,
        }
    }
}

/// The SMP pairing engine for one link.
///
/// Generic over [`SmpConfig`] the same way the AVDTP engine is generic over
/// [`crate::config::AvdtpConfig`]: one set of associated types wires in the concrete
/// transport, timer, and crypto collaborators.
pub struct Pairing<C: SmpConfig> {
    transport: C::Transport,
    timer: C::Timer,
    crypto: C::Crypto,
    policy: Policy,
    /// This host's own address on the link being paired, needed (alongside the peer's)
    /// by `c1`/`f5`/`f6`, which are defined over both sides' addresses, not just the
    /// peer's. Supplied by the host, which owns the local-address/connection
    /// collaborator (out of scope per Section 6).
    local_address: DeviceAddress,
    pcb: Option<PairingControlBlock>,
    repeated_attempts: u8,
}

impl<C: SmpConfig> Pairing<C> {
    pub fn new(
        transport: C::Transport,
        timer: C::Timer,
        crypto: C::Crypto,
        policy: Policy,
        local_address: DeviceAddress,
    ) -> Self {
        Pairing {
            transport,
            timer,
            crypto,
            policy,
            local_address,
            pcb: None,
            repeated_attempts: 0,
        }
    }

    /// Starts pairing as the initiator by opening the fixed SMP channel and sending
    /// Pairing Request.
    pub fn start(
        &mut self,
        peer: DeviceAddress,
        local_io_cap: IoCapability,
        local_auth_req: AuthReq,
        local_i_key: KeyDistribution,
        local_r_key: KeyDistribution,
    ) -> Result<(), SmpError> {
        if self.pcb.is_some() {
            return Err(SmpError::StateViolation);
        }
        let handle = self
            .transport
            .open(peer, Psm::Smp)
            .map_err(|_| SmpError::TransportLost)?;

        let mut pcb = PairingControlBlock::new(peer, Role::Initiator, local_io_cap, local_auth_req);
        pcb.local_i_key = local_i_key;
        pcb.local_r_key = local_r_key;
        pcb.handle = Some(handle);
        pcb.state = State::PairReqSent;

        let features = PairingFeatures {
            io_capability: local_io_cap,
            oob_data_flag: OobDataFlag::NotPresent,
            auth_req: local_auth_req,
            max_encryption_key_size: 16,
            initiator_key_distribution: local_i_key,
            responder_key_distribution: local_r_key,
        };
        pcb.preq_bytes = Some(encode_feature_pdu(Code::PairingRequest, &features));
        self.send(&pcb, handle, &Command::PairingRequest(features))?;
        self.pcb = Some(pcb);
        Ok(())
    }

    /// Feeds one inbound SMP PDU (already de-fragmented by the transport) into the engine.
    ///
    /// `peer` is supplied by the host, which owns the handle-to-peer mapping for the
    /// channel the data arrived on; the engine itself never allocates a channel without
    /// knowing the peer first (see [`Self::start`]), so this is only load-bearing for
    /// the very first Pairing Request of a responder-side pairing.
    pub fn on_data(&mut self, handle: TransportHandle, peer: DeviceAddress, bytes: &[u8]) -> Option<AppEvent> {
        let mut reader = ByteReader::new(bytes);
        let command = match Command::from_bytes(&mut reader) {
            Ok(command) => command,
            Err(_) => {
                // A Pairing Failed PDU too short to carry its reason byte short-circuits to
                // INVALID_PARAMETERS but, per spec, must not itself provoke a reply (that
                // would loop two failing peers forever); route it through `PeerFailure` so
                // `fail` completes the pairing without writing a PDU back.
                if bytes.first() == Some(&Code::PairingFailed.into()) {
                    return self.fail(SmpError::PeerFailure(PairingFailedReason::InvalidParameters));
                }
                // Any other malformed PDU still owes the peer a reply: the codec's length
                // mismatch maps to INVALID_PARAMETERS and the state machine must emit
                // Pairing Failed with that reason before returning to idle.
                warn!("malformed SMP PDU from {:?}, failing with INVALID_PARAMETERS", peer);
                return self.fail(SmpError::MalformedPdu);
            }
        };

        match self.dispatch(handle, peer, command) {
            Ok(event) => event,
            Err(err) => self.fail(err),
        }
    }

    fn dispatch(&mut self, handle: TransportHandle, peer: DeviceAddress, command: Command<'_>) -> Result<Option<AppEvent>, SmpError> {
        if let Command::PairingFailed { reason } = command {
            return Err(SmpError::PeerFailure(reason));
        }

        match command {
            Command::Unknown { code, .. } => Err(SmpError::UnknownOpcode(code)),
            Command::SecurityRequest { auth_req } => self.on_security_request(handle, auth_req),
            Command::PairingRequest(features) => {
                self.on_pairing_request(handle, peer, features)
            }
            Command::PairingResponse(features) => self.on_pairing_response(handle, features),
            Command::PairingConfirm { confirm_value } => self.on_pairing_confirm(handle, confirm_value),
            Command::PairingRandom { random_value } => self.on_pairing_random(handle, random_value),
            Command::PairingPublicKey { x, y } => self.on_pairing_public_key(handle, x, y),
            Command::PairingDhKeyCheck { check_value } => self.on_dhkey_check(handle, check_value),
            Command::EncryptionInformation { long_term_key } => {
                self.on_key_received(DistributedKey::Encryption, |pcb| pcb.ltk = Some(long_term_key))
            }
            Command::MasterIdentification { .. } => Ok(None),
            Command::IdentityInformation { identity_resolving_key } => {
                self.on_key_received(DistributedKey::Identity, |pcb| pcb.irk = Some(identity_resolving_key))
            }
            Command::IdentityAddressInformation { .. } => Ok(None),
            Command::SigningInformation { signature_key } => {
                self.on_key_received(DistributedKey::Signing, |pcb| pcb.csrk = Some(signature_key))
            }
            Command::PairingKeypressNotification { .. } => Ok(None),
            Command::PairingFailed { .. } => unreachable!("handled above"),
        }
    }

    fn on_security_request(&mut self, _handle: TransportHandle, _auth_req: AuthReq) -> Result<Option<AppEvent>, SmpError> {
        if self.pcb.is_some() {
            return Err(SmpError::StateViolation);
        }
        // A bare security request without a pending pairing only makes sense when this
        // side is the responder and the application decides whether to kick off pairing;
        // surfaced upward rather than auto-started.
        Ok(Some(AppEvent::IoCapabilityRequest))
    }

    fn on_pairing_request(
        &mut self,
        handle: TransportHandle,
        peer: DeviceAddress,
        features: PairingFeatures,
    ) -> Result<Option<AppEvent>, SmpError> {
        if self.pcb.is_some() {
            return Err(SmpError::StateViolation);
        }
        if self.repeated_attempts >= self.policy.max_repeated_attempts {
            return Err(SmpError::StateViolation);
        }
        self.repeated_attempts += 1;

        let mut pcb = PairingControlBlock::new(peer, Role::Responder, IoCapability::NoInputNoOutput, AuthReq::from_raw(0));
        pcb.handle = Some(handle);
        pcb.peer_io_cap = Some(features.io_capability);
        pcb.peer_auth_req = Some(features.auth_req);
        pcb.peer_oob = Some(features.oob_data_flag);
        pcb.local_i_key = features.initiator_key_distribution;
        pcb.local_r_key = features.responder_key_distribution;
        pcb.preq_bytes = Some(encode_feature_pdu(Code::PairingRequest, &features));
        pcb.state = State::WaitAppRsp;
        self.pcb = Some(pcb);

        Ok(Some(AppEvent::IoCapabilityRequest))
    }

    /// Called by the host once the application has answered the `IoCapabilityRequest`
    /// raised for an inbound Pairing Request, completing the responder-side negotiation.
    pub fn complete_io_capability_reply(
        &mut self,
        local_io_cap: IoCapability,
        local_auth_req: AuthReq,
        local_i_key: KeyDistribution,
        local_r_key: KeyDistribution,
    ) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        if pcb.state != State::WaitAppRsp {
            return Err(SmpError::StateViolation);
        }

        pcb.local_io_cap = local_io_cap;
        pcb.local_auth_req = local_auth_req;
        pcb.local_i_key &= local_i_key;
        pcb.local_r_key &= local_r_key;

        let peer_auth_req = pcb.peer_auth_req.expect("set in on_pairing_request");
        let sc = local_auth_req.secure_connections() && peer_auth_req.secure_connections();
        let mitm = local_auth_req.mitm() || peer_auth_req.mitm();
        let oob_present = pcb.peer_oob == Some(OobDataFlag::Present);

        let model = select_association_model(pcb.peer_io_cap.unwrap(), local_io_cap, mitm, oob_present);
        if self.policy.secure_connections_only && (!sc || model == AssociationModel::JustWorks) {
            return Err(SmpError::PolicyRefused);
        }
        pcb.model = Some(model);
        pcb.secure_connections = sc;

        let features = PairingFeatures {
            io_capability: local_io_cap,
            oob_data_flag: OobDataFlag::NotPresent,
            auth_req: local_auth_req,
            max_encryption_key_size: 16,
            initiator_key_distribution: pcb.local_i_key,
            responder_key_distribution: pcb.local_r_key,
        };
        pcb.pres_bytes = Some(encode_feature_pdu(Code::PairingResponse, &features));
        let handle = pcb.handle.unwrap();
        let pcb_snapshot = clone_for_send(pcb);
        self.send(&pcb_snapshot, handle, &Command::PairingResponse(features))?;

        let pcb = self.pcb.as_mut().unwrap();
        pcb.state = if sc {
            State::PublicKeyExch
        } else {
            State::WaitConfirm
        };
        Ok(None)
    }

    fn on_pairing_response(&mut self, handle: TransportHandle, features: PairingFeatures) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        if pcb.state != State::PairReqSent {
            return Err(SmpError::StateViolation);
        }
        pcb.peer_io_cap = Some(features.io_capability);
        pcb.peer_auth_req = Some(features.auth_req);
        pcb.peer_oob = Some(features.oob_data_flag);
        pcb.local_i_key &= features.initiator_key_distribution;
        pcb.local_r_key &= features.responder_key_distribution;
        pcb.pres_bytes = Some(encode_feature_pdu(Code::PairingResponse, &features));

        let mitm = pcb.local_auth_req.mitm() || features.auth_req.mitm();
        let sc = pcb.local_auth_req.secure_connections() && features.auth_req.secure_connections();
        let oob_present = pcb.peer_oob == Some(OobDataFlag::Present);
        let model = select_association_model(pcb.local_io_cap, features.io_capability, mitm, oob_present);

        if self.policy.secure_connections_only && (!sc || model == AssociationModel::JustWorks) {
            return Err(SmpError::PolicyRefused);
        }
        pcb.model = Some(model);
        pcb.secure_connections = sc;
        pcb.state = if sc { State::PublicKeyExch } else { State::WaitConfirm };
        let _ = handle;
        Ok(None)
    }

    /// Starts Secure Connections Phase 1 once both public keys are known, or kicks off
    /// legacy confirm-value computation for non-SC pairings. Called by the host after it
    /// has generated (or been handed) the local ECDH keypair / TK.
    pub fn begin_key_exchange<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        if pcb.secure_connections {
            let (secret, public) = self.crypto.generate_keypair(rng);
            let pcb = self.pcb.as_mut().unwrap();
            pcb.local_secret = Some(secret);
            pcb.local_public_key = Some(public);
            let handle = pcb.handle.unwrap();
            let pcb_snapshot = clone_for_send(pcb);
            self.send(&pcb_snapshot, handle, &Command::PairingPublicKey { x: public.0[..32].try_into().unwrap(), y: public.0[32..].try_into().unwrap() })?;
        } else {
            let mut nonce = [0u8; 16];
            rng.fill_bytes(&mut nonce);
            pcb.local_nonce = Some(nonce);
            pcb.state = State::WaitConfirm;
        }
        Ok(())
    }

    fn on_pairing_public_key(&mut self, handle: TransportHandle, x: [u8; 32], y: [u8; 32]) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&x);
        bytes[32..].copy_from_slice(&y);
        let peer_public = PublicKey(bytes);

        if Some(peer_public) == pcb.local_public_key {
            return Err(SmpError::CryptoFailure);
        }

        let secret = pcb.local_secret.take().ok_or(SmpError::StateViolation)?;
        let shared = self
            .crypto
            .ecdh(secret, &peer_public)
            .map_err(|InvalidPublicKey { .. }| SmpError::CryptoFailure)?;

        let pcb = self.pcb.as_mut().unwrap();
        pcb.peer_public_key = Some(peer_public);
        pcb.dhkey = Some(shared.0);
        pcb.state = State::ScPhase1Start;
        let _ = handle;
        Ok(None)
    }

    /// Supplies the 6-digit passkey (displayed by one side, typed on the other) for a
    /// `PasskeyEntry` pairing. For legacy pairing this becomes the TK directly; for
    /// Secure Connections it seeds the 20 per-round commitment bits in
    /// [`Self::send_commitment`].
    pub fn provide_passkey(&mut self, passkey: u32) -> Result<(), SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        pcb.passkey = Some(passkey % 1_000_000);
        Ok(())
    }

    /// Computes and sends this side's pairing confirm value: `c1` for legacy
    /// pairing, `f4` for Secure Connections.
    ///
    /// Legacy pairing (Vol 3 Part H Section 2.3.5.5) has both sides commit and send
    /// their own confirm value. SC Just Works and Numeric Comparison commit once,
    /// with the responder alone sending `Cb` (Section 2.3.5.6.2). SC Passkey Entry
    /// instead runs this once per round of the 20-round loop (Section 2.3.5.6.3):
    /// both sides commit to their own nonce and the round's single passkey bit, and
    /// the host is expected to call this again for each of the 20 rounds (tracked by
    /// `passkey_round`) before moving on to [`Self::send_dhkey_check`].
    pub fn send_commitment<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        let mut nonce = [0u8; 16];
        rng.fill_bytes(&mut nonce);
        pcb.local_nonce = Some(nonce);

        if !pcb.secure_connections {
            let key = legacy_tk(pcb);
            let (pres, preq, iat, ia, rat, ra) = legacy_address_params(pcb, self.local_address)?;
            let commitment = self.crypto.c1(&key, &nonce, &pres, &preq, iat, &ia, rat, &ra);
            let pcb = self.pcb.as_mut().unwrap();
            pcb.local_commitment = Some(commitment);
            let handle = pcb.handle.unwrap();
            let pcb_snapshot = clone_for_send(pcb);
            self.send(&pcb_snapshot, handle, &Command::PairingConfirm { confirm_value: commitment })?;
            let pcb = self.pcb.as_mut().unwrap();
            pcb.state = State::WaitNonce;
            return Ok(());
        }

        match pcb.model {
            Some(AssociationModel::PasskeyEntry { .. }) => {
                let z = passkey_round_bit(pcb)?;
                let (own_pub, peer_pub) = own_and_peer_public_key(pcb)?;
                let commitment = self.crypto.f4(&own_pub, &peer_pub, &nonce, z);
                let pcb = self.pcb.as_mut().unwrap();
                pcb.local_commitment = Some(commitment);
                let handle = pcb.handle.unwrap();
                let pcb_snapshot = clone_for_send(pcb);
                self.send(&pcb_snapshot, handle, &Command::PairingConfirm { confirm_value: commitment })?;
            }
            _ => {
                if pcb.role == Role::Responder {
                    let (pkb, pka) = public_key_halves(pcb)?;
                    let commitment = self.crypto.f4(&pkb, &pka, &nonce, 0);
                    let pcb = self.pcb.as_mut().unwrap();
                    pcb.local_commitment = Some(commitment);
                    let handle = pcb.handle.unwrap();
                    let pcb_snapshot = clone_for_send(pcb);
                    self.send(&pcb_snapshot, handle, &Command::PairingConfirm { confirm_value: commitment })?;
                }
            }
        }
        let pcb = self.pcb.as_mut().unwrap();
        pcb.state = State::WaitNonce;
        Ok(())
    }

    /// Handles an inbound Pairing Confirm.
    ///
    /// For Passkey Entry the per-round reply is driven entirely from
    /// [`Self::on_pairing_random`] (both sides commit *and* nonce every round), so
    /// this only matters for Just Works/Numeric Comparison/OOB (SC and legacy alike):
    /// once the initiator has the peer's (sole) commitment, it sends its own nonce
    /// first, per the commitment-before-nonce ordering in both Section 2.3.5.5
    /// (legacy) and Section 2.3.5.6.2 (SC).
    fn on_pairing_confirm(&mut self, handle: TransportHandle, confirm_value: [u8; 16]) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        pcb.peer_commitment = Some(confirm_value);

        let is_passkey = matches!(pcb.model, Some(AssociationModel::PasskeyEntry { .. }));
        if !is_passkey && pcb.role == Role::Initiator {
            let local_nonce = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
            let pcb_snapshot = clone_for_send(pcb);
            self.send(&pcb_snapshot, handle, &Command::PairingRandom { random_value: local_nonce })?;
        }
        Ok(None)
    }

    fn on_pairing_random(&mut self, handle: TransportHandle, random_value: [u8; 16]) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        pcb.peer_nonce = Some(random_value);

        if pcb.secure_connections {
            match pcb.model {
                Some(AssociationModel::PasskeyEntry { .. }) => {
                    let z = passkey_round_bit(pcb)?;
                    let (_own_pub, peer_pub) = own_and_peer_public_key(pcb)?;
                    let local_pub = pcb.local_public_key.ok_or(SmpError::StateViolation)?;
                    let expected = self.crypto.f4(&peer_pub, &local_pub.0[..32].try_into().unwrap(), &random_value, z);
                    if Some(expected) != pcb.peer_commitment {
                        return Err(SmpError::CryptoFailure);
                    }
                    let local_nonce = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
                    let pcb_snapshot = clone_for_send(pcb);
                    self.send(&pcb_snapshot, handle, &Command::PairingRandom { random_value: local_nonce })?;

                    let pcb = self.pcb.as_mut().unwrap();
                    pcb.peer_commitment = None;
                    pcb.local_commitment = None;
                    pcb.peer_nonce = None;
                    pcb.local_nonce = None;
                    if pcb.passkey_round >= 19 {
                        pcb.state = State::ScPhase2Start;
                    } else {
                        pcb.passkey_round += 1;
                        pcb.state = State::ScPhase1Start;
                    }
                    Ok(None)
                }
                model => {
                    // Only the initiator verifies (it alone received a commitment to
                    // check); the responder's reply carries no commitment of its own.
                    if pcb.role == Role::Initiator {
                        let (pkb, pka) = public_key_halves(pcb)?;
                        let expected = self.crypto.f4(&pkb, &pka, &random_value, 0);
                        if Some(expected) != pcb.peer_commitment {
                            return Err(SmpError::CryptoFailure);
                        }
                    } else {
                        // Responder: having received the initiator's nonce, send its
                        // own back (Section 2.3.5.6.2's "initiator, then responder").
                        let local_nonce = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
                        let pcb_snapshot = clone_for_send(pcb);
                        self.send(&pcb_snapshot, handle, &Command::PairingRandom { random_value: local_nonce })?;
                    }
                    let pcb = self.pcb.as_mut().unwrap();
                    pcb.state = State::ScPhase2Start;

                    if matches!(model, Some(AssociationModel::NumericComparison)) {
                        let (pka, pkb) = own_and_peer_public_key_by_role(pcb)?;
                        let (na, nb) = initiator_responder_nonces(pcb)?;
                        let value = self.crypto.g2(&pka, &pkb, &na, &nb) % 1_000_000;
                        return Ok(Some(AppEvent::NumericComparison(value)));
                    }
                    Ok(None)
                }
            }
        } else {
            let key = legacy_tk(pcb);
            let (pres, preq, iat, ia, rat, ra) = legacy_address_params(pcb, self.local_address)?;
            let expected = self.crypto.c1(&key, &random_value, &pres, &preq, iat, &ia, rat, &ra);
            if Some(expected) != pcb.peer_commitment {
                return Err(SmpError::CryptoFailure);
            }

            if pcb.role == Role::Responder {
                // Having just verified Mconfirm against Mrand, send Srand back.
                let local_nonce = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
                let pcb_snapshot = clone_for_send(pcb);
                self.send(&pcb_snapshot, handle, &Command::PairingRandom { random_value: local_nonce })?;
            }

            let pcb = self.pcb.as_mut().unwrap();
            let local_nonce = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
            // STK = s1(TK, Srand, Mrand), fixed order regardless of which side computes it.
            let (srand, mrand) = if pcb.role == Role::Initiator {
                (random_value, local_nonce)
            } else {
                (local_nonce, random_value)
            };
            let stk = self.crypto.s1(&key, &srand, &mrand);
            let pcb = self.pcb.as_mut().unwrap();
            pcb.ltk = Some(stk);
            pcb.state = State::EncryptionPending;
            Ok(None)
        }
    }

    /// Computes and sends this side's DHKey check (`f6`) once both nonces are known.
    pub fn send_dhkey_check(&mut self) -> Result<(), SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        let dhkey = pcb.dhkey.ok_or(SmpError::StateViolation)?;
        let (na, nb) = initiator_responder_nonces(pcb)?;
        let (a, b) = address_params(pcb, self.local_address);
        let io_cap = io_cap_bytes(pcb.local_io_cap, pcb.local_auth_req, pcb.local_oob);

        let (mac_key, ltk) = self.crypto.f5(&dhkey, &na, &nb, &a, &b);
        let r = [0u8; 16];
        // This side's own check: Ea = f6(MacKey, Na, Nb, rb, IOcapA, A, B) if we are
        // the initiator, Eb = f6(MacKey, Nb, Na, ra, IOcapB, B, A) if the responder
        // (Section 2.3.5.6.5); `r` (the OOB randomizer contribution) is zero outside
        // the OOB association model, which this crate does not source a randomizer
        // for without an OOB collaborator in scope.
        let check = if pcb.role == Role::Initiator {
            self.crypto.f6(&mac_key, &na, &nb, &r, &io_cap, &a, &b)
        } else {
            self.crypto.f6(&mac_key, &nb, &na, &r, &io_cap, &b, &a)
        };

        let pcb = self.pcb.as_mut().unwrap();
        pcb.ltk = Some(ltk);
        pcb.local_dhk_check = Some(check);
        let handle = pcb.handle.unwrap();
        let pcb_snapshot = clone_for_send(pcb);
        self.send(&pcb_snapshot, handle, &Command::PairingDhKeyCheck { check_value: check })?;
        let pcb = self.pcb.as_mut().unwrap();
        pcb.state = State::WaitDhkCheck;
        Ok(())
    }

    fn on_dhkey_check(&mut self, handle: TransportHandle, check_value: [u8; 16]) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        pcb.peer_dhk_check = Some(check_value);
        if pcb.local_dhk_check.is_none() {
            // Peer's check arrived before ours went out; still need to verify once we
            // compute our own, which `send_dhkey_check` will do for the responder path.
            return Ok(None);
        }
        let dhkey = pcb.dhkey.ok_or(SmpError::StateViolation)?;
        let (na, nb) = initiator_responder_nonces(pcb)?;
        let (a, b) = address_params(pcb, self.local_address);
        let io_cap = io_cap_bytes(
            pcb.peer_io_cap.unwrap_or(IoCapability::NoInputNoOutput),
            pcb.peer_auth_req.unwrap_or_else(|| AuthReq::from_raw(0)),
            pcb.peer_oob.unwrap_or(OobDataFlag::NotPresent),
        );
        let (mac_key, _ltk) = self.crypto.f5(&dhkey, &na, &nb, &a, &b);
        let r = [0u8; 16];
        // The peer's check, mirrored: we verify Eb if we're the initiator, Ea if
        // we're the responder.
        let expected = if pcb.role == Role::Initiator {
            self.crypto.f6(&mac_key, &nb, &na, &r, &io_cap, &b, &a)
        } else {
            self.crypto.f6(&mac_key, &na, &nb, &r, &io_cap, &a, &b)
        };
        if expected != check_value {
            return Err(SmpError::CryptoFailure);
        }

        let pcb = self.pcb.as_mut().unwrap();
        pcb.state = State::EncryptionPending;
        let _ = handle;
        Ok(None)
    }

    /// Called once the host's controller reports encryption has started with the
    /// negotiated key (STK or LTK); enters the key-distribution walk.
    pub fn on_encryption_started(&mut self) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        if pcb.state != State::EncryptionPending {
            return Err(SmpError::StateViolation);
        }

        if pcb.secure_connections {
            pcb.local_i_key = strip_sc_derived_bits(pcb.local_i_key);
            pcb.local_r_key = strip_sc_derived_bits(pcb.local_r_key);
        }
        pcb.local_i_key = gate_link_key(pcb.local_i_key, pcb.secure_connections, self.policy.allow_link_key_derivation);
        pcb.local_r_key = gate_link_key(pcb.local_r_key, pcb.secure_connections, self.policy.allow_link_key_derivation);
        // Whichever mask carried it before gating determines whether this side still
        // owes a cross-transport derivation once bonding finishes (§4.3.6); the bit
        // itself carries no PDU (`distribute_next`'s `DistributedKey::LinkKey` arm), so
        // record the intent separately before it's cleared off the walk.
        pcb.derive_link_key = pcb.local_i_key.contains(KeyDistribution::LINK_KEY)
            || pcb.local_r_key.contains(KeyDistribution::LINK_KEY);

        pcb.state = State::BondPending;
        self.distribute_next()
    }

    /// Drives the key-distribution walk: sends every key this side still owes, in
    /// ascending order, then checks whether both masks are exhausted and starts the
    /// tail-delay timer. The transport is reliable and synchronous here, so there is
    /// no reason to wait for an inbound PDU between sends; a burst keeps the walk
    /// from stalling when the peer owes nothing back (it would otherwise never call
    /// back into `on_key_received` to resume this side's own walk).
    fn distribute_next(&mut self) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        let mask = if pcb.role == Role::Responder {
            pcb.local_r_key
        } else {
            pcb.local_i_key
        };

        if let Some(key) = next_key_to_send(mask) {
            let handle = pcb.handle.unwrap();
            let command = match key {
                DistributedKey::Encryption => {
                    let ltk = pcb.ltk.unwrap_or([0u8; 16]);
                    Command::EncryptionInformation { long_term_key: ltk }
                }
                DistributedKey::Identity => Command::IdentityInformation {
                    identity_resolving_key: pcb.irk.unwrap_or([0u8; 16]),
                },
                DistributedKey::Signing => Command::SigningInformation {
                    signature_key: pcb.csrk.unwrap_or([0u8; 16]),
                },
                DistributedKey::LinkKey => {
                    // Cross-transport derivation happens once both masks are drained;
                    // the LK bit only gates whether it happens, it carries no PDU of
                    // its own.
                    if pcb.role == Role::Responder {
                        pcb.local_r_key -= key.bit();
                    } else {
                        pcb.local_i_key -= key.bit();
                    }
                    return self.distribute_next();
                }
            };
            let pcb_snapshot = clone_for_send(pcb);
            pcb.unacked_tx += 1;
            let send_result = self.send(&pcb_snapshot, handle, &command);
            let pcb = self.pcb.as_mut().unwrap();
            pcb.unacked_tx -= 1;
            send_result?;
            if pcb.role == Role::Responder {
                pcb.local_r_key -= key.bit();
            } else {
                pcb.local_i_key -= key.bit();
            }
            return self.distribute_next();
        }

        if pcb.local_i_key.is_empty() && pcb.local_r_key.is_empty() && pcb.unacked_tx == 0 {
            pcb.delayed_auth_deadline = Some(self.timer.now() + self.policy.delayed_auth_tail);
        }
        Ok(None)
    }

    fn on_key_received(
        &mut self,
        key: DistributedKey,
        store: impl FnOnce(&mut PairingControlBlock),
    ) -> Result<Option<AppEvent>, SmpError> {
        let pcb = self.pcb.as_mut().ok_or(SmpError::StateViolation)?;
        store(pcb);
        if pcb.role == Role::Responder {
            pcb.local_i_key -= key.bit();
        } else {
            pcb.local_r_key -= key.bit();
        }
        self.distribute_next()
    }

    /// Tells the engine whether the peer already has a BR/EDR link key at least as
    /// authenticated as the LE link about to complete pairing (the §4.3.6 policy
    /// guard). The host consults its device database collaborator for this; a `true`
    /// here suppresses the cross-transport derivation overwrite.
    pub fn set_existing_br_key_authenticated(&mut self, authenticated: bool) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.existing_br_key_authenticated = authenticated;
        }
    }

    /// Cross-transport link-key derivation (§4.3.6): `h7(tmp2, LTK)` then `h6(ILK,
    /// keyID)` when both sides advertised `H7_SUPPORT_BIT`, or `h6(LTK, keyID)`
    /// directly otherwise. Direction follows which transport this pairing ran over —
    /// `lebr` converting an LE LTK to a BR/EDR link key, `brle` for the reverse.
    const H7_SALT: [u8; 16] = *b"\0\0\0\0\0\0\0\0\0\0\0\0tmp2";

    fn derive_cross_transport_key(&self) -> Option<[u8; 16]> {
        let pcb = self.pcb.as_ref()?;
        if !pcb.derive_link_key || pcb.existing_br_key_authenticated {
            return None;
        }
        let ltk = pcb.ltk?;
        let h7_supported = pcb.local_auth_req.ct2() && pcb.peer_auth_req.map(|a| a.ct2()).unwrap_or(false);
        let key_id: &[u8; 4] = if pcb.over_br { b"brle" } else { b"lebr" };
        Some(if h7_supported {
            let ilk = self.crypto.h7(&Self::H7_SALT, &ltk);
            self.crypto.h6(&ilk, key_id)
        } else {
            self.crypto.h6(&ltk, key_id)
        })
    }

    /// Polls the delayed-auth tail timer; call periodically (or whenever the host's
    /// event loop processes a timer-fired event). Returns the completion event once the
    /// tail has elapsed without an intervening `Pairing Failed`.
    pub fn poll(&mut self, now: Instant) -> Option<AppEvent> {
        let deadline = self.pcb.as_ref()?.delayed_auth_deadline?;
        if !has_elapsed(now, deadline) {
            return None;
        }
        let authenticated = self
            .pcb
            .as_ref()
            .and_then(|pcb| pcb.model)
            .map(|m| !matches!(m, AssociationModel::JustWorks))
            .unwrap_or(false);
        let derived_link_key = self.derive_cross_transport_key();
        self.finish(PairingOutcome::Success { authenticated, derived_link_key })
    }

    /// Cancels the in-progress pairing (transport disconnect, application abort).
    pub fn cancel(&mut self, reason: PairingFailedReason) -> Option<AppEvent> {
        self.fail(SmpError::PeerFailure(reason)).or_else(|| None)
    }

    fn fail(&mut self, err: SmpError) -> Option<AppEvent> {
        if let (Some(reason), Some(pcb)) = (err.reason(), self.pcb.as_ref()) {
            if let Some(handle) = pcb.handle {
                let pcb_snapshot = clone_for_send(pcb);
                let _ = self.send(&pcb_snapshot, handle, &Command::PairingFailed { reason });
            }
        }
        let reason = match err {
            SmpError::PeerFailure(reason) => reason,
            _ => err.reason().unwrap_or(PairingFailedReason::UnspecifiedReason),
        };
        self.finish(PairingOutcome::Failed(reason))
    }

    fn finish(&mut self, outcome: PairingOutcome) -> Option<AppEvent> {
        // Zeroize by dropping the control block entirely; no key material survives
        // past this point.
        self.pcb = None;
        Some(AppEvent::PairingComplete(outcome))
    }

    fn send(&mut self, pcb: &PairingControlBlock, handle: TransportHandle, command: &Command<'_>) -> Result<(), SmpError> {
        let mtu = self.transport.mtu(handle) as usize;
        let mut buf = vec![0u8; mtu.max(64)];
        let len = {
            let mut writer = ByteWriter::new(&mut buf);
            let before = writer.space_left();
            command.to_bytes(&mut writer).map_err(|_| SmpError::MalformedPdu)?;
            before - writer.space_left()
        };
        let _ = pcb;
        self.transport
            .write(handle, &buf[..len])
            .map_err(|_| SmpError::TransportLost)
    }
}

fn clone_for_send(pcb: &PairingControlBlock) -> PairingControlBlock {
    // Cheap structural copy used only to satisfy the borrow checker around `send`,
    // which needs `&self.transport` mutably while also reading from `self.pcb`.
    PairingControlBlock {
        peer: pcb.peer,
        role: pcb.role,
        state: pcb.state,
        br_state: pcb.br_state,
        model: pcb.model,
        local_io_cap: pcb.local_io_cap,
        peer_io_cap: pcb.peer_io_cap,
        local_auth_req: pcb.local_auth_req,
        peer_auth_req: pcb.peer_auth_req,
        local_oob: pcb.local_oob,
        peer_oob: pcb.peer_oob,
        encryption_key_size: pcb.encryption_key_size,
        ltk: pcb.ltk,
        csrk: pcb.csrk,
        irk: pcb.irk,
        local_nonce: pcb.local_nonce,
        peer_nonce: pcb.peer_nonce,
        local_commitment: pcb.local_commitment,
        peer_commitment: pcb.peer_commitment,
        local_dhk_check: pcb.local_dhk_check,
        peer_dhk_check: pcb.peer_dhk_check,
        preq_bytes: pcb.preq_bytes,
        pres_bytes: pcb.pres_bytes,
        local_public_key: pcb.local_public_key,
        peer_public_key: pcb.peer_public_key,
        local_secret: None,
        dhkey: pcb.dhkey,
        local_i_key: pcb.local_i_key,
        local_r_key: pcb.local_r_key,
        passkey_round: pcb.passkey_round,
        passkey: pcb.passkey,
        secure_connections: pcb.secure_connections,
        over_br: pcb.over_br,
        derive_link_key: pcb.derive_link_key,
        existing_br_key_authenticated: pcb.existing_br_key_authenticated,
        we_initiated: pcb.we_initiated,
        delayed_auth_deadline: pcb.delayed_auth_deadline,
        unacked_tx: pcb.unacked_tx,
        handle: pcb.handle,
    }
}

/// Returns `(own X-coordinate, peer X-coordinate)`, used by the Passkey Entry commitment
/// formula, which always orders its own side's key first regardless of initiator/responder
/// role (unlike Just Works/Numeric Comparison's fixed responder-then-initiator order).
fn own_and_peer_public_key(pcb: &PairingControlBlock) -> Result<([u8; 32], [u8; 32]), SmpError> {
    let local = pcb.local_public_key.ok_or(SmpError::StateViolation)?;
    let peer = pcb.peer_public_key.ok_or(SmpError::StateViolation)?;
    Ok((
        local.0[..32].try_into().unwrap(),
        peer.0[..32].try_into().unwrap(),
    ))
}

/// The single passkey bit committed to in the current round (Vol 3 Part H Section
/// 2.3.5.6.3): the core spec represents "bit is 0"/"bit is 1" as `0x80`/`0x81` rather
/// than a bare `0`/`1`, so the `z` parameter to `f4` always has its top bit set here.
fn passkey_round_bit(pcb: &PairingControlBlock) -> Result<u8, SmpError> {
    let passkey = pcb.passkey.ok_or(SmpError::StateViolation)?;
    let bit = (passkey >> u32::from(pcb.passkey_round)) & 1;
    Ok(0x80 | bit as u8)
}

/// The legacy TK: zero for Just Works, the provided passkey (big-endian, right-aligned)
/// for Passkey Entry. OOB legacy TK sourcing is out of scope without an OOB-data
/// collaborator in scope (see Section 6); `OutOfBand` falls back to zero here.
fn legacy_tk(pcb: &PairingControlBlock) -> [u8; 16] {
    match pcb.model {
        Some(AssociationModel::PasskeyEntry { .. }) => {
            let mut tk = [0u8; 16];
            tk[12..16].copy_from_slice(&pcb.passkey.unwrap_or(0).to_be_bytes());
            tk
        }
        _ => [0u8; 16],
    }
}

fn public_key_halves(pcb: &PairingControlBlock) -> Result<([u8; 32], [u8; 32]), SmpError> {
    let local = pcb.local_public_key.ok_or(SmpError::StateViolation)?;
    let peer = pcb.peer_public_key.ok_or(SmpError::StateViolation)?;
    let (pkb, pka) = if pcb.role == Role::Responder {
        (local.0, peer.0)
    } else {
        (peer.0, local.0)
    };
    Ok((pkb[..32].try_into().unwrap(), pka[..32].try_into().unwrap()))
}

/// Returns `(PKa, PKb)`: the initiator's and responder's public key X-coordinates, in
/// the fixed order `g2` expects (the reverse of `public_key_halves`'s `(PKb, PKa)`).
fn own_and_peer_public_key_by_role(pcb: &PairingControlBlock) -> Result<([u8; 32], [u8; 32]), SmpError> {
    let (pkb, pka) = public_key_halves(pcb)?;
    Ok((pka, pkb))
}

fn addr7(addr: DeviceAddress) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[..6].copy_from_slice(addr.raw());
    out[6] = if addr.is_random() { 1 } else { 0 };
    out
}

/// Returns `(A, B)`: the initiator's and responder's 7-byte (type || address) values,
/// in the fixed order every SC toolbox function (`f5`, `f6`, `g2`) expects regardless
/// of which side is computing it.
fn address_params(pcb: &PairingControlBlock, local: DeviceAddress) -> ([u8; 7], [u8; 7]) {
    if pcb.role == Role::Initiator {
        (addr7(local), addr7(pcb.peer))
    } else {
        (addr7(pcb.peer), addr7(local))
    }
}

/// Returns `(pres, preq, iat, ia, rat, ra)` for legacy `c1`: the raw Pairing
/// Response/Request PDU bytes, and the initiator's/responder's address + address-type,
/// all in the fixed initiator/responder order the formula is defined over.
fn legacy_address_params(
    pcb: &PairingControlBlock,
    local: DeviceAddress,
) -> Result<([u8; 7], [u8; 7], bool, [u8; 6], bool, [u8; 6]), SmpError> {
    let pres = pcb.pres_bytes.ok_or(SmpError::StateViolation)?;
    let preq = pcb.preq_bytes.ok_or(SmpError::StateViolation)?;
    let (initiator, responder) = if pcb.role == Role::Initiator {
        (local, pcb.peer)
    } else {
        (pcb.peer, local)
    };
    Ok((
        pres,
        preq,
        initiator.is_random(),
        *initiator.raw(),
        responder.is_random(),
        *responder.raw(),
    ))
}

/// Returns `(Na, Nb)`: the initiator's and responder's nonces, in the fixed order
/// every SC toolbox function expects, resolved from this side's role.
fn initiator_responder_nonces(pcb: &PairingControlBlock) -> Result<([u8; 16], [u8; 16]), SmpError> {
    let local = pcb.local_nonce.ok_or(SmpError::StateViolation)?;
    let peer = pcb.peer_nonce.ok_or(SmpError::StateViolation)?;
    Ok(if pcb.role == Role::Initiator {
        (local, peer)
    } else {
        (peer, local)
    })
}

/// The 3-octet IOcap input to `f6`: `AuthReq || OOBDataFlag || IOCapability`.
fn io_cap_bytes(io_cap: IoCapability, auth_req: AuthReq, oob: OobDataFlag) -> [u8; 3] {
    [auth_req.to_raw(), oob.into(), io_cap.into()]
}

/// Re-encodes a parsed Pairing Request/Response into the raw 7-byte PDU (opcode +
/// 6-byte body) `c1`'s `preq`/`pres` inputs are defined over. Valid because encoding
/// is the exact inverse of the parse that produced `features` (round-trip invariant).
fn encode_feature_pdu(code: Code, features: &PairingFeatures) -> [u8; 7] {
    [
        code.into(),
        features.io_capability.into(),
        features.oob_data_flag.into(),
        features.auth_req.to_raw(),
        features.max_encryption_key_size,
        features.initiator_key_distribution.bits(),
        features.responder_key_distribution.bits(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareToolbox;
    use crate::device_address::AddressKind;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn addr(b: u8) -> DeviceAddress {
        DeviceAddress::new([b, b, b, b, b, b], AddressKind::Public)
    }

    #[derive(Clone)]
    struct TestTimer(Rc<Cell<Instant>>);

    impl Timer for TestTimer {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    /// A loopback transport: every `write` on handle N is recorded, and fed back via
    /// `drain` so a test can hand it to the peer's `on_data`.
    struct FakeTransport {
        next_handle: u32,
        mtu: u16,
        outbox: HashMap<u32, Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        fn new(mtu: u16) -> Self {
            FakeTransport { next_handle: 0, mtu, outbox: HashMap::new() }
        }

        fn drain(&mut self, handle: TransportHandle) -> Vec<Vec<u8>> {
            self.outbox.remove(&handle.0).unwrap_or_default()
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self, _peer: DeviceAddress, _psm: Psm) -> Result<TransportHandle, crate::Error> {
            let handle = TransportHandle(self.next_handle);
            self.next_handle += 1;
            self.outbox.insert(handle.0, Vec::new());
            Ok(handle)
        }

        fn write(&mut self, handle: TransportHandle, bytes: &[u8]) -> Result<(), crate::Error> {
            self.outbox.entry(handle.0).or_default().push(bytes.to_vec());
            Ok(())
        }

        fn mtu(&self, _handle: TransportHandle) -> u16 {
            self.mtu
        }

        fn close(&mut self, _handle: TransportHandle) {}
    }

    struct TestConfig;
    impl SmpConfig for TestConfig {
        type Timer = TestTimer;
        type Transport = FakeTransport;
        type Crypto = SoftwareToolbox;
    }

    /// Fixed-sequence pretend RNG, consumed front-to-back; panics if a test asks for
    /// more entropy than it stocked. Mirrors the P-256 provider smoke test's fixture.
    struct FixedRng(&'static [u8]);

    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }
        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            if self.0.len() < dest.len() {
                panic!("smp test: ran out of pregenerated entropy");
            }
            dest.copy_from_slice(&self.0[..dest.len()]);
            self.0 = &self.0[dest.len()..];
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for FixedRng {}

    fn new_engine() -> (Pairing<TestConfig>, TestTimer) {
        let timer = TestTimer(Rc::new(Cell::new(Instant::from_raw_micros(0))));
        let engine = Pairing::<TestConfig>::new(
            FakeTransport::new(64),
            timer.clone(),
            SoftwareToolbox::default(),
            Policy::default(),
            addr(0),
        );
        (engine, timer)
    }

    fn drain_one(transport: &mut FakeTransport, handle: TransportHandle) -> Vec<u8> {
        let mut writes = transport.drain(handle);
        assert_eq!(writes.len(), 1);
        writes.pop().unwrap()
    }

    #[test]
    fn legacy_just_works_two_sided_handshake_distributes_keys_and_completes() {
        let (mut initiator, _itimer) = new_engine();
        initiator.local_address = addr(1);
        let (mut responder, _rtimer) = new_engine();
        responder.local_address = addr(2);

        let mut rng_i = FixedRng(&[0xAA; 64]);
        let mut rng_r = FixedRng(&[0x55; 64]);

        let auth_req = AuthReq::new(true, false, false, false, true);
        let all_keys = KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY | KeyDistribution::SIGN_KEY;

        initiator
            .start(addr(2), IoCapability::DisplayOnly, auth_req, all_keys, all_keys)
            .unwrap();
        let handle = TransportHandle(0);
        let pairing_request = drain_one(&mut initiator.transport, handle);

        let event = responder.on_data(handle, addr(1), &pairing_request);
        assert!(matches!(event, Some(AppEvent::IoCapabilityRequest)));

        responder
            .complete_io_capability_reply(IoCapability::NoInputNoOutput, auth_req, all_keys, all_keys)
            .unwrap();
        let pairing_response = drain_one(&mut responder.transport, handle);

        let event = initiator.on_data(handle, addr(2), &pairing_response);
        assert!(event.is_none());
        assert_eq!(initiator.pcb.as_ref().unwrap().model, Some(AssociationModel::JustWorks));

        initiator.begin_key_exchange(&mut rng_i).unwrap();
        responder.begin_key_exchange(&mut rng_r).unwrap();
        assert!(initiator.transport.drain(handle).is_empty(), "legacy key exchange start sends nothing");

        initiator.send_commitment(&mut rng_i).unwrap();
        responder.send_commitment(&mut rng_r).unwrap();
        let m_confirm = drain_one(&mut initiator.transport, handle);
        let s_confirm = drain_one(&mut responder.transport, handle);

        assert!(responder.on_data(handle, addr(1), &m_confirm).is_none());
        assert!(responder.transport.drain(handle).is_empty(), "responder doesn't reply to Mconfirm yet");

        assert!(initiator.on_data(handle, addr(2), &s_confirm).is_none());
        let m_rand = drain_one(&mut initiator.transport, handle);

        assert!(responder.on_data(handle, addr(1), &m_rand).is_none());
        let s_rand = drain_one(&mut responder.transport, handle);
        assert_eq!(responder.pcb.as_ref().unwrap().state, State::EncryptionPending);

        assert!(initiator.on_data(handle, addr(2), &s_rand).is_none());
        assert_eq!(initiator.pcb.as_ref().unwrap().state, State::EncryptionPending);
        assert_eq!(
            initiator.pcb.as_ref().unwrap().ltk,
            responder.pcb.as_ref().unwrap().ltk,
            "both sides must derive the same STK"
        );

        initiator.on_encryption_started().unwrap();
        responder.on_encryption_started().unwrap();

        let from_initiator = initiator.transport.drain(handle);
        assert_eq!(from_initiator.len(), 3, "initiator bursts all three owed keys");
        let from_responder = responder.transport.drain(handle);
        assert_eq!(from_responder.len(), 3, "responder bursts all three owed keys");

        for pdu in &from_initiator {
            assert!(responder.on_data(handle, addr(1), pdu).is_none());
        }
        for pdu in &from_responder {
            assert!(initiator.on_data(handle, addr(2), pdu).is_none());
        }

        let initiator_pcb = initiator.pcb.as_ref().unwrap();
        assert!(initiator_pcb.local_i_key.is_empty());
        assert!(initiator_pcb.local_r_key.is_empty());
        assert!(initiator_pcb.delayed_auth_deadline.is_some());
        let responder_pcb = responder.pcb.as_ref().unwrap();
        assert!(responder_pcb.local_i_key.is_empty());
        assert!(responder_pcb.local_r_key.is_empty());
        assert!(responder_pcb.delayed_auth_deadline.is_some());

        let later = Instant::from_raw_micros(Policy::default().delayed_auth_tail.as_micros() + 1);
        let initiator_outcome = initiator.poll(later).expect("tail delay elapsed");
        let responder_outcome = responder.poll(later).expect("tail delay elapsed");
        assert!(matches!(
            initiator_outcome,
            AppEvent::PairingComplete(PairingOutcome::Success { authenticated: false, derived_link_key: None })
        ));
        assert!(matches!(
            responder_outcome,
            AppEvent::PairingComplete(PairingOutcome::Success { authenticated: false, derived_link_key: None })
        ));
        assert!(initiator.pcb.is_none());
        assert!(responder.pcb.is_none());
    }

    #[test]
    fn secure_connections_only_policy_rejects_just_works() {
        let (mut responder, _timer) = new_engine();
        responder.policy.secure_connections_only = true;

        let auth_req = AuthReq::new(true, false, false, false, false);
        let features = PairingFeatures {
            io_capability: IoCapability::DisplayOnly,
            oob_data_flag: OobDataFlag::NotPresent,
            auth_req,
            max_encryption_key_size: 16,
            initiator_key_distribution: KeyDistribution::ENC_KEY,
            responder_key_distribution: KeyDistribution::ENC_KEY,
        };
        let handle = TransportHandle(0);
        responder.transport.open(addr(1), Psm::Smp).unwrap();
        responder.on_pairing_request(handle, addr(1), features).unwrap();

        let result = responder.complete_io_capability_reply(
            IoCapability::NoInputNoOutput,
            auth_req,
            KeyDistribution::ENC_KEY,
            KeyDistribution::ENC_KEY,
        );
        assert!(matches!(result, Err(SmpError::PolicyRefused)));
    }

    #[test]
    fn malformed_pairing_random_fails_with_invalid_parameters() {
        let (mut engine, _timer) = new_engine();
        engine
            .start(
                addr(9),
                IoCapability::DisplayOnly,
                AuthReq::new(true, false, false, false, false),
                KeyDistribution::ENC_KEY,
                KeyDistribution::ENC_KEY,
            )
            .unwrap();
        let handle = TransportHandle(0);
        engine.transport.drain(handle);

        // Opcode for Pairing Random but only 3 of the required 16 body bytes.
        let truncated = [Code::PairingRandom.into(), 0x01, 0x02, 0x03];
        let event = engine.on_data(handle, addr(9), &truncated);
        assert!(matches!(
            event,
            Some(AppEvent::PairingComplete(PairingOutcome::Failed(PairingFailedReason::InvalidParameters)))
        ));
        assert!(engine.pcb.is_none());

        // Unlike a truncated Pairing Failed, any other malformed PDU still owes the peer
        // a reply.
        let reply = drain_one(&mut engine.transport, handle);
        assert_eq!(reply[0], Code::PairingFailed.into());
        assert_eq!(reply[1], PairingFailedReason::InvalidParameters.to_raw());
    }

    #[test]
    fn truncated_pairing_failed_short_circuits_to_invalid_parameters() {
        let (mut initiator, _timer) = new_engine();
        initiator
            .start(
                addr(9),
                IoCapability::DisplayOnly,
                AuthReq::new(true, false, false, false, false),
                KeyDistribution::ENC_KEY,
                KeyDistribution::ENC_KEY,
            )
            .unwrap();
        let handle = TransportHandle(0);

        // Opcode-only Pairing Failed PDU, missing its single reason byte.
        let truncated = [Code::PairingFailed.into()];
        let event = initiator.on_data(handle, addr(9), &truncated);
        assert!(matches!(
            event,
            Some(AppEvent::PairingComplete(PairingOutcome::Failed(PairingFailedReason::InvalidParameters)))
        ));
        assert!(initiator.pcb.is_none());
    }
}

