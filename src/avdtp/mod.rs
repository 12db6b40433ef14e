//! The AVDTP signaling engine.
//!
//! Drives a pool of [`Ccb`]s (one per signaling session) and [`Scb`]s (one per local
//! stream endpoint) through fragmentation/reassembly, transaction-label bookkeeping,
//! and retransmission, handing fully reassembled signals to the host as [`AvdtpEvent`]s
//! keyed by whichever entity they concern. Like [`crate::smp::Pairing`], this never
//! blocks: every `on_*` method either runs to completion or parks by leaving a timer
//! deadline set, picked back up by a later [`Self::poll`].
//!
//! CCBs and SCBs are addressed by small-integer [`CcbHandle`]/[`ScbHandle`] values
//! into fixed-size pools rather than by reference, so a SCB can name the CCB it is
//! bound to without the two owning each other.

pub mod codec;

use crate::avdtp::codec::{
    decode_header_byte, encode_header_byte, Command, ErrorCode, MediaType, MessageType,
    PacketType, Reject, RejectShape, Response, Seid, ServiceCategory, SepConfiguration, SignalId,
    StreamInformation,
};
pub use crate::avdtp::codec::EndpointType;
use crate::bytes::ByteWriter;
use crate::config::AvdtpConfig;
use crate::device_address::DeviceAddress;
use crate::time::{Duration, Instant, Timer};
use crate::transport::{Psm, Transport, TransportHandle};
use std::collections::VecDeque;

/// Handle to a pool-allocated [`Ccb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CcbHandle(pub u32);

/// Handle to a pool-allocated [`Scb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScbHandle(pub u32);

/// Errors surfaced by the AVDTP engine's own API (as opposed to peer-triggered
/// protocol failures, which are reported as [`AvdtpEvent`]s instead).
#[derive(Debug, thiserror::Error)]
pub enum AvdtpError {
    #[error("no free control channel block")]
    NoFreeCcb,
    #[error("no free stream control block")]
    NoFreeScb,
    #[error("unknown CCB handle")]
    UnknownCcb,
    #[error("unknown SCB handle")]
    UnknownScb,
    #[error("transport lost")]
    TransportLost,
}

/// Tunable timing/retry policy, mirroring [`crate::smp::Policy`]'s role for the SMP
/// engine: the core spec leaves these as implementation choices.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// How many times an unanswered command is retransmitted before the channel
    /// reports a transport failure.
    pub max_retransmits: u8,
    pub retransmit_timeout: Duration,
    pub response_timeout: Duration,
    /// How long a CCB may go without any traffic before [`CcbEvent::Idle`] fires.
    pub idle_timeout: Duration,
    /// MTU assumed for a channel before the transport reports a negotiated value.
    pub default_mtu: u16,
    /// Upper bound on the size of an in-progress reassembly buffer; a CONT/END
    /// fragment that would push it past this is dropped (§4.2, "overflow discards
    /// the in-progress buffer with a warning").
    pub max_reassembly_size: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            max_retransmits: 1,
            retransmit_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(13),
            default_mtu: 48,
            max_reassembly_size: 4096,
        }
    }
}

/// Signals that get their own response/retransmit timer; everything else not named
/// here uses the retransmit timer, and Delay-Report uses neither (§4.2).
fn uses_response_timer_only(signal: SignalId) -> bool {
    matches!(
        signal,
        SignalId::Discover | SignalId::GetCapabilities | SignalId::SecurityControl
    )
}

/// Whether `deadline` has been reached as of `now`. `Instant` only exposes
/// wrapping arithmetic, so this compares via `duration_since`-style wrapping
/// subtraction rather than ordering `Instant`s directly.
fn has_elapsed(now: Instant, deadline: Instant) -> bool {
    let since = Duration::from_micros(now.raw_micros().wrapping_sub(deadline.raw_micros()));
    since < Instant::MAX_TIME_BETWEEN
}

/// The minimum total fragment length (header byte included) accepted for each
/// packet type (§4.2, `asmbl`: "any fragment whose total length is less than the
/// per-packet-type minimum is dropped"). SINGLE/START additionally carry the
/// signal-id byte; CONT/END must carry at least one payload byte to be meaningful.
fn packet_min_len(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::Single => 2,
        PacketType::Start => 3,
        PacketType::Continue | PacketType::End => 2,
    }
}

/// One in-flight outbound signal, queued until [`Avdtp::send`] gets to it.
struct Queued {
    message_type: MessageType,
    signal_id: SignalId,
    scb: Option<ScbHandle>,
    /// Signal-id byte followed by the encoded body; the full unfragmented message.
    payload: Vec<u8>,
}

/// Fragmentation state for the message currently being sent on a CCB.
struct Tx {
    message_type: MessageType,
    signal_id: SignalId,
    label: u8,
    is_command: bool,
    scb: Option<ScbHandle>,
    /// The full, never-mutated `[signal_id] ++ body` payload, kept so a command can
    /// be retransmitted verbatim after it's fully sent once.
    pristine: Vec<u8>,
    /// Bytes not yet written to the transport; starts as a copy of `pristine` and is
    /// drained fragment by fragment.
    remaining: Vec<u8>,
    /// Whether any fragment of this message has already gone out.
    started: bool,
}

impl Tx {
    fn new(message_type: MessageType, signal_id: SignalId, label: u8, is_command: bool, scb: Option<ScbHandle>, payload: Vec<u8>) -> Self {
        Tx {
            message_type,
            signal_id,
            label,
            is_command,
            scb,
            remaining: payload.clone(),
            pristine: payload,
            started: false,
        }
    }
}

/// A command awaiting its response, tracked so the matching reply can be recognized
/// and so it can be retransmitted on timeout.
#[derive(Clone)]
struct Outstanding {
    signal_id: SignalId,
    label: u8,
    scb: Option<ScbHandle>,
    /// Full `[signal_id] ++ body` payload, kept around for retransmission.
    payload: Vec<u8>,
    retransmit_count: u8,
}

/// One AVDTP signaling session to one peer (§3, "Control Channel Block").
struct Ccb {
    peer: DeviceAddress,
    transport: Option<TransportHandle>,
    peer_mtu: u16,
    label_counter: u8,
    congested: bool,
    reassembly: Option<Vec<u8>>,
    cmd_queue: VecDeque<Queued>,
    rsp_queue: VecDeque<Queued>,
    outstanding: Option<Outstanding>,
    current_tx: Option<Tx>,
    /// Label of the most recently dispatched, not-yet-answered inbound command;
    /// `send_rsp`/`send_rej` echo this back. AVDTP only ever has one inbound
    /// transaction in flight per CCB at a time.
    inbound_label: u8,
    idle_deadline: Option<Instant>,
    retransmit_deadline: Option<Instant>,
    response_deadline: Option<Instant>,
}

impl Ccb {
    fn new(peer: DeviceAddress, transport: Option<TransportHandle>, mtu: u16) -> Self {
        Ccb {
            peer,
            transport,
            peer_mtu: mtu,
            label_counter: 0,
            congested: false,
            reassembly: None,
            cmd_queue: VecDeque::new(),
            rsp_queue: VecDeque::new(),
            outstanding: None,
            current_tx: None,
            inbound_label: 0,
            idle_deadline: None,
            retransmit_deadline: None,
            response_deadline: None,
        }
    }

    fn cancel_timers(&mut self) {
        self.retransmit_deadline = None;
        self.response_deadline = None;
    }

    fn next_label(&mut self) -> u8 {
        let label = self.label_counter;
        self.label_counter = (self.label_counter + 1) % 16;
        label
    }
}

/// A local Stream End Point, live for the duration of one stream (§3, "Stream
/// Control Block").
pub struct Scb {
    pub seid: Seid,
    pub in_use: bool,
    pub media_type: MediaType,
    pub endpoint_type: EndpointType,
    pub configuration: SepConfiguration,
    ccb: Option<CcbHandle>,
}

/// Events concerning a CCB as a whole (not keyed by any particular stream endpoint).
#[derive(Debug, Clone)]
pub enum CcbEvent {
    Discover,
    DiscoverResponse(Vec<StreamInformation>),
    Start(Vec<Seid>),
    StartResponse,
    Suspend(Vec<Seid>),
    SuspendResponse,
    GeneralReject,
    Reject { signal: SignalId, reject: Reject },
    /// The channel has gone this long without any signaling traffic; the host
    /// decides whether that warrants closing it.
    Idle,
    /// A command went unanswered past the retransmit budget, or a response never
    /// arrived before the response timer fired.
    TransportFailure { signal: SignalId },
}

/// Events concerning one stream endpoint, keyed by its local SEID.
#[derive(Debug, Clone)]
pub enum ScbEvent {
    GetCapabilities,
    GetAllCapabilities,
    CapabilitiesResponse(SepConfiguration),
    SetConfiguration { int_seid: Seid, capabilities: SepConfiguration },
    GetConfiguration,
    ConfigurationResponse(SepConfiguration),
    Reconfigure(SepConfiguration),
    Open,
    Close,
    Abort,
    SecurityControl(Vec<u8>),
    SecurityControlResponse(Vec<u8>),
    DelayReport(u16),
    Accept,
    Reject { signal: SignalId, reject: Reject },
    TransportFailure { signal: SignalId },
}

/// One reassembled/dispatched signal, tagged by which entity it concerns (§9:
/// tagged enum in place of the source's high-bit-tagged event ids).
#[derive(Debug, Clone)]
pub enum AvdtpEvent {
    Ccb(CcbHandle, CcbEvent),
    Scb(ScbHandle, ScbEvent),
}

fn route_failure(handle: CcbHandle, outstanding: &Outstanding) -> AvdtpEvent {
    let signal = outstanding.signal_id;
    match outstanding.scb {
        Some(scb) => AvdtpEvent::Scb(scb, ScbEvent::TransportFailure { signal }),
        None => AvdtpEvent::Ccb(handle, CcbEvent::TransportFailure { signal }),
    }
}

/// The AVDTP signaling engine for one host.
///
/// Owns fixed-size CCB and SCB pools; `transport`/`timer` are shared across every
/// CCB the same way [`crate::smp::Pairing`] owns one transport per pairing.
pub struct Avdtp<C: AvdtpConfig> {
    transport: C::Transport,
    timer: C::Timer,
    policy: Policy,
    ccbs: Vec<Option<Ccb>>,
    scbs: Vec<Option<Scb>>,
}

impl<C: AvdtpConfig> Avdtp<C> {
    pub fn new(transport: C::Transport, timer: C::Timer, policy: Policy, max_ccbs: usize, max_scbs: usize) -> Self {
        Avdtp {
            transport,
            timer,
            policy,
            ccbs: (0..max_ccbs).map(|_| None).collect(),
            scbs: (0..max_scbs).map(|_| None).collect(),
        }
    }

    // ---- pool management ----------------------------------------------------

    /// Allocates a SCB for a local stream endpoint. Pools are sized at construction
    /// (§3: "allocated at startup from a fixed pool").
    pub fn alloc_stream(&mut self, seid: Seid, media_type: MediaType, endpoint_type: EndpointType) -> Result<ScbHandle, AvdtpError> {
        let idx = self.scbs.iter().position(|s| s.is_none()).ok_or(AvdtpError::NoFreeScb)?;
        self.scbs[idx] = Some(Scb {
            seid,
            in_use: false,
            media_type,
            endpoint_type,
            configuration: SepConfiguration::default(),
            ccb: None,
        });
        Ok(ScbHandle(idx as u32))
    }

    pub fn stream(&self, handle: ScbHandle) -> Option<&Scb> {
        self.scbs.get(handle.0 as usize)?.as_ref()
    }

    fn scb_mut(&mut self, handle: ScbHandle) -> Result<&mut Scb, AvdtpError> {
        self.scbs
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(AvdtpError::UnknownScb)
    }

    fn find_scb_by_seid(&self, ccb: CcbHandle, seid: Seid) -> Option<ScbHandle> {
        self.scbs.iter().enumerate().find_map(|(i, s)| {
            let s = s.as_ref()?;
            if s.ccb == Some(ccb) && s.seid == seid {
                Some(ScbHandle(i as u32))
            } else {
                None
            }
        })
    }

    fn ccb_mut(&mut self, handle: CcbHandle) -> Result<&mut Ccb, AvdtpError> {
        self.ccbs
            .get_mut(handle.0 as usize)
            .and_then(|c| c.as_mut())
            .ok_or(AvdtpError::UnknownCcb)
    }

    fn find_ccb_by_transport(&self, transport: TransportHandle) -> Option<CcbHandle> {
        self.ccbs.iter().enumerate().find_map(|(i, c)| {
            let c = c.as_ref()?;
            if c.transport == Some(transport) {
                Some(CcbHandle(i as u32))
            } else {
                None
            }
        })
    }

    /// Opens a signaling (or browsing) channel to `peer`, allocating a fresh CCB.
    ///
    /// Like [`crate::smp::Pairing::start`], the channel is treated as writable as
    /// soon as `Transport::open` returns rather than waiting on a separate connect
    /// confirmation event; a transport that genuinely needs to negotiate first
    /// should delay returning from `open` until it's ready.
    pub fn open(&mut self, peer: DeviceAddress, browsing: bool) -> Result<CcbHandle, AvdtpError> {
        let idx = self.ccbs.iter().position(|c| c.is_none()).ok_or(AvdtpError::NoFreeCcb)?;
        let psm = if browsing { Psm::AvdtpBrowsing } else { Psm::AvdtpSignaling };
        let transport = self
            .transport
            .open(peer, psm)
            .map_err(|_| AvdtpError::TransportLost)?;
        let mtu = self.transport.mtu(transport).max(self.policy.default_mtu);
        self.ccbs[idx] = Some(Ccb::new(peer, Some(transport), mtu));
        Ok(CcbHandle(idx as u32))
    }

    /// Registers a CCB for a channel the peer opened to us.
    pub fn on_connect_ind(&mut self, peer: DeviceAddress, transport: TransportHandle) -> Result<CcbHandle, AvdtpError> {
        let idx = self.ccbs.iter().position(|c| c.is_none()).ok_or(AvdtpError::NoFreeCcb)?;
        let mtu = self.transport.mtu(transport).max(self.policy.default_mtu);
        self.ccbs[idx] = Some(Ccb::new(peer, Some(transport), mtu));
        Ok(CcbHandle(idx as u32))
    }

    /// Tears down a CCB: cancels its timers, drops any in-progress reassembly, fails
    /// out the outstanding command (if any), and releases every SCB bound to it
    /// (§3: "destroyed when channel closes and all SCBs referencing it are released").
    pub fn on_disconnect(&mut self, handle: CcbHandle) -> Vec<AvdtpEvent> {
        let mut events = Vec::new();
        if let Ok(ccb) = self.ccb_mut(handle) {
            ccb.cancel_timers();
            ccb.reassembly = None;
            if let Some(outstanding) = ccb.outstanding.take() {
                events.push(route_failure(handle, &outstanding));
            }
        }
        for scb in &mut self.scbs {
            if let Some(scb) = scb {
                if scb.ccb == Some(handle) {
                    scb.ccb = None;
                    scb.in_use = false;
                }
            }
        }
        if let Some(slot) = self.ccbs.get_mut(handle.0 as usize) {
            *slot = None;
        }
        events
    }

    pub fn on_congested(&mut self, handle: CcbHandle, congested: bool) {
        if let Ok(ccb) = self.ccb_mut(handle) {
            ccb.congested = congested;
        }
        if !congested {
            let _ = self.send(handle);
        }
    }

    // ---- outbound path --------------------------------------------------------

    /// Queues a command for `scb` (or `None` for a CCB-scoped command like Discover,
    /// Start, Suspend) and kicks off sending.
    pub fn send_cmd(&mut self, handle: CcbHandle, scb: Option<ScbHandle>, command: &Command) -> Result<(), AvdtpError> {
        let payload = encode_command(command);
        let ccb = self.ccb_mut(handle)?;
        ccb.cmd_queue.push_back(Queued {
            message_type: MessageType::Command,
            signal_id: command.signal(),
            scb,
            payload,
        });
        self.send(handle)
    }

    /// Queues a positive response to the most recently dispatched inbound command
    /// and kicks off sending.
    pub fn send_rsp(&mut self, handle: CcbHandle, signal: SignalId, response: &Response) -> Result<(), AvdtpError> {
        let payload = encode_response(signal, response);
        let ccb = self.ccb_mut(handle)?;
        ccb.rsp_queue.push_back(Queued {
            message_type: MessageType::ResponseAccept,
            signal_id: signal,
            scb: None,
            payload,
        });
        self.send(handle)
    }

    /// Queues a rejection of `signal` and kicks off sending. Per §4.2, Abort is
    /// never replied to with a reject; callers must not call this for Abort.
    pub fn send_rej(&mut self, handle: CcbHandle, signal: SignalId, reject: Reject) -> Result<(), AvdtpError> {
        debug_assert_ne!(signal, SignalId::Abort, "Abort must never be rejected");
        let message_type = if matches!(reject, Reject::General) {
            MessageType::GeneralReject
        } else {
            MessageType::ResponseReject
        };
        let payload = encode_reject(signal, &reject);
        let ccb = self.ccb_mut(handle)?;
        ccb.rsp_queue.push_back(Queued {
            message_type,
            signal_id: signal,
            scb: None,
            payload,
        });
        self.send(handle)
    }

    /// The fragmentation loop (§4.2, `send`): drains the response queue first (so a
    /// peer's command is never left waiting behind one of ours), then the command
    /// queue, one unfragmented message at a time while the channel isn't congested
    /// and no command is already outstanding.
    fn send(&mut self, handle: CcbHandle) -> Result<(), AvdtpError> {
        loop {
            let transport_handle = {
                let ccb = self.ccb_mut(handle)?;
                if ccb.congested {
                    return Ok(());
                }
                if ccb.current_tx.is_none() {
                    if let Some(next) = ccb.rsp_queue.pop_front() {
                        // Responses/rejects echo the label of the command they answer.
                        let label = ccb.inbound_label;
                        ccb.current_tx = Some(Tx::new(next.message_type, next.signal_id, label, false, next.scb, next.payload));
                    } else if ccb.outstanding.is_none() {
                        if let Some(next) = ccb.cmd_queue.pop_front() {
                            let label = ccb.next_label();
                            ccb.current_tx = Some(Tx::new(next.message_type, next.signal_id, label, true, next.scb, next.payload));
                        } else {
                            return Ok(());
                        }
                    } else {
                        return Ok(());
                    }
                }
                match ccb.transport {
                    Some(t) => t,
                    None => return Ok(()),
                }
            };

            let frame = {
                let ccb = self.ccb_mut(handle)?;
                build_next_fragment(ccb)
            };
            let Some(frame) = frame else { return Ok(()) };

            self.transport
                .write(transport_handle, &frame)
                .map_err(|_| AvdtpError::TransportLost)?;

            let now = self.timer.now();
            let ccb = self.ccb_mut(handle)?;
            ccb.idle_deadline = Some(now + self.policy.idle_timeout);

            if ccb.current_tx.as_ref().map(|tx| tx.remaining.is_empty()) == Some(true) {
                let tx = ccb.current_tx.take().unwrap();
                if tx.is_command {
                    self.finish_command_tx(handle, tx, now)?;
                }
            }
        }
    }

    /// Called once an outbound command's last fragment has gone out: installs the
    /// `Outstanding` record and starts whichever timer governs this signal.
    fn finish_command_tx(&mut self, handle: CcbHandle, tx: Tx, now: Instant) -> Result<(), AvdtpError> {
        let ccb = self.ccb_mut(handle)?;
        ccb.outstanding = Some(Outstanding {
            signal_id: tx.signal_id,
            label: tx.label,
            scb: tx.scb,
            payload: tx.pristine,
            retransmit_count: 0,
        });
        if tx.signal_id != SignalId::DelayReport {
            if uses_response_timer_only(tx.signal_id) || self.policy.max_retransmits == 0 {
                ccb.response_deadline = Some(now + self.policy.response_timeout);
            } else {
                ccb.retransmit_deadline = Some(now + self.policy.retransmit_timeout);
            }
        }
        Ok(())
    }

    // ---- inbound path -----------------------------------------------------------

    /// Feeds one inbound transport fragment into the CCB's reassembler, and dispatches
    /// the result (if reassembly completed) to the appropriate CCB/SCB handler.
    ///
    /// Returns every [`AvdtpEvent`] produced (zero or more: a Close/Abort reply also
    /// unblocks the next queued command, but that never itself produces an event).
    pub fn on_data(&mut self, handle: CcbHandle, bytes: &[u8]) -> Vec<AvdtpEvent> {
        let complete = {
            let ccb = match self.ccb_mut(handle) {
                Ok(c) => c,
                Err(_) => return Vec::new(),
            };
            let now = self.timer.now();
            ccb.idle_deadline = Some(now + self.policy.idle_timeout);
            asmbl(ccb, bytes, self.policy.max_reassembly_size)
        };
        match complete {
            Some(buf) => self.msg_ind(handle, &buf),
            None => Vec::new(),
        }
    }

    /// Dispatch (§4.2, `msg_ind`): parses the normalized (SINGLE-shaped) reassembled
    /// buffer and routes it to a CCB or SCB event, or replies inline (General-Reject,
    /// per-signal Reject) where the engine itself owns the reply.
    fn msg_ind(&mut self, handle: CcbHandle, buf: &[u8]) -> Vec<AvdtpEvent> {
        if buf.len() < 2 {
            return Vec::new();
        }
        let (label, _packet_type, message_type) = decode_header_byte(buf[0]);
        let signal_raw = buf[1];
        let signal_id = SignalId::from(signal_raw);
        let body = &buf[2..];

        match message_type {
            MessageType::Command => self.dispatch_command(handle, label, signal_id, signal_raw, body),
            MessageType::GeneralReject | MessageType::ResponseAccept | MessageType::ResponseReject => {
                self.dispatch_reply(handle, label, message_type, signal_id, body)
            }
        }
    }

    fn dispatch_command(&mut self, handle: CcbHandle, label: u8, signal_id: SignalId, signal_raw: u8, body: &[u8]) -> Vec<AvdtpEvent> {
        if let Ok(ccb) = self.ccb_mut(handle) {
            ccb.inbound_label = label;
        }
        if !SignalId::in_range(signal_raw) {
            let _ = self.send_rej(handle, signal_id, Reject::General);
            return Vec::new();
        }
        match Command::decode(signal_id, body) {
            Err(code) => {
                if signal_id != SignalId::Abort {
                    let _ = self.send_rej(handle, signal_id, reject_for(signal_id, code, None));
                }
                Vec::new()
            }
            Ok(command) => self.route_command(handle, signal_id, command),
        }
    }

    /// Maps one decoded command to an `AvdtpEvent`, looking up (and where needed,
    /// binding) the target SCB for SEID-keyed signals.
    fn route_command(&mut self, handle: CcbHandle, signal_id: SignalId, command: Command) -> Vec<AvdtpEvent> {
        match command {
            Command::Discover => vec![AvdtpEvent::Ccb(handle, CcbEvent::Discover)],
            Command::Start { acp_seids } => vec![AvdtpEvent::Ccb(handle, CcbEvent::Start(acp_seids))],
            Command::Suspend { acp_seids } => vec![AvdtpEvent::Ccb(handle, CcbEvent::Suspend(acp_seids))],
            Command::GetCapabilities { acp_seid } => {
                self.with_scb_for(handle, signal_id, acp_seid, |_scb| ScbEvent::GetCapabilities)
            }
            Command::GetAllCapabilities { acp_seid } => {
                self.with_scb_for(handle, signal_id, acp_seid, |_scb| ScbEvent::GetAllCapabilities)
            }
            Command::GetConfiguration { acp_seid } => {
                self.with_scb_for(handle, signal_id, acp_seid, |_scb| ScbEvent::GetConfiguration)
            }
            Command::SetConfiguration { acp_seid, int_seid, capabilities } => {
                match self.find_scb_by_seid(handle, acp_seid) {
                    None => {
                        let _ = self.send_rej(handle, signal_id, Reject::Configuration { category: ServiceCategory::MediaTransport, error_code: ErrorCode::BadAcpSeid });
                        Vec::new()
                    }
                    Some(scb_handle) => {
                        let scb = self.scb_mut(scb_handle).expect("found by seid");
                        if scb.in_use {
                            drop(scb);
                            let _ = self.send_rej(handle, signal_id, Reject::Configuration { category: ServiceCategory::MediaTransport, error_code: ErrorCode::SepInUse });
                            return Vec::new();
                        }
                        scb.in_use = true;
                        scb.ccb = Some(handle);
                        scb.configuration = capabilities.clone();
                        vec![AvdtpEvent::Scb(scb_handle, ScbEvent::SetConfiguration { int_seid, capabilities })]
                    }
                }
            }
            Command::Reconfigure { acp_seid, capabilities } => {
                match self.find_scb_by_seid(handle, acp_seid) {
                    None => {
                        let _ = self.send_rej(handle, signal_id, Reject::Configuration { category: ServiceCategory::MediaTransport, error_code: ErrorCode::BadAcpSeid });
                        Vec::new()
                    }
                    Some(scb_handle) => {
                        if let Ok(scb) = self.scb_mut(scb_handle) {
                            scb.configuration = capabilities.clone();
                        }
                        vec![AvdtpEvent::Scb(scb_handle, ScbEvent::Reconfigure(capabilities))]
                    }
                }
            }
            Command::Open { acp_seid } => self.with_scb_for(handle, signal_id, acp_seid, |_scb| ScbEvent::Open),
            Command::Close { acp_seid } => {
                let result = self.with_scb_for(handle, signal_id, acp_seid, |_scb| ScbEvent::Close);
                if let Some(scb_handle) = self.find_scb_by_seid(handle, acp_seid) {
                    if let Ok(scb) = self.scb_mut(scb_handle) {
                        scb.in_use = false;
                        scb.ccb = None;
                    }
                }
                result
            }
            Command::Abort { acp_seid } => {
                match self.find_scb_by_seid(handle, acp_seid) {
                    // Never reply with a reject for Abort; an unknown SEID is just dropped.
                    None => Vec::new(),
                    Some(scb_handle) => {
                        if let Ok(scb) = self.scb_mut(scb_handle) {
                            scb.in_use = false;
                            scb.ccb = None;
                        }
                        vec![AvdtpEvent::Scb(scb_handle, ScbEvent::Abort)]
                    }
                }
            }
            Command::SecurityControl { acp_seid, data } => {
                self.with_scb_for(handle, signal_id, acp_seid, move |_scb| ScbEvent::SecurityControl(data))
            }
            Command::DelayReport { acp_seid, delay } => {
                self.with_scb_for(handle, signal_id, acp_seid, move |_scb| ScbEvent::DelayReport(delay))
            }
        }
    }

    /// Looks up the SCB for `acp_seid` on `handle`, replying `BadAcpSeid` and
    /// producing no event if it isn't found (bound to this CCB).
    fn with_scb_for(&mut self, handle: CcbHandle, signal_id: SignalId, acp_seid: Seid, make_event: impl FnOnce(&Scb) -> ScbEvent) -> Vec<AvdtpEvent> {
        match self.find_scb_by_seid(handle, acp_seid) {
            Some(scb_handle) => {
                let event = {
                    let scb = self.scb_mut(scb_handle).expect("found by seid");
                    make_event(scb)
                };
                vec![AvdtpEvent::Scb(scb_handle, event)]
            }
            None => {
                let _ = self.send_rej(handle, signal_id, reject_for(signal_id, ErrorCode::BadAcpSeid, Some(acp_seid)));
                Vec::new()
            }
        }
    }

    /// Handles an inbound response/reject/general-reject: cross-checks it against
    /// the CCB's outstanding command (§4.2: "mismatches are dropped"), then decodes
    /// and routes it.
    fn dispatch_reply(&mut self, handle: CcbHandle, label: u8, message_type: MessageType, signal_id: SignalId, body: &[u8]) -> Vec<AvdtpEvent> {
        let outstanding = match self.ccb_mut(handle) {
            Ok(ccb) => match &ccb.outstanding {
                Some(o) if o.label == label && (message_type == MessageType::GeneralReject || o.signal_id == signal_id) => o.clone(),
                _ => return Vec::new(),
            },
            Err(_) => return Vec::new(),
        };

        if let Ok(ccb) = self.ccb_mut(handle) {
            ccb.cancel_timers();
            ccb.outstanding = None;
        }

        let reply_signal = outstanding.signal_id;
        let event = match message_type {
            MessageType::ResponseAccept => Response::decode(reply_signal, body).ok().map(|response| {
                response_event(handle, reply_signal, outstanding.scb, response)
            }),
            MessageType::GeneralReject => Some(reject_event(handle, reply_signal, outstanding.scb, Reject::General)),
            MessageType::ResponseReject => {
                let shape = Reject::shape_for(reply_signal);
                Reject::decode(shape, body)
                    .ok()
                    .map(|reject| reject_event(handle, reply_signal, outstanding.scb, reject))
            }
            MessageType::Command => unreachable!("handled by dispatch_command"),
        };

        // A reply frees up the channel for the next queued command regardless of
        // whether it decoded cleanly.
        let _ = self.send(handle);

        event.into_iter().collect()
    }

    // ---- timers -----------------------------------------------------------------

    /// Polls every CCB's idle/retransmit/response timers; call on every timer-fired
    /// event from the host's event loop (or just periodically with the current time).
    pub fn poll(&mut self, now: Instant) -> Vec<AvdtpEvent> {
        let mut events = Vec::new();
        let handles: Vec<CcbHandle> = self
            .ccbs
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| CcbHandle(i as u32)))
            .collect();
        for handle in handles {
            events.extend(self.poll_ccb(handle, now));
        }
        events
    }

    fn poll_ccb(&mut self, handle: CcbHandle, now: Instant) -> Vec<AvdtpEvent> {
        let mut events = Vec::new();

        let idle_fired = self.ccb_mut(handle).ok().map_or(false, |ccb| {
            ccb.idle_deadline.map_or(false, |deadline| has_elapsed(now, deadline))
        });
        if idle_fired {
            if let Ok(ccb) = self.ccb_mut(handle) {
                ccb.idle_deadline = None;
            }
            events.push(AvdtpEvent::Ccb(handle, CcbEvent::Idle));
        }

        let response_fired = self.ccb_mut(handle).ok().map_or(false, |ccb| {
            ccb.response_deadline.map_or(false, |deadline| has_elapsed(now, deadline))
        });
        if response_fired {
            if let Ok(ccb) = self.ccb_mut(handle) {
                ccb.cancel_timers();
                if let Some(outstanding) = ccb.outstanding.take() {
                    events.push(route_failure(handle, &outstanding));
                }
            }
            let _ = self.send(handle);
            return events;
        }

        let retransmit_fired = self.ccb_mut(handle).ok().map_or(false, |ccb| {
            ccb.retransmit_deadline.map_or(false, |deadline| has_elapsed(now, deadline))
        });
        if retransmit_fired {
            events.extend(self.fire_retransmit(handle, now));
        }

        events
    }

    fn fire_retransmit(&mut self, handle: CcbHandle, now: Instant) -> Vec<AvdtpEvent> {
        let transport_handle = match self.ccb_mut(handle) {
            Ok(ccb) => match ccb.transport {
                Some(t) => t,
                None => return Vec::new(),
            },
            Err(_) => return Vec::new(),
        };

        let exceeded = {
            let ccb = match self.ccb_mut(handle) {
                Ok(c) => c,
                Err(_) => return Vec::new(),
            };
            match ccb.outstanding.as_mut() {
                Some(o) => {
                    o.retransmit_count += 1;
                    o.retransmit_count > self.policy.max_retransmits
                }
                None => {
                    ccb.retransmit_deadline = None;
                    return Vec::new();
                }
            }
        };

        if exceeded {
            let ccb = self.ccb_mut(handle).unwrap();
            ccb.cancel_timers();
            let outstanding = ccb.outstanding.take().unwrap();
            let event = route_failure(handle, &outstanding);
            let _ = self.send(handle);
            return vec![event];
        }

        let ccb = self.ccb_mut(handle).unwrap();
        let payload = ccb.outstanding.as_ref().unwrap().payload.clone();
        let label = ccb.outstanding.as_ref().unwrap().label;
        let scb = ccb.outstanding.as_ref().unwrap().scb;
        ccb.current_tx = Some(Tx::new(MessageType::Command, ccb.outstanding.as_ref().unwrap().signal_id, label, true, scb, payload));
        // Re-send without re-entering `finish_command_tx` (the Outstanding record
        // already exists and must keep its retransmit count).
        while let Some(frame) = build_next_fragment(ccb) {
            if self.transport.write(transport_handle, &frame).is_err() {
                break;
            }
        }
        let ccb = self.ccb_mut(handle).unwrap();
        ccb.retransmit_deadline = Some(now + self.policy.retransmit_timeout);
        ccb.idle_deadline = Some(now + self.policy.idle_timeout);
        Vec::new()
    }
}

/// Builds the `Reject` shape appropriate for `signal`, given an error code and
/// (for `Stream`-shaped rejects) the offending SEID.
fn reject_for(signal: SignalId, error_code: ErrorCode, seid: Option<Seid>) -> Reject {
    match Reject::shape_for(signal) {
        RejectShape::Simple => Reject::Simple { error_code },
        RejectShape::Configuration => Reject::Configuration {
            category: ServiceCategory::MediaTransport,
            error_code,
        },
        RejectShape::Stream => Reject::Stream {
            seid: seid.unwrap_or_else(|| Seid::new(Seid::MIN).unwrap()),
            error_code,
        },
    }
}

fn response_event(handle: CcbHandle, signal: SignalId, scb: Option<ScbHandle>, response: Response) -> AvdtpEvent {
    match (scb, response) {
        (_, Response::Discover { streams }) => AvdtpEvent::Ccb(handle, CcbEvent::DiscoverResponse(streams)),
        (_, Response::Capabilities { capabilities }) if signal == SignalId::GetConfiguration => {
            AvdtpEvent::Scb(scb.expect("GetConfiguration always SCB-scoped"), ScbEvent::ConfigurationResponse(capabilities))
        }
        (_, Response::Capabilities { capabilities }) => {
            AvdtpEvent::Scb(scb.expect("Get(All)Capabilities always SCB-scoped"), ScbEvent::CapabilitiesResponse(capabilities))
        }
        (_, Response::SecurityControl { data }) => {
            AvdtpEvent::Scb(scb.expect("SecurityControl always SCB-scoped"), ScbEvent::SecurityControlResponse(data))
        }
        (None, Response::Accept) if signal == SignalId::Start => AvdtpEvent::Ccb(handle, CcbEvent::StartResponse),
        (None, Response::Accept) if signal == SignalId::Suspend => AvdtpEvent::Ccb(handle, CcbEvent::SuspendResponse),
        (Some(scb), Response::Accept) => AvdtpEvent::Scb(scb, ScbEvent::Accept),
        (None, Response::Accept) => AvdtpEvent::Ccb(handle, CcbEvent::StartResponse),
    }
}

fn reject_event(handle: CcbHandle, signal: SignalId, scb: Option<ScbHandle>, reject: Reject) -> AvdtpEvent {
    match scb {
        Some(scb) => AvdtpEvent::Scb(scb, ScbEvent::Reject { signal, reject }),
        None => match reject {
            Reject::General => AvdtpEvent::Ccb(handle, CcbEvent::GeneralReject),
            other => AvdtpEvent::Ccb(handle, CcbEvent::Reject { signal, reject: other }),
        },
    }
}

/// Reassembly (§4.2, `asmbl`). Returns the normalized (SINGLE-shaped) complete
/// buffer once a message finishes reassembling, or `None` while it's still in
/// progress (or the fragment was dropped).
fn asmbl(ccb: &mut Ccb, fragment: &[u8], max_capacity: usize) -> Option<Vec<u8>> {
    if fragment.is_empty() {
        return None;
    }
    let (_label, packet_type, _message_type) = decode_header_byte(fragment[0]);
    if fragment.len() < packet_min_len(packet_type) {
        warn!("AVDTP: dropping undersized {:?} fragment ({} bytes)", packet_type, fragment.len());
        return None;
    }

    match packet_type {
        PacketType::Single => {
            ccb.reassembly = None;
            Some(fragment.to_vec())
        }
        PacketType::Start => {
            // fragment = [header][nosp][signal_id][payload...]; normalize by
            // overwriting nosp with signal_id so the buffer looks SINGLE-shaped.
            let mut buf = fragment.to_vec();
            buf[1] = buf[2];
            buf.remove(2);
            ccb.reassembly = Some(buf);
            None
        }
        PacketType::Continue => {
            match ccb.reassembly.as_mut() {
                None => {
                    warn!("AVDTP: CONT fragment with no reassembly in progress");
                    None
                }
                Some(buf) => {
                    let payload = &fragment[1..];
                    if buf.len() + payload.len() > max_capacity {
                        warn!("AVDTP: reassembly buffer overflow, discarding");
                        ccb.reassembly = None;
                    } else {
                        buf.extend_from_slice(payload);
                    }
                    None
                }
            }
        }
        PacketType::End => {
            match ccb.reassembly.take() {
                None => {
                    warn!("AVDTP: END fragment with no reassembly in progress");
                    None
                }
                Some(mut buf) => {
                    let payload = &fragment[1..];
                    if buf.len() + payload.len() > max_capacity {
                        warn!("AVDTP: reassembly buffer overflow on END, discarding");
                        None
                    } else {
                        buf.extend_from_slice(payload);
                        Some(buf)
                    }
                }
            }
        }
    }
}

/// Builds the next outbound fragment for `ccb`'s current message (§4.2, `send`'s
/// fragmentation step), advancing `current_tx.remaining`. Returns `None` if there's
/// no message in flight.
fn build_next_fragment(ccb: &mut Ccb) -> Option<Vec<u8>> {
    let mtu = ccb.peer_mtu.max(3) as usize;
    let tx = ccb.current_tx.as_mut()?;

    if !tx.started {
        let body_len = tx.remaining.len().saturating_sub(1);
        if body_len <= mtu.saturating_sub(2) {
            // SINGLE: the whole message fits in one packet.
            let mut frame = Vec::with_capacity(1 + tx.remaining.len());
            frame.push(encode_header_byte(tx.label, PacketType::Single, tx.message_type));
            frame.extend_from_slice(&tx.remaining);
            tx.remaining.clear();
            tx.started = true;
            Some(frame)
        } else {
            // START: nosp = ceil((len + 1) / (peer_mtu - 1)) + 1, per §4.2.
            let denom = mtu.saturating_sub(1).max(1);
            let nosp = (((body_len + 1) + denom - 1) / denom + 1).min(u8::MAX as usize) as u8;
            let max_chunk = mtu.saturating_sub(3);
            let sigid_byte = tx.remaining[0];
            let take = max_chunk.min(tx.remaining.len() - 1);
            let mut frame = Vec::with_capacity(3 + take);
            frame.push(encode_header_byte(tx.label, PacketType::Start, tx.message_type));
            frame.push(nosp);
            frame.push(sigid_byte);
            frame.extend_from_slice(&tx.remaining[1..1 + take]);
            tx.remaining.drain(0..1 + take);
            tx.started = true;
            Some(frame)
        }
    } else {
        if tx.remaining.is_empty() {
            return None;
        }
        let max_chunk = mtu.saturating_sub(1);
        if tx.remaining.len() <= max_chunk {
            let mut frame = Vec::with_capacity(1 + tx.remaining.len());
            frame.push(encode_header_byte(tx.label, PacketType::End, tx.message_type));
            frame.extend_from_slice(&tx.remaining);
            tx.remaining.clear();
            Some(frame)
        } else {
            let take = max_chunk;
            let mut frame = Vec::with_capacity(1 + take);
            frame.push(encode_header_byte(tx.label, PacketType::Continue, tx.message_type));
            frame.extend_from_slice(&tx.remaining[..take]);
            tx.remaining.drain(0..take);
            Some(frame)
        }
    }
}

/// Encodes a command's `[signal_id] ++ body` payload (the signal-id byte travels
/// inside the payload so retransmission and fragmentation don't need to know which
/// signal is in flight).
fn encode_command(command: &Command) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    let len = {
        let mut writer = ByteWriter::new(&mut buf);
        let before = writer.space_left();
        command.encode(&mut writer).expect("command body exceeds scratch buffer");
        before - writer.space_left()
    };
    buf.truncate(len);
    let mut payload = Vec::with_capacity(1 + len);
    payload.push(u8::from(command.signal()));
    payload.extend_from_slice(&buf);
    payload
}

fn encode_response(signal: SignalId, response: &Response) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    let len = {
        let mut writer = ByteWriter::new(&mut buf);
        let before = writer.space_left();
        response.encode(signal, &mut writer).expect("response body exceeds scratch buffer");
        before - writer.space_left()
    };
    buf.truncate(len);
    let mut payload = Vec::with_capacity(1 + len);
    payload.push(u8::from(signal));
    payload.extend_from_slice(&buf);
    payload
}

fn encode_reject(signal: SignalId, reject: &Reject) -> Vec<u8> {
    let mut buf = [0u8; 8];
    let len = {
        let mut writer = ByteWriter::new(&mut buf);
        let before = writer.space_left();
        reject.encode(&mut writer).expect("reject body exceeds scratch buffer");
        before - writer.space_left()
    };
    let mut payload = Vec::with_capacity(1 + len);
    payload.push(u8::from(signal));
    payload.extend_from_slice(&buf[..len]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::ByteReader;
    use crate::device_address::AddressKind;
    use crate::time::Timer;
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
    impl AvdtpConfig for TestConfig {
        type Timer = TestTimer;
        type Transport = FakeTransport;
    }

    fn new_engine(mtu: u16) -> (Avdtp<TestConfig>, CcbHandle, TestTimer) {
        let timer = TestTimer(Rc::new(Cell::new(Instant::from_raw_micros(0))));
        let mut engine = Avdtp::<TestConfig>::new(FakeTransport::new(mtu), timer.clone(), Policy::default(), 4, 4);
        let ccb = engine.open(addr(1), false).unwrap();
        (engine, ccb, timer)
    }

    /// Splits an encoded message the way a real fragmenter would, by repeatedly
    /// calling `build_next_fragment` on a synthetic `Ccb`, then feeds the fragments
    /// through `asmbl` and checks the reassembled buffer matches.
    #[test]
    fn fragmentation_then_reassembly_round_trips() {
        let mut ccb = Ccb::new(addr(2), None, 23);
        let body: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let mut payload = vec![SignalId::SetConfiguration.into()];
        payload.extend_from_slice(&body);
        ccb.current_tx = Some(Tx::new(MessageType::Command, SignalId::SetConfiguration, 5, true, None, payload.clone()));

        let mut fragments = Vec::new();
        while let Some(frame) = build_next_fragment(&mut ccb) {
            fragments.push(frame);
            if ccb.current_tx.as_ref().unwrap().remaining.is_empty() {
                break;
            }
        }
        assert!(fragments.len() > 1, "200-byte body over a 23-byte MTU must fragment");

        let mut receiver = Ccb::new(addr(1), None, 23);
        let mut result = None;
        for frag in &fragments {
            result = asmbl(&mut receiver, frag, 4096);
        }
        let reassembled = result.expect("END fragment completes reassembly");
        assert_eq!(reassembled[0] >> 4, 5, "label preserved in header");
        assert_eq!(reassembled[1], u8::from(SignalId::SetConfiguration));
        assert_eq!(&reassembled[2..], &payload[1..]);
    }

    #[test]
    fn single_fragment_fits_when_small() {
        let mut ccb = Ccb::new(addr(2), None, 48);
        let payload = vec![SignalId::Discover.into()];
        ccb.current_tx = Some(Tx::new(MessageType::Command, SignalId::Discover, 0, true, None, payload));
        let frame = build_next_fragment(&mut ccb).unwrap();
        let (_label, pt, _mt) = decode_header_byte(frame[0]);
        assert_eq!(pt, PacketType::Single);
        assert!(ccb.current_tx.unwrap().remaining.is_empty());
    }

    #[test]
    fn out_of_range_signal_id_gets_general_reject() {
        let (mut engine, ccb, _timer) = new_engine(48);
        let transport = engine.ccb_mut(ccb).unwrap().transport.unwrap();
        let header = encode_header_byte(3, PacketType::Single, MessageType::Command);
        let events = engine.on_data(ccb, &[header, 0x00]); // signal id 0 is out of range
        assert!(events.is_empty());
        let writes = engine.transport.drain(transport);
        assert_eq!(writes.len(), 1);
        let (label, pt, mt) = decode_header_byte(writes[0][0]);
        assert_eq!(label, 3);
        assert_eq!(pt, PacketType::Single);
        assert_eq!(mt, MessageType::GeneralReject);
    }

    #[test]
    fn set_configuration_with_no_codec_is_bad_service_category() {
        let (mut engine, ccb, _timer) = new_engine(48);
        let transport = engine.ccb_mut(ccb).unwrap().transport.unwrap();
        let scb = engine.alloc_stream(Seid::new(1).unwrap(), MediaType::Audio, EndpointType::Sink).unwrap();
        let _ = scb;

        let mut body = vec![Seid::new(1).unwrap().value() << 2, Seid::new(2).unwrap().value() << 2];
        // no service capability elements at all -> InvalidCapabilities
        let header = encode_header_byte(1, PacketType::Single, MessageType::Command);
        let mut frame = vec![header, SignalId::SetConfiguration.into()];
        frame.append(&mut body);
        let events = engine.on_data(ccb, &frame);
        assert!(events.is_empty());
        let writes = engine.transport.drain(transport);
        assert_eq!(writes.len(), 1);
        let mut reader = ByteReader::new(&writes[0]);
        let (_label, _pt, mt) = decode_header_byte(reader.read_u8().unwrap());
        assert_eq!(mt, MessageType::ResponseReject);
        assert_eq!(reader.read_u8().unwrap(), u8::from(SignalId::SetConfiguration));
        let category = ServiceCategory::from(reader.read_u8().unwrap());
        let _ = category;
        assert_eq!(ErrorCode::from(reader.read_u8().unwrap()), ErrorCode::InvalidCapabilities);
    }

    #[test]
    fn concurrent_commands_second_waits_for_first_response() {
        let (mut engine, ccb, _timer) = new_engine(48);
        let transport = engine.ccb_mut(ccb).unwrap().transport.unwrap();
        engine.send_cmd(ccb, None, &Command::Discover).unwrap();
        engine.send_cmd(ccb, None, &Command::GetCapabilities { acp_seid: Seid::new(1).unwrap() }).unwrap();

        let writes = engine.transport.drain(transport);
        assert_eq!(writes.len(), 1, "second command must wait in the queue");
        let (label_a, _, _) = decode_header_byte(writes[0][0]);

        // A response with the wrong label is dropped and does not unblock B.
        let wrong_label = (label_a + 1) % 16;
        let mut bad = vec![encode_header_byte(wrong_label, PacketType::Single, MessageType::ResponseAccept)];
        bad.push(SignalId::Discover.into());
        let events = engine.on_data(ccb, &bad);
        assert!(events.is_empty());
        assert!(engine.transport.drain(transport).is_empty());

        // The matching response releases the queue.
        let mut good = vec![encode_header_byte(label_a, PacketType::Single, MessageType::ResponseAccept)];
        good.push(SignalId::Discover.into());
        let events = engine.on_data(ccb, &good);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AvdtpEvent::Ccb(_, CcbEvent::DiscoverResponse(_))));

        let writes = engine.transport.drain(transport);
        assert_eq!(writes.len(), 1, "command B now goes out");
    }

    #[test]
    fn malformed_end_drops_reassembly_without_event() {
        let (mut engine, ccb, _timer) = new_engine(23);
        let start = encode_header_byte(0, PacketType::Start, MessageType::Command);
        let body: Vec<u8> = (0..40u8).collect();
        let mut first = vec![start, 3, SignalId::SetConfiguration.into()];
        first.extend_from_slice(&body[..18]);
        assert!(engine.on_data(ccb, &first).is_empty());

        // END fragment whose declared growth would overflow the tiny capacity.
        engine.policy.max_reassembly_size = 20;
        let end = encode_header_byte(0, PacketType::End, MessageType::Command);
        let mut last = vec![end];
        last.extend_from_slice(&body[18..]);
        let events = engine.on_data(ccb, &last);
        assert!(events.is_empty(), "overflowing END must not produce an SCB event");
    }
}
