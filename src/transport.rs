//! The packetized channel transport consumed by both engines.
//!
//! Real L2CAP-like behavior (reliability, ordering, per-channel MTU negotiation,
//! congestion back-pressure) lives entirely outside this crate; this module only
//! defines the narrow interface the engines need from it, mirroring the teacher
//! stack's `l2cap::Channel` / PSM model but pushed out to a trait boundary instead
//! of being implemented in-crate.

use crate::device_address::DeviceAddress;
use crate::Error;

/// Protocol/Service Multiplexer values relevant to this crate's two engines.
///
/// These select which upper-layer protocol a transport channel is opened for; the
/// transport implementation is responsible for mapping a PSM to whatever channel
/// identifier or connection type its underlying link layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Psm {
    /// AVDTP signaling channel (connection-oriented, PSM 0x0019).
    AvdtpSignaling,
    /// AVDTP browsing channel (connection-oriented, PSM 0x001B).
    AvdtpBrowsing,
    /// SMP over the fixed LE Security Manager channel (CID 0x0006).
    Smp,
    /// SMP over BR/EDR, used only for cross-transport key derivation (CID 0x0007).
    SmpBr,
}

/// Opaque handle to an open transport channel.
///
/// Handles are assigned by the transport implementation and are opaque to the
/// engines; they are only ever round-tripped back through [`Transport`] methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u32);

/// The transport abstraction consumed by the AVDTP and SMP engines.
///
/// Everything here is a "downward" call the engine makes into the transport. The
/// matching "upward" events (connect confirm/indicate, inbound data, congestion,
/// disconnect) are not modeled as callbacks on this trait: per the cooperative
/// single-threaded event loop, the host calls the corresponding `on_*` method on
/// the engine directly when its transport layer reports the event, rather than the
/// transport re-entering the engine on its own.
pub trait Transport {
    /// Opens a channel to `peer` for the given PSM, returning a handle usable with
    /// the other methods. The connection result arrives asynchronously; the engine
    /// expects a later call to its `on_connect_cfm`/`on_connect_ind`.
    fn open(&mut self, peer: DeviceAddress, psm: Psm) -> Result<TransportHandle, Error>;

    /// Writes `bytes` to the channel identified by `handle`.
    ///
    /// The transport is expected to preserve order and deliver the write reliably,
    /// or report `on_disconnect`/`on_congested` if it cannot.
    fn write(&mut self, handle: TransportHandle, bytes: &[u8]) -> Result<(), Error>;

    /// Returns the current negotiated MTU of the channel.
    fn mtu(&self, handle: TransportHandle) -> u16;

    /// Closes the channel. No further events for `handle` are delivered afterwards.
    fn close(&mut self, handle: TransportHandle);
}
