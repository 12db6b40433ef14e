//! Stack configuration traits.
//!
//! Mirrors the teacher stack's `Config` trait: one trait per engine aggregates the
//! external collaborator types the engine is generic over, so an application wires
//! up concrete transport/timer/crypto implementations once and gets both engines
//! for free.

use crate::crypto::CryptoToolbox;
use crate::time::Timer;
use crate::transport::Transport;

/// Associated types required to run the AVDTP signaling engine.
pub trait AvdtpConfig {
    /// Time source with microsecond resolution, used to schedule and check the
    /// idle/retransmit/response timers on each CCB.
    type Timer: Timer;

    /// The reliable, packetized transport the signaling channel runs over.
    type Transport: Transport;
}

/// Associated types required to run the SMP pairing engine.
pub trait SmpConfig {
    /// Time source with microsecond resolution, used for the delayed-auth tail timer.
    type Timer: Timer;

    /// The transport the SMP fixed channel (LE) or SMP-over-BR channel runs over.
    type Transport: Transport;

    /// The cryptographic toolbox backing ECDH, AES-CMAC, and the SMP key-derivation
    /// functions.
    type Crypto: CryptoToolbox;
}
