//! AVDTP signaling and SMP pairing, as host-side protocol engines.
//!
//! This crate implements the two hardest, most protocol-dense subsystems of a
//! Bluetooth host stack: the AVDTP signaling channel (fragmentation/reassembly,
//! wire codec, per-stream dispatch, retransmission) in [`avdtp`], and the LE
//! Security Manager pairing state machine (association-model selection, legacy
//! and Secure Connections key agreement, key distribution) in [`smp`].
//!
//! Everything this crate needs from the outside world — the packetized
//! transport, a timer source, and the cryptographic toolbox — is expressed as a
//! trait in [`transport`], [`time`], and [`crypto`] respectively, and tied
//! together per engine by [`config`]. Neither engine owns a thread or an event
//! loop: a host drives them by calling `on_data`/`on_connect_cfm`/`poll`/etc.
//! from its own single-threaded event loop and feeding back the results.
//!
//! [`Timer`]: time::Timer

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod avdtp;
pub mod bytes;
pub mod config;
pub mod crypto;
pub mod device_address;
mod error;
pub mod smp;
pub mod time;
pub mod transport;

pub use self::error::Error;
