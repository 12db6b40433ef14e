//! Cryptographic primitives consumed by the SMP pairing engine.
//!
//! Per the narrow-interface design, the pairing state machine never reaches for
//! these functions' implementations directly — it goes through the [`CryptoToolbox`]
//! trait, so a host can swap in a hardware-backed implementation (a secure element,
//! an HCI-driven controller that performs AES-CMAC/ECDH itself) without touching the
//! state machine.
//!
//! [`SoftwareToolbox`] is the default, software-only implementation, built from
//! [`ecdh`]'s P-256 providers and [`toolbox`]'s Cryptographic Toolbox functions.

pub mod aes_cmac;
pub mod ecdh;
pub mod toolbox;

use self::ecdh::{EcdhProvider, InvalidPublicKey, P256Provider, PublicKey, SecretKey, SharedSecret};
use rand_core::{CryptoRng, RngCore};

/// The set of cryptographic operations the SMP engine needs from its environment.
///
/// An implementation is handed a CSPRNG once per call and must not cache entropy
/// across calls; sourcing it is the caller's responsibility (typically HCI LE-Rand
/// or an OS CSPRNG).
pub trait CryptoToolbox {
    /// Generates a fresh P-256 ECDH key pair for a Secure Connections pairing.
    fn generate_keypair<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> (EcdhSecret, PublicKey);

    /// Performs ECDH key agreement, validating that `peer_public` lies on the curve
    /// and is not equal to the point at infinity.
    fn ecdh(&self, secret: EcdhSecret, peer_public: &PublicKey) -> Result<SharedSecret, InvalidPublicKey>;

    /// Legacy pairing confirm value function `c1`.
    fn c1(
        &self,
        k: &[u8; 16],
        r: &[u8; 16],
        pres: &[u8; 7],
        preq: &[u8; 7],
        iat: bool,
        ia: &[u8; 6],
        rat: bool,
        ra: &[u8; 6],
    ) -> [u8; 16] {
        toolbox::c1(k, r, pres, preq, iat, ia, rat, ra)
    }

    /// Legacy pairing short term key function `s1`.
    fn s1(&self, k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
        toolbox::s1(k, r1, r2)
    }

    /// Secure Connections commitment function `f4`.
    fn f4(&self, u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
        toolbox::f4(u, v, x, z)
    }

    /// Secure Connections key derivation function `f5`.
    fn f5(
        &self,
        w: &[u8; 32],
        n1: &[u8; 16],
        n2: &[u8; 16],
        a1: &[u8; 7],
        a2: &[u8; 7],
    ) -> ([u8; 16], [u8; 16]) {
        toolbox::f5(w, n1, n2, a1, a2)
    }

    /// Secure Connections DHKey check function `f6`.
    fn f6(
        &self,
        w: &[u8; 16],
        n1: &[u8; 16],
        n2: &[u8; 16],
        r: &[u8; 16],
        io_cap: &[u8; 3],
        a1: &[u8; 7],
        a2: &[u8; 7],
    ) -> [u8; 16] {
        toolbox::f6(w, n1, n2, r, io_cap, a1, a2)
    }

    /// Secure Connections numeric comparison function `g2`.
    fn g2(&self, u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
        toolbox::g2(u, v, x, y)
    }

    /// Cross-transport link-key derivation function `h6`.
    fn h6(&self, w: &[u8; 16], key_id: &[u8; 4]) -> [u8; 16] {
        toolbox::h6(w, key_id)
    }

    /// Cross-transport link-key derivation function `h7`.
    fn h7(&self, salt: &[u8; 16], w: &[u8; 16]) -> [u8; 16] {
        toolbox::h7(salt, w)
    }
}

/// Type-erased secret key handed back by [`CryptoToolbox::generate_keypair`] and
/// consumed by [`CryptoToolbox::ecdh`].
///
/// The pairing engine holds exactly one of these per in-progress pairing and never
/// inspects it, so a single concrete type suffices even though [`EcdhProvider`] is
/// generic over the secret-key type.
pub struct EcdhSecret(<P256Provider as EcdhProvider>::SecretKey);

/// The default, software-only [`CryptoToolbox`]: pure-Rust P-256 via [`P256Provider`]
/// plus the toolbox functions in [`toolbox`].
#[derive(Default)]
pub struct SoftwareToolbox {
    provider: P256Provider,
}

impl CryptoToolbox for SoftwareToolbox {
    fn generate_keypair<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> (EcdhSecret, PublicKey) {
        let (secret, public) = self.provider.generate_keypair(rng);
        (EcdhSecret(secret), public)
    }

    fn ecdh(&self, secret: EcdhSecret, peer_public: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        secret.0.agree(peer_public)
    }
}
