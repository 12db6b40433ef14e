//! P-256 ECDH provider backed by *ring*.
//!
//! *ring* does not support `#![no_std]`, so this provider is only useful for hosted
//! builds (tests, and the host-side engines in this crate, which always run on an OS).

use super::{EcdhProvider, InvalidPublicKey, PublicKey, SecretKey, SharedSecret};
use rand_core::{CryptoRng, RngCore};
use ring::agreement;

/// An [`EcdhProvider`] backed by *ring*'s P-256 implementation.
pub struct RingProvider;

/// Secret key type used by [`RingProvider`].
pub struct RingSecretKey(agreement::EphemeralPrivateKey);

impl EcdhProvider for RingProvider {
    type SecretKey = RingSecretKey;

    fn generate_keypair<R>(&mut self, _rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng,
    {
        // ring manages its own CSPRNG (backed by the OS); the caller-supplied `rng` is
        // unused here, unlike the `P256Provider`, which has no OS RNG of its own to fall
        // back on.
        let rng = ring::rand::SystemRandom::new();
        let private = agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
            .expect("ring key generation failed");
        let public = private
            .compute_public_key()
            .expect("ring public key computation failed");

        let mut bytes = [0u8; 64];
        // `public.as_ref()` is the SEC1 uncompressed point: 0x04 || X || Y.
        bytes.copy_from_slice(&public.as_ref()[1..]);
        (RingSecretKey(private), PublicKey(bytes))
    }
}

impl SecretKey for RingSecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let mut peer_bytes = [0u8; 65];
        peer_bytes[0] = 0x04;
        peer_bytes[1..].copy_from_slice(&foreign_key.0);
        let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, &peer_bytes[..]);

        agreement::agree_ephemeral(self.0, &peer, ring::error::Unspecified, |shared| {
            let mut out = [0u8; 32];
            out.copy_from_slice(shared);
            Ok(out)
        })
        .map(SharedSecret)
        .map_err(|_| InvalidPublicKey::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conformance_suite() {
        super::super::run_tests(RingProvider);
    }
}
