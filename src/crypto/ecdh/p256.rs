//! Pure-Rust P-256 ECDH provider backed by the [`p256`] crate.

use super::{EcdhProvider, InvalidPublicKey, PublicKey, SecretKey, SharedSecret};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};

/// An [`EcdhProvider`] backed by the pure-Rust, `no_std`-compatible [`p256`] crate.
///
/// This is always available and does not require an OS allocator or CSPRNG beyond
/// whatever `rand_core::CryptoRng` the caller supplies.
#[derive(Default)]
pub struct P256Provider;

/// Secret key type used by [`P256Provider`].
pub struct P256SecretKey(Scalar);

impl EcdhProvider for P256Provider {
    type SecretKey = P256SecretKey;

    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng,
    {
        // Reject the vanishingly unlikely zero scalar; any other 256-bit value from a
        // CSPRNG is a valid private scalar for P-256.
        let scalar = loop {
            let mut buf = [0u8; 32];
            rng.fill_bytes(&mut buf);
            if let Some(scalar) = Scalar::from_bytes_reduced_checked(&buf) {
                break scalar;
            }
        };

        let point = (ProjectivePoint::generator() * scalar).to_affine();
        (P256SecretKey(scalar), affine_to_public_key(&point))
    }
}

impl SecretKey for P256SecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let point = public_key_to_affine(foreign_key).ok_or_else(InvalidPublicKey::new)?;
        let shared = (ProjectivePoint::from(point) * self.0).to_affine();
        if bool::from(shared.is_identity()) {
            return Err(InvalidPublicKey::new());
        }

        let encoded = shared.to_encoded_point(false);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(encoded.x().ok_or_else(InvalidPublicKey::new)?);
        Ok(SharedSecret(secret))
    }
}

fn affine_to_public_key(point: &AffinePoint) -> PublicKey {
    let encoded = point.to_encoded_point(false);
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(encoded.x().expect("generator point has coordinates"));
    bytes[32..].copy_from_slice(encoded.y().expect("generator point has coordinates"));
    PublicKey(bytes)
}

fn public_key_to_affine(key: &PublicKey) -> Option<AffinePoint> {
    let encoded = EncodedPoint::from_affine_coordinates(
        (&key.0[..32]).into(),
        (&key.0[32..]).into(),
        false,
    );
    let point = AffinePoint::from_encoded_point(&encoded);
    if bool::from(point.is_some()) && !bool::from(point.unwrap().is_identity()) {
        Some(point.unwrap())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conformance_suite() {
        super::super::run_tests(P256Provider);
    }
}
