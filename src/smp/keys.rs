//! Key distribution walk (Vol 3 Part H Section 3.6).
//!
//! After encryption starts, each side distributes the key types it is responsible for,
//! in strictly ascending order. The walk is expressed here as plain mask arithmetic;
//! [`super::Pairing`] drives it by calling [`next_key_to_send`] and [`DistributedKey::clear_bit`]
//! once the corresponding PDU has gone out (or been received, for the peer's walk).

use crate::smp::codec::KeyDistribution;

/// One step of the key-distribution walk, in the fixed order the core spec mandates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DistributedKey {
    Encryption,
    Identity,
    Signing,
    LinkKey,
}

impl DistributedKey {
    const ORDER: [(DistributedKey, KeyDistribution); 4] = [
        (DistributedKey::Encryption, KeyDistribution::ENC_KEY),
        (DistributedKey::Identity, KeyDistribution::ID_KEY),
        (DistributedKey::Signing, KeyDistribution::SIGN_KEY),
        (DistributedKey::LinkKey, KeyDistribution::LINK_KEY),
    ];

    pub fn bit(self) -> KeyDistribution {
        Self::ORDER.iter().find(|(k, _)| *k == self).unwrap().1
    }
}

/// Returns the next key type to distribute from `mask`, in ascending bit order, or `None`
/// once the mask is empty.
pub fn next_key_to_send(mask: KeyDistribution) -> Option<DistributedKey> {
    DistributedKey::ORDER
        .iter()
        .find(|(_, bit)| mask.contains(*bit))
        .map(|(key, _)| *key)
}

/// Clears SC-mode-only bits (ENC, LK are derived locally under Secure Connections, never
/// transmitted) from both local masks before the walk begins.
///
/// Per the key-distribution invariant, `local_i_key`/`local_r_key` must never carry a bit
/// for a key that is locally derived rather than exchanged.
pub fn strip_sc_derived_bits(mask: KeyDistribution) -> KeyDistribution {
    mask - KeyDistribution::ENC_KEY - KeyDistribution::LINK_KEY
}

/// Clears the link-key bit unless SC is in use and policy allows derivation.
///
/// Whether *both* sides asked for it is already folded into `local_mask`: the masks
/// are intersected with the peer's requested key types at negotiation time
/// (`Pairing::on_pairing_request`/`on_pairing_response`), so a `LINK_KEY` bit still
/// set here already means both ends requested it.
pub fn gate_link_key(
    local_mask: KeyDistribution,
    sc_in_use: bool,
    lk_derivation_allowed: bool,
) -> KeyDistribution {
    if sc_in_use && lk_derivation_allowed {
        local_mask
    } else {
        local_mask - KeyDistribution::LINK_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_is_ascending() {
        let mask = KeyDistribution::LINK_KEY | KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY;
        assert_eq!(next_key_to_send(mask), Some(DistributedKey::Encryption));
        let mask = mask - DistributedKey::Encryption.bit();
        assert_eq!(next_key_to_send(mask), Some(DistributedKey::Signing));
        let mask = mask - DistributedKey::Signing.bit();
        assert_eq!(next_key_to_send(mask), Some(DistributedKey::LinkKey));
        let mask = mask - DistributedKey::LinkKey.bit();
        assert_eq!(next_key_to_send(mask), None);
    }

    #[test]
    fn link_key_gated_by_sc_and_policy() {
        let mask = KeyDistribution::LINK_KEY;
        assert_eq!(gate_link_key(mask, true, true), KeyDistribution::LINK_KEY);
        assert_eq!(gate_link_key(mask, false, true), KeyDistribution::empty());
        assert_eq!(gate_link_key(mask, true, false), KeyDistribution::empty());
    }

    #[test]
    fn sc_derived_bits_are_stripped() {
        let mask = KeyDistribution::all();
        let stripped = strip_sc_derived_bits(mask);
        assert!(!stripped.contains(KeyDistribution::ENC_KEY));
        assert!(!stripped.contains(KeyDistribution::LINK_KEY));
        assert!(stripped.contains(KeyDistribution::ID_KEY));
        assert!(stripped.contains(KeyDistribution::SIGN_KEY));
    }
}
