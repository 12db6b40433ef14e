//! AES-128 block encryption and AES-CMAC, the two primitives the Cryptographic
//! Toolbox functions (see [`super::toolbox`]) are all built from.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, NewBlockCipher};
use aes::Aes128;
use cmac::{Cmac, Mac, NewMac};

/// Security function `e`: AES-128 encryption of a single 16-byte block.
///
/// `key` and `plain_text` are both big-endian, as used throughout the
/// Cryptographic Toolbox formulas in Bluetooth Core Spec Vol 3 Part H §2.2.
pub fn e(key: &[u8; 16], plain_text: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(plain_text);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-CMAC per RFC 4493, using `key` as the AES-128 key and authenticating `msg`.
pub fn aes_cmac(key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key).expect("AES-128 key is always 16 bytes");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // RFC 4493 test vectors.
    #[test]
    fn rfc4493_subkeys_and_mac() {
        let k: [u8; 16] = hex("2b7e1516 28aed2a6 abf71588 09cf4f3c")
            .try_into()
            .unwrap();

        let zero = [0u8; 16];
        assert_eq!(
            e(&k, &zero)[..],
            hex("7df76b0c 1ab899b3 3e42f047 b91b546f")[..]
        );

        let m = hex(
            "6bc1bee2 2e409f96 e93d7e11 7393172a
             ae2d8a57 1e03ac9c 9eb76fac 45af8e51
             30c81c46 a35ce411 e5fbc119 1a0a52ef
             f69f2445 df4f9b17 ad2b417b e66c3710",
        );

        assert_eq!(
            aes_cmac(&k, &m[..0])[..],
            hex("bb1d6929 e9593728 7fa37d12 9b756746")[..]
        );
        assert_eq!(
            aes_cmac(&k, &m[..16])[..],
            hex("070a16b4 6b4d4144 f79bdd9d d04a287c")[..]
        );
        assert_eq!(
            aes_cmac(&k, &m[..40])[..],
            hex("dfa66747 de9ae630 30ca3261 1497c827")[..]
        );
        assert_eq!(
            aes_cmac(&k, &m[..])[..],
            hex("51f0bebf 7e3b9d92 fc497417 79363cfe")[..]
        );
    }
}
