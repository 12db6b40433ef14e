//! The SMP Cryptographic Toolbox (Bluetooth Core Spec v5.0, Vol 3, Part H, §2.2).
//!
//! Every function here is a pure transform of fixed-size byte arrays — no state, no
//! I/O. The pairing engine in [`crate::smp`] is the only caller; this module has no
//! opinion about PDUs, wire order, or the state machine driving it.
//!
//! All array arguments are in the big-endian byte order the formulas in the
//! specification are defined over, *except* where individually noted (`ah`, which
//! operates on little-endian address material to match [`crate::device_address`]).

use super::aes_cmac::{aes_cmac, e};

/// Phase 2 (legacy) confirm value function `c1`.
///
/// `pres`/`preq` are the 7-byte Pairing Response/Request command payloads; `ia`/`ra`
/// are the 6-byte initiator/responder addresses; `iat`/`rat` are their address-type
/// bits (`true` = random).
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    pres: &[u8; 7],
    preq: &[u8; 7],
    iat: bool,
    ia: &[u8; 6],
    rat: bool,
    ra: &[u8; 6],
) -> [u8; 16] {
    let p1 = c1_p1(pres, preq, iat, rat);
    let p2 = c1_p2(ia, ra);

    let mut tmp = xor16(r, &p1);
    tmp = e(k, &tmp);
    tmp = xor16(&tmp, &p2);
    e(k, &tmp)
}

fn c1_p1(pres: &[u8; 7], preq: &[u8; 7], iat: bool, rat: bool) -> [u8; 16] {
    let mut p1 = [0u8; 16];
    p1[0..7].copy_from_slice(pres);
    p1[7..14].copy_from_slice(preq);
    p1[14] = rat as u8;
    p1[15] = iat as u8;
    p1
}

fn c1_p2(ia: &[u8; 6], ra: &[u8; 6]) -> [u8; 16] {
    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(ia);
    p2[10..16].copy_from_slice(ra);
    p2
}

/// Phase 2 (legacy) short term key function `s1`.
///
/// Only the low 64 bits of `r1` and `r2` (the last 8 bytes, big-endian) feed the
/// result — this is a quirk of the legacy spec, not an error.
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut m = [0u8; 16];
    m[0..8].copy_from_slice(&r1[8..16]);
    m[8..16].copy_from_slice(&r2[8..16]);
    e(k, &m)
}

/// Secure Connections confirm value function `f4`, used for both the Just
/// Works/Numeric Comparison and Passkey Entry commitment exchanges.
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    let mut m = [0u8; 65];
    m[0..32].copy_from_slice(u);
    m[32..64].copy_from_slice(v);
    m[64] = z;
    aes_cmac(x, &m)
}

/// Secure Connections key derivation function `f5`, producing `(MacKey, LTK)` from
/// the ECDH shared secret `w` and both sides' nonces and addresses.
///
/// `a1`/`a2` are 7 bytes: the device address type (`0x00` public, `0x01` random) in
/// the high byte, followed by the 6-byte address.
pub fn f5(w: &[u8; 32], n1: &[u8; 16], n2: &[u8; 16], a1: &[u8; 7], a2: &[u8; 7]) -> ([u8; 16], [u8; 16]) {
    const SALT: [u8; 16] = [
        0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83,
        0xBE,
    ];
    const KEY_ID: [u8; 4] = [0x62, 0x74, 0x6c, 0x65]; // "btle"
    const LENGTH: [u8; 2] = [0x01, 0x00];

    let t = aes_cmac(&SALT, w);

    let mut m = [0u8; 53];
    m[1..5].copy_from_slice(&KEY_ID);
    m[5..21].copy_from_slice(n1);
    m[21..37].copy_from_slice(n2);
    m[37..44].copy_from_slice(a1);
    m[44..51].copy_from_slice(a2);
    m[51..53].copy_from_slice(&LENGTH);

    m[0] = 0;
    let mac_key = aes_cmac(&t, &m);
    m[0] = 1;
    let ltk = aes_cmac(&t, &m);

    (mac_key, ltk)
}

/// Secure Connections DHKey check function `f6`.
pub fn f6(
    w: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> [u8; 16] {
    let mut m = [0u8; 65];
    m[0..16].copy_from_slice(n1);
    m[16..32].copy_from_slice(n2);
    m[32..48].copy_from_slice(r);
    m[48..51].copy_from_slice(io_cap);
    m[51..58].copy_from_slice(a1);
    m[58..65].copy_from_slice(a2);
    aes_cmac(w, &m)
}

/// Secure Connections numeric comparison function `g2`.
///
/// The return value's low 6 decimal digits (`value % 1_000_000`) are what gets
/// displayed to the user.
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mut m = [0u8; 80];
    m[0..32].copy_from_slice(u);
    m[32..64].copy_from_slice(v);
    m[64..80].copy_from_slice(y);
    let mac = aes_cmac(x, &m);
    u32::from_be_bytes([mac[12], mac[13], mac[14], mac[15]])
}

/// Link-key derivation function `h6`, used to convert an LTK into a BR/EDR link key
/// (or vice versa) when cross-transport key derivation is negotiated.
pub fn h6(w: &[u8; 16], key_id: &[u8; 4]) -> [u8; 16] {
    aes_cmac(w, key_id)
}

/// Link-key derivation function `h7`, the `H7_SUPPORT_BIT` alternative to `h6`.
pub fn h7(salt: &[u8; 16], w: &[u8; 16]) -> [u8; 16] {
    aes_cmac(salt, w)
}

/// 24-bit hash function `ah`, used for resolvable private address generation and
/// resolution. `r` and the return value are in the little-endian byte order
/// addresses are transmitted in (see [`crate::device_address`]).
pub fn ah(k: &[u8; 16], r: [u8; 3]) -> [u8; 3] {
    let mut block = [0u8; 16];
    block[13] = r[2];
    block[14] = r[1];
    block[15] = r[0];

    let cipher_text = e(k, &block);
    [cipher_text[15], cipher_text[14], cipher_text[13]]
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex16(s: &str) -> [u8; 16] {
        hexn(s)
    }
    fn hex32(s: &str) -> [u8; 32] {
        hexn(s)
    }
    fn hex7(s: &str) -> [u8; 7] {
        hexn(s)
    }
    fn hex6(s: &str) -> [u8; 6] {
        hexn(s)
    }
    fn hex3(s: &str) -> [u8; 3] {
        hexn(s)
    }

    fn hexn<const N: usize>(s: &str) -> [u8; N] {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).unwrap();
        }
        out
    }

    // Bluetooth Core Spec v5.0, Vol 3, Part H, §2.2.1, example data.
    #[test]
    fn c1_test_vector() {
        let k = [0u8; 16];
        let r = hex16("5783D52156AD6F0E6388274EC6702EE0");
        let pres = hex7("05000800000302");
        let preq = hex7("07071000000101");
        let ia = hex6("A1A2A3A4A5A6");
        let ra = hex6("B1B2B3B4B5B6");

        assert_eq!(
            c1(&k, &r, &pres, &preq, true, &ia, false, &ra),
            hex16("1e1e3fef878988ead2a74dc5bef13b86")
        );
    }

    #[test]
    fn s1_test_vector() {
        let k = [0u8; 16];
        let r1 = hex16("000F0E0D0C0B0A091122334455667788");
        let r2 = hex16("010203040506070899AABBCCDDEEFF00");

        assert_eq!(s1(&k, &r1, &r2), hex16("9a1fe1f0e8b0f49b5b4216ae796da062"));
    }

    // Bluetooth Core Spec v5.0, Vol 3, Part H, Appendix D.2.
    #[test]
    fn f4_test_vector() {
        let u = hex32("20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6");
        let v = hex32("55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd");
        let x = hex16("d5cb8454d177733effffb2ec712baeab");
        assert_eq!(f4(&u, &v, &x, 0), hex16("f2c916f107a9bd1cf1eda1bea974872d"));
    }

    // Bluetooth Core Spec v5.0, Vol 3, Part H, Appendix D.3.
    #[test]
    fn f5_test_vector() {
        let w = hex32("ec0234a357c8ad05341010a60a397d9b99796b13b4f866f1868d34f373bfa698");
        let n1 = hex16("d5cb8454d177733effffb2ec712baeab");
        let n2 = hex16("a6e8e7cc25a75f6e216583f7ff3dc4cf");
        let a1 = hex7("00561237 37bfce");
        let a2 = hex7("00a71370 2dcfc1");

        let (mac_key, ltk) = f5(&w, &n1, &n2, &a1, &a2);
        assert_eq!(mac_key, hex16("2965f176a1084a02fd3f6a20ce636e20"));
        assert_eq!(ltk, hex16("6986791169d7cd23980522b594750a38"));
    }

    #[test]
    fn f6_test_vector() {
        let n1 = hex16("d5cb8454d177733effffb2ec712baeab");
        let n2 = hex16("a6e8e7cc25a75f6e216583f7ff3dc4cf");
        let mac_key = hex16("2965f176a1084a02fd3f6a20ce636e20");
        let r = hex16("12a3343bb453bb5408da42d20c2d0fc8");
        let io_cap = hex3("010102");
        let a1 = hex7("0056123737bfce");
        let a2 = hex7("00a713702dcfc1");

        assert_eq!(
            f6(&mac_key, &n1, &n2, &r, &io_cap, &a1, &a2),
            hex16("e3c473989cd0e8c5d26c0b09da958f61")
        );
    }

    #[test]
    fn g2_test_vector() {
        let u = hex32("20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6");
        let v = hex32("55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd");
        let x = hex16("d5cb8454d177733effffb2ec712baeab");
        let y = hex16("a6e8e7cc25a75f6e216583f7ff3dc4cf");

        assert_eq!(g2(&u, &v, &x, &y), 0x2f9ed5ba);
    }

    // h6/h7 have no published Bluetooth-spec test vectors to hand; exercise the
    // algebraic properties the spec does guarantee instead of magic constants.
    #[test]
    fn h6_is_deterministic_and_key_dependent() {
        let w = [0x11u8; 16];
        let key_id = *b"lebt";
        assert_eq!(h6(&w, &key_id), h6(&w, &key_id));
        assert_ne!(h6(&w, &key_id), h6(&[0x22; 16], &key_id));
        assert_ne!(h6(&w, &key_id), h6(&w, b"ecbt"));
    }

    #[test]
    fn h7_is_deterministic_and_salt_dependent() {
        let salt = [0x01u8; 16];
        let w = [0x02u8; 16];
        assert_eq!(h7(&salt, &w), h7(&salt, &w));
        assert_ne!(h7(&salt, &w), h7(&[0x03; 16], &w));
    }

    #[test]
    fn ah_produces_distinct_hashes_for_distinct_prand() {
        let k = [0x9bu8; 16];
        let h1 = ah(&k, [0x01, 0x02, 0x03]);
        let h2 = ah(&k, [0x04, 0x05, 0x06]);
        assert_ne!(h1, h2);
        assert_eq!(ah(&k, [0x01, 0x02, 0x03]), h1);
    }
}
