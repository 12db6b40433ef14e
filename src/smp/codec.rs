//! SMP wire codec: the PDU set exchanged on the fixed Security Manager channel.
//!
//! Every SMP PDU starts with a single-byte opcode (`Code`) followed by a body whose
//! length is fully determined by the opcode; there is no separate length field. A
//! body that doesn't match its opcode's fixed length is a [`crate::Error::InvalidValue`]
//! at the reader level, which the pairing engine maps to `INVALID_PARAMETERS` (or, for
//! a truncated Pairing-Failed body, drops silently instead of replying).

use crate::bytes::*;
use crate::Error;
use std::fmt;

enum_with_unknown! {
    /// SMP PDU opcodes ("Code" field, Vol 3 Part H Section 3.3).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Code(u8) {
        PairingRequest = 0x01,
        PairingResponse = 0x02,
        PairingConfirm = 0x03,
        PairingRandom = 0x04,
        PairingFailed = 0x05,
        EncryptionInformation = 0x06,
        MasterIdentification = 0x07,
        IdentityInformation = 0x08,
        IdentityAddressInformation = 0x09,
        SigningInformation = 0x0A,
        SecurityRequest = 0x0B,
        PairingPublicKey = 0x0C,
        PairingDhKeyCheck = 0x0D,
        PairingKeypressNotification = 0x0E,
    }
}

enum_with_unknown! {
    /// IO Capability values exchanged in Pairing Request/Response (Vol 3 Part H Section 2.3.3).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum IoCapability(u8) {
        DisplayOnly = 0x00,
        DisplayYesNo = 0x01,
        KeyboardOnly = 0x02,
        NoInputNoOutput = 0x03,
        KeyboardDisplay = 0x04,
    }
}

enum_with_unknown! {
    /// OOB data present flag (Vol 3 Part H Section 3.5.1).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum OobDataFlag(u8) {
        NotPresent = 0x00,
        Present = 0x01,
    }
}

/// Pairing reason codes carried in a Pairing-Failed PDU (Vol 3 Part H Section 3.5.5).
///
/// Values 13 (`BR/EDR Pairing In Progress`) and 15-255 are reserved or undefined by the
/// core spec but still round-trip through [`PairingFailedReason::Unknown`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PairingFailedReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    CrossTransportKeyDerivationNotAllowed,
    Unknown(u8),
}

impl PairingFailedReason {
    pub fn to_raw(&self) -> u8 {
        match *self {
            PairingFailedReason::PasskeyEntryFailed => 0x01,
            PairingFailedReason::OobNotAvailable => 0x02,
            PairingFailedReason::AuthenticationRequirements => 0x03,
            PairingFailedReason::ConfirmValueFailed => 0x04,
            PairingFailedReason::PairingNotSupported => 0x05,
            PairingFailedReason::EncryptionKeySize => 0x06,
            PairingFailedReason::CommandNotSupported => 0x07,
            PairingFailedReason::UnspecifiedReason => 0x08,
            PairingFailedReason::RepeatedAttempts => 0x09,
            PairingFailedReason::InvalidParameters => 0x0A,
            PairingFailedReason::DhKeyCheckFailed => 0x0B,
            PairingFailedReason::NumericComparisonFailed => 0x0C,
            PairingFailedReason::CrossTransportKeyDerivationNotAllowed => 0x0E,
            PairingFailedReason::Unknown(raw) => raw,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => PairingFailedReason::PasskeyEntryFailed,
            0x02 => PairingFailedReason::OobNotAvailable,
            0x03 => PairingFailedReason::AuthenticationRequirements,
            0x04 => PairingFailedReason::ConfirmValueFailed,
            0x05 => PairingFailedReason::PairingNotSupported,
            0x06 => PairingFailedReason::EncryptionKeySize,
            0x07 => PairingFailedReason::CommandNotSupported,
            0x08 => PairingFailedReason::UnspecifiedReason,
            0x09 => PairingFailedReason::RepeatedAttempts,
            0x0A => PairingFailedReason::InvalidParameters,
            0x0B => PairingFailedReason::DhKeyCheckFailed,
            0x0C => PairingFailedReason::NumericComparisonFailed,
            0x0E => PairingFailedReason::CrossTransportKeyDerivationNotAllowed,
            other => PairingFailedReason::Unknown(other),
        }
    }
}

/// The `AuthReq` bit field carried in Pairing Request/Response (Vol 3 Part H Section 3.5.1).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AuthReq(u8);

impl AuthReq {
    const BONDING_MASK: u8 = 0b0000_0001;
    const MITM: u8 = 0b0000_0100;
    const SC: u8 = 0b0000_1000;
    const KEYPRESS: u8 = 0b0001_0000;
    const CT2: u8 = 0b0010_0000;

    pub fn new(bonding: bool, mitm: bool, sc: bool, keypress: bool, ct2: bool) -> Self {
        let mut raw = 0u8;
        if bonding {
            raw |= Self::BONDING_MASK;
        }
        if mitm {
            raw |= Self::MITM;
        }
        if sc {
            raw |= Self::SC;
        }
        if keypress {
            raw |= Self::KEYPRESS;
        }
        if ct2 {
            raw |= Self::CT2;
        }
        AuthReq(raw)
    }

    pub fn from_raw(raw: u8) -> Self {
        AuthReq(raw)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// Whether bonding (as opposed to a one-off pairing) was requested.
    pub fn bonding(&self) -> bool {
        self.0 & Self::BONDING_MASK != 0
    }

    /// MITM protection requested (drives the association model selection).
    pub fn mitm(&self) -> bool {
        self.0 & Self::MITM != 0
    }

    /// Secure Connections pairing requested.
    pub fn secure_connections(&self) -> bool {
        self.0 & Self::SC != 0
    }

    pub fn keypress_notifications(&self) -> bool {
        self.0 & Self::KEYPRESS != 0
    }

    /// `h7`-based cross-transport key derivation supported (falls back to `h6` if not).
    pub fn ct2(&self) -> bool {
        self.0 & Self::CT2 != 0
    }
}

impl fmt::Debug for AuthReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthReq")
            .field("bonding", &self.bonding())
            .field("mitm", &self.mitm())
            .field("secure_connections", &self.secure_connections())
            .field("keypress_notifications", &self.keypress_notifications())
            .field("ct2", &self.ct2())
            .finish()
    }
}

bitflags::bitflags! {
    /// Which keys a side will distribute after authentication (Vol 3 Part H Section 3.6.1).
    ///
    /// Bit names follow the core spec's Initiator/Responder Key Distribution fields.
    pub struct KeyDistribution: u8 {
        /// Long Term Key (`EncKey`).
        const ENC_KEY = 0b0001;
        /// Identity Resolving Key + identity address (`IdKey`).
        const ID_KEY = 0b0010;
        /// Connection Signature Resolving Key (`SignKey`).
        const SIGN_KEY = 0b0100;
        /// BR/EDR Link Key derived via `h6`/`h7` (`LinkKey`).
        const LINK_KEY = 0b1000;
    }
}

/// Pairing Request / Pairing Response body (identical layout, Vol 3 Part H Section 3.5.1/3.5.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: IoCapability,
    pub oob_data_flag: OobDataFlag,
    pub auth_req: AuthReq,
    pub max_encryption_key_size: u8,
    pub initiator_key_distribution: KeyDistribution,
    pub responder_key_distribution: KeyDistribution,
}

impl PairingFeatures {
    const LEN: usize = 6;

    fn read(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let io_capability = IoCapability::from(bytes.read_u8()?);
        let oob_data_flag = OobDataFlag::from(bytes.read_u8()?);
        let auth_req = AuthReq::from_raw(bytes.read_u8()?);
        let max_encryption_key_size = bytes.read_u8()?;
        let initiator_key_distribution = KeyDistribution::from_bits_truncate(bytes.read_u8()?);
        let responder_key_distribution = KeyDistribution::from_bits_truncate(bytes.read_u8()?);
        Ok(PairingFeatures {
            io_capability,
            oob_data_flag,
            auth_req,
            max_encryption_key_size,
            initiator_key_distribution,
            responder_key_distribution,
        })
    }

    fn write(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.io_capability.into())?;
        writer.write_u8(self.oob_data_flag.into())?;
        writer.write_u8(self.auth_req.to_raw())?;
        writer.write_u8(self.max_encryption_key_size)?;
        writer.write_u8(self.initiator_key_distribution.bits())?;
        writer.write_u8(self.responder_key_distribution.bits())?;
        Ok(())
    }
}

/// A fully decoded SMP command.
///
/// `Unknown` only captures opcodes the core spec hasn't assigned; every opcode this
/// module names above is fully decoded, unlike the partial codec this was generalized
/// from.
#[derive(Debug, Clone)]
pub enum Command<'a> {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm { confirm_value: [u8; 16] },
    PairingRandom { random_value: [u8; 16] },
    PairingFailed { reason: PairingFailedReason },
    EncryptionInformation { long_term_key: [u8; 16] },
    MasterIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation { identity_resolving_key: [u8; 16] },
    IdentityAddressInformation { address_is_random: bool, address: [u8; 6] },
    SigningInformation { signature_key: [u8; 16] },
    SecurityRequest { auth_req: AuthReq },
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck { check_value: [u8; 16] },
    PairingKeypressNotification { notification_type: u8 },
    Unknown { code: u8, data: &'a [u8] },
}

impl<'a> Command<'a> {
    /// Length of the body following the opcode byte, if fixed by the opcode.
    fn expected_body_len(code: Code) -> Option<usize> {
        Some(match code {
            Code::PairingRequest | Code::PairingResponse => PairingFeatures::LEN,
            Code::PairingConfirm | Code::PairingRandom => 16,
            Code::PairingFailed => 1,
            Code::EncryptionInformation => 16,
            Code::MasterIdentification => 2 + 8,
            Code::IdentityInformation => 16,
            Code::IdentityAddressInformation => 1 + 6,
            Code::SigningInformation => 16,
            Code::SecurityRequest => 1,
            Code::PairingPublicKey => 32 + 32,
            Code::PairingDhKeyCheck => 16,
            Code::PairingKeypressNotification => 1,
            Code::Unknown(_) => return None,
        })
    }
}

impl<'a> FromBytes<'a> for Command<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw_code = bytes.read_u8()?;
        let code = Code::from(raw_code);

        if let Code::Unknown(_) = code {
            return Ok(Command::Unknown {
                code: raw_code,
                data: bytes.read_rest(),
            });
        }

        // A Pairing-Failed PDU with a body shorter than 1 octet still has to be handled
        // (the sender may have truncated it); the caller maps this to `INVALID_PARAMETERS`
        // and sends no reply rather than propagating the underlying `Eof`.
        if let Some(expected) = Self::expected_body_len(code) {
            if bytes.bytes_left() != expected {
                return Err(Error::InvalidLength);
            }
        }

        Ok(match code {
            Code::PairingRequest => Command::PairingRequest(PairingFeatures::read(bytes)?),
            Code::PairingResponse => Command::PairingResponse(PairingFeatures::read(bytes)?),
            Code::PairingConfirm => Command::PairingConfirm {
                confirm_value: bytes.read_array()?,
            },
            Code::PairingRandom => Command::PairingRandom {
                random_value: bytes.read_array()?,
            },
            Code::PairingFailed => Command::PairingFailed {
                reason: PairingFailedReason::from_raw(bytes.read_u8()?),
            },
            Code::EncryptionInformation => Command::EncryptionInformation {
                long_term_key: bytes.read_array()?,
            },
            Code::MasterIdentification => Command::MasterIdentification {
                ediv: bytes.read_u16_le()?,
                rand: bytes.read_array()?,
            },
            Code::IdentityInformation => Command::IdentityInformation {
                identity_resolving_key: bytes.read_array()?,
            },
            Code::IdentityAddressInformation => {
                let addr_type = bytes.read_u8()?;
                Command::IdentityAddressInformation {
                    address_is_random: addr_type != 0,
                    address: bytes.read_array()?,
                }
            }
            Code::SigningInformation => Command::SigningInformation {
                signature_key: bytes.read_array()?,
            },
            Code::SecurityRequest => Command::SecurityRequest {
                auth_req: AuthReq::from_raw(bytes.read_u8()?),
            },
            Code::PairingPublicKey => Command::PairingPublicKey {
                x: bytes.read_array()?,
                y: bytes.read_array()?,
            },
            Code::PairingDhKeyCheck => Command::PairingDhKeyCheck {
                check_value: bytes.read_array()?,
            },
            Code::PairingKeypressNotification => Command::PairingKeypressNotification {
                notification_type: bytes.read_u8()?,
            },
            Code::Unknown(_) => unreachable!("handled above"),
        })
    }
}

impl<'a> ToBytes for Command<'a> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Command::PairingRequest(features) => {
                writer.write_u8(Code::PairingRequest.into())?;
                features.write(writer)
            }
            Command::PairingResponse(features) => {
                writer.write_u8(Code::PairingResponse.into())?;
                features.write(writer)
            }
            Command::PairingConfirm { confirm_value } => {
                writer.write_u8(Code::PairingConfirm.into())?;
                writer.write_slice(confirm_value)
            }
            Command::PairingRandom { random_value } => {
                writer.write_u8(Code::PairingRandom.into())?;
                writer.write_slice(random_value)
            }
            Command::PairingFailed { reason } => {
                writer.write_u8(Code::PairingFailed.into())?;
                writer.write_u8(reason.to_raw())
            }
            Command::EncryptionInformation { long_term_key } => {
                writer.write_u8(Code::EncryptionInformation.into())?;
                writer.write_slice(long_term_key)
            }
            Command::MasterIdentification { ediv, rand } => {
                writer.write_u8(Code::MasterIdentification.into())?;
                writer.write_u16_le(*ediv)?;
                writer.write_slice(rand)
            }
            Command::IdentityInformation {
                identity_resolving_key,
            } => {
                writer.write_u8(Code::IdentityInformation.into())?;
                writer.write_slice(identity_resolving_key)
            }
            Command::IdentityAddressInformation {
                address_is_random,
                address,
            } => {
                writer.write_u8(Code::IdentityAddressInformation.into())?;
                writer.write_u8(if *address_is_random { 1 } else { 0 })?;
                writer.write_slice(address)
            }
            Command::SigningInformation { signature_key } => {
                writer.write_u8(Code::SigningInformation.into())?;
                writer.write_slice(signature_key)
            }
            Command::SecurityRequest { auth_req } => {
                writer.write_u8(Code::SecurityRequest.into())?;
                writer.write_u8(auth_req.to_raw())
            }
            Command::PairingPublicKey { x, y } => {
                writer.write_u8(Code::PairingPublicKey.into())?;
                writer.write_slice(x)?;
                writer.write_slice(y)
            }
            Command::PairingDhKeyCheck { check_value } => {
                writer.write_u8(Code::PairingDhKeyCheck.into())?;
                writer.write_slice(check_value)
            }
            Command::PairingKeypressNotification { notification_type } => {
                writer.write_u8(Code::PairingKeypressNotification.into())?;
                writer.write_u8(*notification_type)
            }
            Command::Unknown { code, data } => {
                writer.write_u8(*code)?;
                writer.write_slice(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: &Command<'_>) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let len = {
            let mut writer = ByteWriter::new(&mut buf);
            let before = writer.space_left();
            cmd.to_bytes(&mut writer).unwrap();
            before - writer.space_left()
        };
        buf[..len].to_vec()
    }

    #[test]
    fn pairing_request_roundtrip() {
        let features = PairingFeatures {
            io_capability: IoCapability::DisplayYesNo,
            oob_data_flag: OobDataFlag::NotPresent,
            auth_req: AuthReq::new(true, true, true, false, true),
            max_encryption_key_size: 16,
            initiator_key_distribution: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            responder_key_distribution: KeyDistribution::ENC_KEY,
        };
        let cmd = Command::PairingRequest(features);
        let bytes = roundtrip(&cmd);
        assert_eq!(bytes.len(), 1 + PairingFeatures::LEN);

        let mut reader = ByteReader::new(&bytes);
        match Command::from_bytes(&mut reader).unwrap() {
            Command::PairingRequest(decoded) => assert_eq!(decoded, features),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn pairing_failed_rejects_empty_body() {
        let bytes = [Code::PairingFailed.into()];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(
            Command::from_bytes(&mut reader).unwrap_err(),
            Error::InvalidLength
        );
    }

    #[test]
    fn pairing_public_key_roundtrip() {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        for i in 0..32 {
            x[i] = i as u8;
            y[i] = 31 - i as u8;
        }
        let cmd = Command::PairingPublicKey { x, y };
        let bytes = roundtrip(&cmd);
        let mut reader = ByteReader::new(&bytes);
        match Command::from_bytes(&mut reader).unwrap() {
            Command::PairingPublicKey { x: gx, y: gy } => {
                assert_eq!(gx, x);
                assert_eq!(gy, y);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        let bytes = [0xFF, 1, 2, 3];
        let mut reader = ByteReader::new(&bytes);
        match Command::from_bytes(&mut reader).unwrap() {
            Command::Unknown { code, data } => {
                assert_eq!(code, 0xFF);
                assert_eq!(data, &[1, 2, 3]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn key_distribution_masks_reserved_bits() {
        // Only the low 4 bits are defined; a peer setting reserved bits must not break us.
        let kd = KeyDistribution::from_bits_truncate(0xFF);
        assert_eq!(kd, KeyDistribution::all());
    }
}
