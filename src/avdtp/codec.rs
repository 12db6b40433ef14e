//! AVDTP wire codec: signaling header, service capability elements, and the
//! per-signal command/response/reject bodies.
//!
//! Every signaling message starts with a 1-byte header (transaction label / packet
//! type / message type) and, for SINGLE and START packets, a 1-byte signal
//! identifier. The [`super`] engine's reassembler always hands this module a
//! normalized, SINGLE-shaped buffer (header byte, signal-id byte, body) regardless
//! of how many fragments the message originally arrived in, so none of the types
//! here need to know about fragmentation at all.
//!
//! Decoding a signal body can fail in a way the peer needs to hear about (a
//! specific AVDTP [`ErrorCode`], carried back in a Reject), which is why the
//! per-signal decoders return `Result<_, ErrorCode>` rather than [`crate::Error`].

use crate::bytes::*;
use crate::Error;
use std::fmt;

enum_with_unknown! {
    /// Signal Identifier field (AVDTP signaling header).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SignalId(u8) {
        Discover = 0x01,
        GetCapabilities = 0x02,
        SetConfiguration = 0x03,
        GetConfiguration = 0x04,
        Reconfigure = 0x05,
        Open = 0x06,
        Start = 0x07,
        Close = 0x08,
        Suspend = 0x09,
        Abort = 0x0A,
        SecurityControl = 0x0B,
        GetAllCapabilities = 0x0C,
        DelayReport = 0x0D,
    }
}

impl SignalId {
    /// Lowest and highest signal identifiers a command packet may legally carry.
    ///
    /// A command outside this range gets a General-Reject rather than being routed
    /// anywhere. `DelayReport` (13) is included even though the header field
    /// description in the core spec's signal-id prose only enumerates the first
    /// twelve signals by name before listing delay-report as well — the boundary is
    /// read here as "one past the last named signal", not as excluding the last
    /// named signal itself.
    pub const MIN: u8 = 0x01;
    pub const MAX: u8 = 0x0D;

    pub fn in_range(raw: u8) -> bool {
        raw >= Self::MIN && raw <= Self::MAX
    }
}

/// Command/response/general-reject discriminator (AVDTP signaling header).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Command,
    GeneralReject,
    ResponseAccept,
    ResponseReject,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x3 {
            0 => MessageType::Command,
            1 => MessageType::GeneralReject,
            2 => MessageType::ResponseAccept,
            _ => MessageType::ResponseReject,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            MessageType::Command => 0,
            MessageType::GeneralReject => 1,
            MessageType::ResponseAccept => 2,
            MessageType::ResponseReject => 3,
        }
    }
}

/// Packet-type field distinguishing fragments of a signaling message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketType {
    Single,
    Start,
    Continue,
    End,
}

impl PacketType {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x3 {
            0 => PacketType::Single,
            1 => PacketType::Start,
            2 => PacketType::Continue,
            _ => PacketType::End,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            PacketType::Single => 0,
            PacketType::Start => 1,
            PacketType::Continue => 2,
            PacketType::End => 3,
        }
    }
}

/// Decodes the label/packet-type/message-type triple from a raw header byte.
pub fn decode_header_byte(byte: u8) -> (u8, PacketType, MessageType) {
    let label = byte >> 4;
    let packet_type = PacketType::from_raw(byte >> 2);
    let message_type = MessageType::from_raw(byte);
    (label, packet_type, message_type)
}

/// Packs the label/packet-type/message-type triple into a raw header byte.
pub fn encode_header_byte(label: u8, packet_type: PacketType, message_type: MessageType) -> u8 {
    (label << 4) | (packet_type.to_raw() << 2) | message_type.to_raw()
}

enum_with_unknown! {
    /// Reject error codes (Section 8.20.6 and surrounding tables).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ErrorCode(u8) {
        BadHeaderFormat = 0x01,
        BadLength = 0x11,
        BadAcpSeid = 0x12,
        SepInUse = 0x13,
        SepNotInUse = 0x14,
        BadServiceCategory = 0x17,
        BadPayloadFormat = 0x18,
        NotSupportedCommand = 0x19,
        InvalidCapabilities = 0x1A,
        BadRecoveryType = 0x22,
        BadMediaTransportFormat = 0x23,
        BadRecoveryFormat = 0x25,
        BadRohcFormat = 0x26,
        BadCpFormat = 0x27,
        BadMultiplexingFormat = 0x28,
        UnsupportedConfiguration = 0x29,
        BadState = 0x31,
    }
}

enum_with_unknown! {
    /// Service category identifiers used in capability/configuration elements.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum ServiceCategory(u8) {
        MediaTransport = 0x01,
        Reporting = 0x02,
        Recovery = 0x03,
        ContentProtection = 0x04,
        HeaderCompression = 0x05,
        Multiplexing = 0x06,
        MediaCodec = 0x07,
        DelayReporting = 0x08,
    }
}

enum_with_unknown! {
    /// Media type of a stream endpoint (Bluetooth Assigned Numbers, audio/video).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MediaType(u8) {
        Audio = 0x00,
        Video = 0x01,
        Multimedia = 0x02,
    }
}

/// Direction a stream endpoint can act in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointType {
    Source,
    Sink,
}

impl EndpointType {
    pub fn from_raw(raw: u8) -> Self {
        if raw & 0x1 != 0 {
            EndpointType::Sink
        } else {
            EndpointType::Source
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            EndpointType::Source => 0,
            EndpointType::Sink => 1,
        }
    }
}

/// A Stream End Point Identifier. Valid values are `1..=62`; `0` and `63..`
/// (which would collide with the reserved/RFA bits of the byte it's normally
/// packed into) are never valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seid(u8);

impl Seid {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 62;

    pub fn new(value: u8) -> Result<Self, ErrorCode> {
        if value < Self::MIN || value > Self::MAX {
            Err(ErrorCode::BadAcpSeid)
        } else {
            Ok(Seid(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Reads a SEID from the upper six bits of a byte, as used in most signaling
    /// messages (the low 2 bits are either reserved or carry flags like `in_use`).
    fn from_packed(byte: u8) -> Result<Self, ErrorCode> {
        Self::new(byte >> 2)
    }

    /// Packs this SEID into the upper six bits of a byte, leaving the low 2 bits
    /// zero for the caller to OR in any flag bits.
    fn to_packed(self) -> u8 {
        self.0 << 2
    }
}

impl fmt::Display for Seid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a Discover response: a stream endpoint and its headline info.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamInformation {
    pub seid: Seid,
    pub in_use: bool,
    pub media_type: MediaType,
    pub endpoint_type: EndpointType,
}

impl StreamInformation {
    const LEN: usize = 2;

    fn read(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let b0 = bytes.read_u8()?;
        let b1 = bytes.read_u8()?;
        let seid = Seid::from_packed(b0).map_err(|_| Error::InvalidValue)?;
        Ok(StreamInformation {
            seid,
            in_use: b0 & 0x02 != 0,
            media_type: MediaType::from(b1 >> 4),
            endpoint_type: EndpointType::from_raw(b1 >> 3),
        })
    }

    fn write(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.seid.to_packed() | if self.in_use { 0x02 } else { 0x00 })?;
        let media: u8 = self.media_type.into();
        writer.write_u8((media << 4) | (self.endpoint_type.to_raw() << 3))
    }
}

/// A codec identifier within a `MediaCodec` service capability.
///
/// Interpreted differently per media type; the constants cover the audio codecs
/// assigned for A2DP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaCodecType(pub u8);

impl MediaCodecType {
    pub const SBC: Self = MediaCodecType(0x00);
    pub const MPEG_1_2_AUDIO: Self = MediaCodecType(0x01);
    pub const MPEG_2_4_AAC: Self = MediaCodecType(0x02);
    pub const ATRAC: Self = MediaCodecType(0x04);
    pub const VENDOR: Self = MediaCodecType(0xFF);
}

/// Content protection scheme identifier within a `ContentProtection` capability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentProtectionType {
    Dtcp,
    ScmsT,
    Unknown(u16),
}

impl ContentProtectionType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0x0001 => ContentProtectionType::Dtcp,
            0x0002 => ContentProtectionType::ScmsT,
            other => ContentProtectionType::Unknown(other),
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            ContentProtectionType::Dtcp => 0x0001,
            ContentProtectionType::ScmsT => 0x0002,
            ContentProtectionType::Unknown(raw) => raw,
        }
    }
}

/// A maximum payload size applied to the two variable-length capability kinds
/// (`MediaCodec`, `ContentProtection`). Generous enough for any codec-specific
/// element seen in practice (SBC/AAC/aptX/LDAC) while bounding how much a
/// misbehaving peer can make us allocate.
pub const MAX_CAPABILITY_PAYLOAD: usize = 96;

/// A single service capability (or configuration element), keyed by category.
///
/// See Section 8.21 for the wire layout of each variant; [`ServiceCapability::category`]
/// recovers the category id an instance would encode with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCapability {
    MediaTransport,
    Reporting,
    Recovery {
        recovery_type: u8,
        max_recovery_window_size: u8,
        max_number_media_packets: u8,
    },
    ContentProtection {
        protection_type: ContentProtectionType,
        extra: Vec<u8>,
    },
    HeaderCompression {
        payload: Vec<u8>,
    },
    Multiplexing {
        payload: Vec<u8>,
    },
    MediaCodec {
        media_type: MediaType,
        codec_type: MediaCodecType,
        codec_extra: Vec<u8>,
    },
    DelayReporting,
}

impl ServiceCapability {
    pub fn category(&self) -> ServiceCategory {
        match self {
            ServiceCapability::MediaTransport => ServiceCategory::MediaTransport,
            ServiceCapability::Reporting => ServiceCategory::Reporting,
            ServiceCapability::Recovery { .. } => ServiceCategory::Recovery,
            ServiceCapability::ContentProtection { .. } => ServiceCategory::ContentProtection,
            ServiceCapability::HeaderCompression { .. } => ServiceCategory::HeaderCompression,
            ServiceCapability::Multiplexing { .. } => ServiceCategory::Multiplexing,
            ServiceCapability::MediaCodec { .. } => ServiceCategory::MediaCodec,
            ServiceCapability::DelayReporting => ServiceCategory::DelayReporting,
        }
    }

    /// `DelayReporting` is the one non-"basic" capability (Table 8.47): it's never
    /// included in a plain Get-Capabilities response, only in Get-All-Capabilities.
    pub fn is_basic(&self) -> bool {
        !matches!(self, ServiceCapability::DelayReporting)
    }

    pub fn is_codec(&self) -> bool {
        matches!(self, ServiceCapability::MediaCodec { .. })
    }

    fn payload_len(&self) -> usize {
        match self {
            ServiceCapability::MediaTransport
            | ServiceCapability::Reporting
            | ServiceCapability::DelayReporting => 0,
            ServiceCapability::Recovery { .. } => 3,
            ServiceCapability::ContentProtection { extra, .. } => 2 + extra.len(),
            ServiceCapability::HeaderCompression { payload } => payload.len(),
            ServiceCapability::Multiplexing { payload } => payload.len(),
            ServiceCapability::MediaCodec { codec_extra, .. } => 2 + codec_extra.len(),
        }
    }

    fn encoded_len(&self) -> usize {
        2 + self.payload_len()
    }

    fn write(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let category: u8 = self.category().into();
        writer.write_u8(category)?;
        writer.write_u8(self.payload_len() as u8)?;
        match self {
            ServiceCapability::MediaTransport
            | ServiceCapability::Reporting
            | ServiceCapability::DelayReporting => Ok(()),
            ServiceCapability::Recovery {
                recovery_type,
                max_recovery_window_size,
                max_number_media_packets,
            } => {
                writer.write_u8(*recovery_type)?;
                writer.write_u8(*max_recovery_window_size)?;
                writer.write_u8(*max_number_media_packets)
            }
            ServiceCapability::ContentProtection {
                protection_type,
                extra,
            } => {
                writer.write_u16_le(protection_type.to_raw())?;
                writer.write_slice(extra)
            }
            ServiceCapability::HeaderCompression { payload } => writer.write_slice(payload),
            ServiceCapability::Multiplexing { payload } => writer.write_slice(payload),
            ServiceCapability::MediaCodec {
                media_type,
                codec_type,
                codec_extra,
            } => {
                let media: u8 = (*media_type).into();
                writer.write_u8(media << 4)?;
                writer.write_u8(codec_type.0)?;
                writer.write_slice(codec_extra)
            }
        }
    }

    /// Decodes one (category, length, payload) element from `bytes`.
    ///
    /// `from[0]` is the category id, `from[1]` the payload length, `from[2..]` the
    /// payload; exactly `2 + length` bytes are consumed on success. An unknown
    /// category is reported as `Err(None)` so a caller can choose to skip it
    /// (capability responses) or reject it (configuration commands); every other
    /// failure is a concrete [`ErrorCode`] the caller should use verbatim.
    fn read(bytes: &mut ByteReader<'_>) -> Result<Result<Self, ErrorCode>, Error> {
        let category_raw = bytes.read_u8()?;
        let length = bytes.read_u8()? as usize;
        let category = ServiceCategory::from(category_raw);

        // Recovery's a field-checked fixed layout needs its 3 bytes available even
        // when `length` lies about it, so bounds-check against the reader directly
        // rather than trusting the declared length for anything but the generic
        // "unknown category" / opaque-payload cases.
        let cap = match category {
            ServiceCategory::MediaTransport => {
                let _ = bytes.read_slice(length)?;
                if length != 0 {
                    return Ok(Err(ErrorCode::BadMediaTransportFormat));
                }
                Ok(ServiceCapability::MediaTransport)
            }
            ServiceCategory::Reporting => {
                let _ = bytes.read_slice(length)?;
                if length != 0 {
                    return Ok(Err(ErrorCode::BadPayloadFormat));
                }
                Ok(ServiceCapability::Reporting)
            }
            ServiceCategory::Recovery => {
                let body = bytes.read_slice(length)?;
                if length != 3 {
                    return Ok(Err(ErrorCode::BadRecoveryFormat));
                }
                let (recovery_type, mrws, mnmp) = (body[0], body[1], body[2]);
                if recovery_type != 0x01 {
                    return Ok(Err(ErrorCode::BadRecoveryType));
                }
                // Per the source's defensive policy: MRWS/MNMP outside 0x01..=0x18
                // are rejected even though the wire format could carry larger values.
                if !(0x01..=0x18).contains(&mrws) || !(0x01..=0x18).contains(&mnmp) {
                    return Ok(Err(ErrorCode::BadRecoveryFormat));
                }
                Ok(ServiceCapability::Recovery {
                    recovery_type,
                    max_recovery_window_size: mrws,
                    max_number_media_packets: mnmp,
                })
            }
            ServiceCategory::ContentProtection => {
                let body = bytes.read_slice(length)?;
                if length < 2 || length - 2 > MAX_CAPABILITY_PAYLOAD {
                    return Ok(Err(ErrorCode::BadCpFormat));
                }
                let protection_type =
                    ContentProtectionType::from_raw(u16::from_le_bytes([body[0], body[1]]));
                Ok(ServiceCapability::ContentProtection {
                    protection_type,
                    extra: body[2..].to_vec(),
                })
            }
            ServiceCategory::HeaderCompression => {
                let body = bytes.read_slice(length)?;
                Ok(ServiceCapability::HeaderCompression {
                    payload: body.to_vec(),
                })
            }
            ServiceCategory::Multiplexing => {
                let body = bytes.read_slice(length)?;
                Ok(ServiceCapability::Multiplexing {
                    payload: body.to_vec(),
                })
            }
            ServiceCategory::MediaCodec => {
                let body = bytes.read_slice(length)?;
                if length < 2 || length - 2 > MAX_CAPABILITY_PAYLOAD {
                    return Ok(Err(ErrorCode::BadPayloadFormat));
                }
                let media_type = MediaType::from(body[0] >> 4);
                let codec_type = MediaCodecType(body[1]);
                Ok(ServiceCapability::MediaCodec {
                    media_type,
                    codec_type,
                    codec_extra: body[2..].to_vec(),
                })
            }
            ServiceCategory::DelayReporting => {
                let _ = bytes.read_slice(length)?;
                if length != 0 {
                    return Ok(Err(ErrorCode::BadPayloadFormat));
                }
                Ok(ServiceCapability::DelayReporting)
            }
            ServiceCategory::Unknown(_) => {
                let _ = bytes.read_slice(length)?;
                return Ok(Err(ErrorCode::BadServiceCategory));
            }
        };
        Ok(cap)
    }
}

/// A parsed list of service capabilities or configuration elements.
///
/// The same wire shape (a run of (category, length, payload) elements) is used
/// for capability responses and for Set-Configuration/Reconfigure bodies, but the
/// two contexts validate differently: unknown categories are skipped in
/// capability responses (forward compatibility) but rejected in configuration
/// commands, and a configuration additionally requires exactly one codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SepConfiguration(Vec<ServiceCapability>);

impl SepConfiguration {
    pub fn new(capabilities: Vec<ServiceCapability>) -> Self {
        SepConfiguration(capabilities)
    }

    pub fn capabilities(&self) -> &[ServiceCapability] {
        &self.0
    }

    pub fn get(&self, category: ServiceCategory) -> Option<&ServiceCapability> {
        self.0.iter().find(|c| c.category() == category)
    }

    /// Parses a capability list for a Get-Capabilities/Get-All-Capabilities/
    /// Get-Configuration response: unknown categories are silently dropped.
    pub fn parse_capabilities(bytes: &[u8]) -> Result<Self, ErrorCode> {
        let mut reader = ByteReader::new(bytes);
        let mut caps = Vec::new();
        while !reader.is_empty() {
            match ServiceCapability::read(&mut reader).map_err(|_| ErrorCode::BadLength)? {
                Ok(cap) => caps.push(cap),
                Err(ErrorCode::BadServiceCategory) => continue,
                Err(code) => return Err(code),
            }
        }
        Ok(SepConfiguration(caps))
    }

    /// Parses a Set-Configuration/Reconfigure body: unknown categories and
    /// duplicate categories are rejected, and the result must name exactly one
    /// codec (the configuration invariant in the data model).
    pub fn parse_configuration(bytes: &[u8]) -> Result<Self, ErrorCode> {
        let mut reader = ByteReader::new(bytes);
        let mut caps: Vec<ServiceCapability> = Vec::new();
        while !reader.is_empty() {
            let cap = ServiceCapability::read(&mut reader).map_err(|_| ErrorCode::BadLength)??;
            if caps.iter().any(|c| c.category() == cap.category()) {
                return Err(ErrorCode::InvalidCapabilities);
            }
            caps.push(cap);
        }
        if caps.iter().filter(|c| c.is_codec()).count() != 1 {
            return Err(ErrorCode::InvalidCapabilities);
        }
        Ok(SepConfiguration(caps))
    }

    /// Encodes the capability list for a response to `signal`: `GetCapabilities`
    /// omits non-basic capabilities (just `DelayReporting` today), every other
    /// signal (Get-All-Capabilities, Get-Configuration) includes everything.
    pub fn write(&self, signal: SignalId, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        for cap in &self.0 {
            if signal == SignalId::GetCapabilities && !cap.is_basic() {
                continue;
            }
            cap.write(writer)?;
        }
        Ok(())
    }
}

/// A fully decoded AVDTP command (message-type `Command`).
#[derive(Debug, Clone)]
pub enum Command {
    Discover,
    GetCapabilities { acp_seid: Seid },
    SetConfiguration { acp_seid: Seid, int_seid: Seid, capabilities: SepConfiguration },
    GetConfiguration { acp_seid: Seid },
    Reconfigure { acp_seid: Seid, capabilities: SepConfiguration },
    Open { acp_seid: Seid },
    Start { acp_seids: Vec<Seid> },
    Close { acp_seid: Seid },
    Suspend { acp_seids: Vec<Seid> },
    Abort { acp_seid: Seid },
    SecurityControl { acp_seid: Seid, data: Vec<u8> },
    GetAllCapabilities { acp_seid: Seid },
    DelayReport { acp_seid: Seid, delay: u16 },
}

impl Command {
    /// Decodes the body of a command for the given `signal`.
    ///
    /// Errors are the specific [`ErrorCode`] the engine should echo back in the
    /// Reject (or General-Reject body, for signals that use one) for this command,
    /// per the parser contract: never read past the body, never panic on a short
    /// or malformed read.
    pub fn decode(signal: SignalId, body: &[u8]) -> Result<Self, ErrorCode> {
        let mut r = ByteReader::new(body);
        let seid_byte = |r: &mut ByteReader<'_>| -> Result<Seid, ErrorCode> {
            let b = r.read_u8().map_err(|_| ErrorCode::BadLength)?;
            Seid::from_packed(b)
        };
        let seid_list = |r: &mut ByteReader<'_>| -> Result<Vec<Seid>, ErrorCode> {
            if r.is_empty() {
                return Err(ErrorCode::BadLength);
            }
            let mut seids = Vec::new();
            while !r.is_empty() {
                seids.push(seid_byte(r)?);
            }
            Ok(seids)
        };

        Ok(match signal {
            SignalId::Discover => {
                if !body.is_empty() {
                    return Err(ErrorCode::BadLength);
                }
                Command::Discover
            }
            SignalId::GetCapabilities => Command::GetCapabilities {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::SetConfiguration => {
                let acp_seid = seid_byte(&mut r)?;
                let int_seid = seid_byte(&mut r)?;
                let rest = r.read_rest();
                Command::SetConfiguration {
                    acp_seid,
                    int_seid,
                    capabilities: SepConfiguration::parse_configuration(rest)?,
                }
            }
            SignalId::GetConfiguration => Command::GetConfiguration {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::Reconfigure => {
                let acp_seid = seid_byte(&mut r)?;
                let rest = r.read_rest();
                Command::Reconfigure {
                    acp_seid,
                    capabilities: SepConfiguration::parse_configuration(rest)?,
                }
            }
            SignalId::Open => Command::Open {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::Start => Command::Start {
                acp_seids: seid_list(&mut r)?,
            },
            SignalId::Close => Command::Close {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::Suspend => Command::Suspend {
                acp_seids: seid_list(&mut r)?,
            },
            SignalId::Abort => Command::Abort {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::SecurityControl => {
                let acp_seid = seid_byte(&mut r)?;
                Command::SecurityControl {
                    acp_seid,
                    data: r.read_rest().to_vec(),
                }
            }
            SignalId::GetAllCapabilities => Command::GetAllCapabilities {
                acp_seid: seid_byte(&mut r)?,
            },
            SignalId::DelayReport => {
                let acp_seid = seid_byte(&mut r)?;
                let delay = r.read_u16_le().map_err(|_| ErrorCode::BadLength)?;
                if !r.is_empty() {
                    return Err(ErrorCode::BadLength);
                }
                Command::DelayReport { acp_seid, delay }
            }
            SignalId::Unknown(_) => return Err(ErrorCode::NotSupportedCommand),
        })
    }

    pub fn signal(&self) -> SignalId {
        match self {
            Command::Discover => SignalId::Discover,
            Command::GetCapabilities { .. } => SignalId::GetCapabilities,
            Command::SetConfiguration { .. } => SignalId::SetConfiguration,
            Command::GetConfiguration { .. } => SignalId::GetConfiguration,
            Command::Reconfigure { .. } => SignalId::Reconfigure,
            Command::Open { .. } => SignalId::Open,
            Command::Start { .. } => SignalId::Start,
            Command::Close { .. } => SignalId::Close,
            Command::Suspend { .. } => SignalId::Suspend,
            Command::Abort { .. } => SignalId::Abort,
            Command::SecurityControl { .. } => SignalId::SecurityControl,
            Command::GetAllCapabilities { .. } => SignalId::GetAllCapabilities,
            Command::DelayReport { .. } => SignalId::DelayReport,
        }
    }

    /// Encodes the body (not including the signal-id byte, which the engine
    /// places in the packet header) into `writer`.
    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Command::Discover => Ok(()),
            Command::GetCapabilities { acp_seid }
            | Command::GetConfiguration { acp_seid }
            | Command::Open { acp_seid }
            | Command::Close { acp_seid }
            | Command::Abort { acp_seid }
            | Command::GetAllCapabilities { acp_seid } => {
                writer.write_u8(acp_seid.to_packed())
            }
            Command::SetConfiguration {
                acp_seid,
                int_seid,
                capabilities,
            } => {
                writer.write_u8(acp_seid.to_packed())?;
                writer.write_u8(int_seid.to_packed())?;
                capabilities.write(SignalId::SetConfiguration, writer)
            }
            Command::Reconfigure {
                acp_seid,
                capabilities,
            } => {
                writer.write_u8(acp_seid.to_packed())?;
                capabilities.write(SignalId::Reconfigure, writer)
            }
            Command::Start { acp_seids } | Command::Suspend { acp_seids } => {
                for seid in acp_seids {
                    writer.write_u8(seid.to_packed())?;
                }
                Ok(())
            }
            Command::SecurityControl { acp_seid, data } => {
                writer.write_u8(acp_seid.to_packed())?;
                writer.write_slice(data)
            }
            Command::DelayReport { acp_seid, delay } => {
                writer.write_u8(acp_seid.to_packed())?;
                writer.write_u16_le(*delay)
            }
        }
    }
}

/// A fully decoded AVDTP response (message-type `ResponseAccept`).
#[derive(Debug, Clone)]
pub enum Response {
    Discover { streams: Vec<StreamInformation> },
    Capabilities { capabilities: SepConfiguration },
    SecurityControl { data: Vec<u8> },
    /// An empty acknowledgement: Set-Configuration, Reconfigure, Open, Start,
    /// Close, Suspend, Abort, Delay-Report all respond this way.
    Accept,
}

impl Response {
    pub fn decode(signal: SignalId, body: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(body);
        Ok(match signal {
            SignalId::Discover => {
                let mut streams = Vec::new();
                while !r.is_empty() {
                    streams.push(StreamInformation::read(&mut r)?);
                }
                Response::Discover { streams }
            }
            SignalId::GetCapabilities | SignalId::GetAllCapabilities | SignalId::GetConfiguration => {
                Response::Capabilities {
                    capabilities: SepConfiguration::parse_capabilities(r.read_rest())
                        .map_err(|_| Error::InvalidValue)?,
                }
            }
            SignalId::SecurityControl => Response::SecurityControl {
                data: r.read_rest().to_vec(),
            },
            _ => {
                if !body.is_empty() {
                    return Err(Error::InvalidLength);
                }
                Response::Accept
            }
        })
    }

    pub fn encode(&self, signal: SignalId, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Response::Discover { streams } => {
                for stream in streams {
                    stream.write(writer)?;
                }
                Ok(())
            }
            Response::Capabilities { capabilities } => capabilities.write(signal, writer),
            Response::SecurityControl { data } => writer.write_slice(data),
            Response::Accept => Ok(()),
        }
    }
}

/// A rejection of a command, shaped per the signal it rejects (message-type
/// `ResponseReject`, or `GeneralReject` for [`Reject::General`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Signal id was 0, out of range, or otherwise unrouteable.
    General,
    /// A single error-code byte: used by Discover, Get-Capabilities,
    /// Get-All-Capabilities, Get-Configuration, Open, Close, Security-Control,
    /// Delay-Report.
    Simple { error_code: ErrorCode },
    /// Error code plus the offending service category: Set-Configuration,
    /// Reconfigure.
    Configuration {
        category: ServiceCategory,
        error_code: ErrorCode,
    },
    /// Error code plus the offending SEID: Start, Suspend.
    Stream { seid: Seid, error_code: ErrorCode },
}

impl Reject {
    /// The reject shape a given signal's rejection takes.
    pub fn shape_for(signal: SignalId) -> RejectShape {
        match signal {
            SignalId::SetConfiguration | SignalId::Reconfigure => RejectShape::Configuration,
            SignalId::Start | SignalId::Suspend => RejectShape::Stream,
            _ => RejectShape::Simple,
        }
    }

    pub fn decode(shape: RejectShape, body: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(body);
        Ok(match shape {
            RejectShape::Simple => Reject::Simple {
                error_code: ErrorCode::from(r.read_u8()?),
            },
            RejectShape::Configuration => Reject::Configuration {
                category: ServiceCategory::from(r.read_u8()?),
                error_code: ErrorCode::from(r.read_u8()?),
            },
            RejectShape::Stream => {
                let seid = Seid::from_packed(r.read_u8()?).map_err(|_| Error::InvalidValue)?;
                Reject::Stream {
                    seid,
                    error_code: ErrorCode::from(r.read_u8()?),
                }
            }
        })
    }

    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Reject::General => Ok(()),
            Reject::Simple { error_code } => writer.write_u8((*error_code).into()),
            Reject::Configuration {
                category,
                error_code,
            } => {
                writer.write_u8((*category).into())?;
                writer.write_u8((*error_code).into())
            }
            Reject::Stream { seid, error_code } => {
                writer.write_u8(seid.to_packed())?;
                writer.write_u8((*error_code).into())
            }
        }
    }
}

/// Which fixed shape a [`Reject`] body takes, selected by the signal it rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectShape {
    Simple,
    Configuration,
    Stream,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_cmd(cmd: &Command) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let len = {
            let mut writer = ByteWriter::new(&mut buf);
            let before = writer.space_left();
            cmd.encode(&mut writer).unwrap();
            before - writer.space_left()
        };
        buf[..len].to_vec()
    }

    #[test]
    fn header_byte_roundtrip() {
        let byte = encode_header_byte(0xA, PacketType::Start, MessageType::ResponseReject);
        let (label, pt, mt) = decode_header_byte(byte);
        assert_eq!(label, 0xA);
        assert_eq!(pt, PacketType::Start);
        assert_eq!(mt, MessageType::ResponseReject);
    }

    #[test]
    fn discover_roundtrips_with_no_body() {
        let bytes = roundtrip_cmd(&Command::Discover);
        assert!(bytes.is_empty());
        assert!(matches!(
            Command::decode(SignalId::Discover, &bytes).unwrap(),
            Command::Discover
        ));
    }

    #[test]
    fn get_capabilities_seid_roundtrip() {
        let seid = Seid::new(5).unwrap();
        let bytes = roundtrip_cmd(&Command::GetCapabilities { acp_seid: seid });
        assert_eq!(bytes, vec![5 << 2]);
        match Command::decode(SignalId::GetCapabilities, &bytes).unwrap() {
            Command::GetCapabilities { acp_seid } => assert_eq!(acp_seid, seid),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn seid_out_of_range_is_bad_acp_seid() {
        assert_eq!(Seid::new(0), Err(ErrorCode::BadAcpSeid));
        assert_eq!(Seid::new(63), Err(ErrorCode::BadAcpSeid));
        assert!(Seid::new(1).is_ok());
        assert!(Seid::new(62).is_ok());
    }

    #[test]
    fn set_configuration_requires_exactly_one_codec() {
        // No codec at all: rejected.
        let empty = SepConfiguration::new(vec![]);
        let mut buf = [0u8; 32];
        let mut writer = ByteWriter::new(&mut buf);
        empty
            .write(SignalId::SetConfiguration, &mut writer)
            .unwrap();
        let used = 32 - writer.space_left();
        assert_eq!(
            SepConfiguration::parse_configuration(&buf[..used]),
            Err(ErrorCode::InvalidCapabilities)
        );

        // Two codecs: also rejected.
        let two_codecs = vec![
            ServiceCapability::MediaCodec {
                media_type: MediaType::Audio,
                codec_type: MediaCodecType::SBC,
                codec_extra: vec![0x01],
            },
            ServiceCapability::MediaCodec {
                media_type: MediaType::Audio,
                codec_type: MediaCodecType::MPEG_2_4_AAC,
                codec_extra: vec![0x02],
            },
        ];
        let mut buf2 = [0u8; 64];
        let mut writer2 = ByteWriter::new(&mut buf2);
        for cap in &two_codecs {
            cap.write(&mut writer2).unwrap();
        }
        let used2 = 64 - writer2.space_left();
        assert_eq!(
            SepConfiguration::parse_configuration(&buf2[..used2]),
            Err(ErrorCode::InvalidCapabilities)
        );
    }

    #[test]
    fn set_configuration_single_codec_roundtrips() {
        let caps = SepConfiguration::new(vec![
            ServiceCapability::MediaTransport,
            ServiceCapability::MediaCodec {
                media_type: MediaType::Audio,
                codec_type: MediaCodecType::SBC,
                codec_extra: vec![0x21, 0x15, 2, 53],
            },
        ]);
        let mut buf = [0u8; 64];
        let mut writer = ByteWriter::new(&mut buf);
        caps.write(SignalId::SetConfiguration, &mut writer).unwrap();
        let used = 64 - writer.space_left();
        let parsed = SepConfiguration::parse_configuration(&buf[..used]).unwrap();
        assert_eq!(parsed, caps);
    }

    #[test]
    fn unknown_category_is_skipped_in_capability_response_but_rejected_in_configuration() {
        let mut buf = [0u8; 8];
        buf[0] = 0x09; // not a defined category
        buf[1] = 0x02;
        buf[2] = 0xAA;
        buf[3] = 0xBB;
        let caps = SepConfiguration::parse_capabilities(&buf[..4]).unwrap();
        assert!(caps.capabilities().is_empty());

        assert_eq!(
            SepConfiguration::parse_configuration(&buf[..4]),
            Err(ErrorCode::BadServiceCategory)
        );
    }

    #[test]
    fn get_capabilities_response_omits_delay_reporting() {
        let caps = SepConfiguration::new(vec![
            ServiceCapability::MediaTransport,
            ServiceCapability::DelayReporting,
        ]);
        let mut buf = [0u8; 16];
        let mut writer = ByteWriter::new(&mut buf);
        caps.write(SignalId::GetCapabilities, &mut writer).unwrap();
        let used = 16 - writer.space_left();
        // Only MediaTransport (2 bytes); DelayReporting is filtered out.
        assert_eq!(used, 2);

        let mut buf2 = [0u8; 16];
        let mut writer2 = ByteWriter::new(&mut buf2);
        caps.write(SignalId::GetAllCapabilities, &mut writer2).unwrap();
        let used2 = 16 - writer2.space_left();
        assert_eq!(used2, 4);
    }

    #[test]
    fn recovery_rejects_out_of_range_window() {
        let mut buf = [0x03, 3, 0x01, 0x00, 0x01]; // mrws = 0 is invalid
        assert_eq!(
            SepConfiguration::parse_capabilities(&mut buf),
            Err(ErrorCode::BadRecoveryFormat)
        );
    }

    #[test]
    fn start_seid_list_roundtrip() {
        let seids = vec![Seid::new(1).unwrap(), Seid::new(2).unwrap(), Seid::new(10).unwrap()];
        let bytes = roundtrip_cmd(&Command::Start {
            acp_seids: seids.clone(),
        });
        match Command::decode(SignalId::Start, &bytes).unwrap() {
            Command::Start { acp_seids } => assert_eq!(acp_seids, seids),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn start_with_no_seids_is_bad_length() {
        assert_eq!(
            Command::decode(SignalId::Start, &[]),
            Err(ErrorCode::BadLength)
        );
    }

    #[test]
    fn reject_shapes_roundtrip() {
        let cfg = Reject::Configuration {
            category: ServiceCategory::MediaCodec,
            error_code: ErrorCode::BadServiceCategory,
        };
        let mut buf = [0u8; 8];
        let mut writer = ByteWriter::new(&mut buf);
        cfg.encode(&mut writer).unwrap();
        let used = 8 - writer.space_left();
        assert_eq!(
            Reject::decode(RejectShape::Configuration, &buf[..used]).unwrap(),
            cfg
        );

        let stream = Reject::Stream {
            seid: Seid::new(7).unwrap(),
            error_code: ErrorCode::BadState,
        };
        let mut buf2 = [0u8; 8];
        let mut writer2 = ByteWriter::new(&mut buf2);
        stream.encode(&mut writer2).unwrap();
        let used2 = 8 - writer2.space_left();
        assert_eq!(
            Reject::decode(RejectShape::Stream, &buf2[..used2]).unwrap(),
            stream
        );
    }

    #[test]
    fn delay_report_roundtrip() {
        let cmd = Command::DelayReport {
            acp_seid: Seid::new(3).unwrap(),
            delay: 0x1234,
        };
        let bytes = roundtrip_cmd(&cmd);
        match Command::decode(SignalId::DelayReport, &bytes).unwrap() {
            Command::DelayReport { acp_seid, delay } => {
                assert_eq!(acp_seid, Seid::new(3).unwrap());
                assert_eq!(delay, 0x1234);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
