//! RTP fixed-header parsing and serialization, plus RTCP disambiguation.
//!
//! Parsing follows RFC 3550 for the fixed header and RFC 5285 for the
//! one-byte header-extension profile (`0xBEDE`). Extension parsing is best
//! effort: a malformed or unrecognized extension element stops extension
//! parsing but never fails the header parse itself.

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extension::{ExtensionMap, ExtensionType};

pub const HEADER_LENGTH: usize = 12;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_MASK: u8 = 0x20;
pub const EXTENSION_MASK: u8 = 0x10;
pub const CC_MASK: u8 = 0x0f;
pub const MARKER_MASK: u8 = 0x80;
pub const PT_MASK: u8 = 0x7f;

pub const RTP_EXPECTED_VERSION: u8 = 2;
pub const RTCP_MIN_HEADER_LENGTH: usize = 4;
pub const RTCP_MIN_PARSE_LENGTH: usize = 8;

/// "defined by profile" value selecting RFC 5285 one-byte extensions.
pub const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;

/// Extension element id that terminates one-byte extension parsing.
const EXTENSION_ID_RESERVED: u8 = 15;

/// Values parsed out of the one-byte header-extension block.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExtensions {
    /// May be omitted for packets whose offset is zero.
    pub has_transmission_time_offset: bool,
    pub transmission_time_offset: i32,
    pub has_absolute_send_time: bool,
    pub absolute_send_time: u32,
}

/// A parsed RTP header. Immutable once parsed.
///
/// `header_length` always equals `12 + 4 * csrcs.len() + extension bytes`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub padding_length: u8,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extensions: HeaderExtensions,
    pub header_length: usize,
}

/// Minimal extraction for RTCP-classified buffers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    pub payload_type: u8,
    pub ssrc: u32,
    pub header_length: usize,
}

/// Classifies a raw buffer as RTCP rather than RTP.
///
/// Payload types 192, 195 and 200..=207 are RTCP; 193 (NACK, unsupported)
/// passes through for a potential RTP interpretation. Buffers shorter than
/// 4 bytes or with a version other than 2 are treated as RTP.
pub fn is_rtcp(buf: &[u8]) -> bool {
    if buf.len() < RTCP_MIN_HEADER_LENGTH {
        return false;
    }
    if buf[0] >> VERSION_SHIFT != RTP_EXPECTED_VERSION {
        return false;
    }
    matches!(buf[1], 192 | 195 | 200..=207)
}

/// Extracts payload type, SSRC and header length from an RTCP buffer.
pub fn parse_rtcp(buf: &[u8]) -> Result<RtcpHeader> {
    if buf.len() < RTCP_MIN_PARSE_LENGTH {
        return Err(Error::ErrRtcpHeaderSizeInsufficient);
    }
    if buf[0] >> VERSION_SHIFT != RTP_EXPECTED_VERSION {
        return Err(Error::ErrBadVersion);
    }

    let len = (usize::from(buf[2]) << 8) | usize::from(buf[3]);
    let ssrc = read_u32(&buf[4..8]);

    Ok(RtcpHeader {
        payload_type: buf[1],
        ssrc,
        header_length: 4 + (len << 2),
    })
}

impl Header {
    /// Parses the RTP fixed header, CSRC list and one-byte header
    /// extensions out of `buf`.
    pub fn parse(buf: &[u8], ext_map: &ExtensionMap) -> Result<Header> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let version = buf[0] >> VERSION_SHIFT;
        if version != RTP_EXPECTED_VERSION {
            return Err(Error::ErrBadVersion);
        }
        let padding = (buf[0] & PADDING_MASK) != 0;
        let extension = (buf[0] & EXTENSION_MASK) != 0;
        let cc = usize::from(buf[0] & CC_MASK);
        let marker = (buf[1] & MARKER_MASK) != 0;
        let payload_type = buf[1] & PT_MASK;
        let sequence_number = (u16::from(buf[2]) << 8) | u16::from(buf[3]);
        let timestamp = read_u32(&buf[4..8]);
        let ssrc = read_u32(&buf[8..12]);

        let csrc_octets = cc * 4;
        if HEADER_LENGTH + csrc_octets > buf.len() {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let mut csrcs = Vec::with_capacity(cc);
        let mut offset = HEADER_LENGTH;
        for _ in 0..cc {
            csrcs.push(read_u32(&buf[offset..offset + 4]));
            offset += 4;
        }

        let mut header = Header {
            version,
            padding,
            padding_length: if padding { buf[buf.len() - 1] } else { 0 },
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extensions: HeaderExtensions::default(),
            header_length: HEADER_LENGTH + csrc_octets,
        };

        if extension {
            let remain = buf.len() - offset;
            if remain < 4 {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let defined_by_profile = (u16::from(buf[offset]) << 8) | u16::from(buf[offset + 1]);
            // Extension length in 32-bit words.
            let ext_len = ((usize::from(buf[offset + 2]) << 8) | usize::from(buf[offset + 3])) * 4;
            if remain < 4 + ext_len {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            header.header_length += 4;
            if defined_by_profile == ONE_BYTE_EXTENSION_PROFILE {
                parse_one_byte_extensions(
                    &mut header.extensions,
                    ext_map,
                    &buf[offset + 4..offset + 4 + ext_len],
                );
            }
            header.header_length += ext_len;
        }

        Ok(header)
    }

    /// Serializes the fixed header and CSRC list into `buf`, returning the
    /// header length. The send paths never emit extensions or padding.
    pub fn marshal_to(&self, buf: &mut BytesMut) -> usize {
        let cc = self.csrcs.len().min(15) as u8;
        buf.put_u8((RTP_EXPECTED_VERSION << VERSION_SHIFT) | cc);
        buf.put_u8(if self.marker {
            self.payload_type | MARKER_MASK
        } else {
            self.payload_type
        });
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in self.csrcs.iter().take(usize::from(cc)) {
            buf.put_u32(*csrc);
        }
        HEADER_LENGTH + usize::from(cc) * 4
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.csrcs.len() * 4);
        self.marshal_to(&mut buf);
        buf.freeze()
    }
}

/// Walks one-byte extension elements. Best effort: any condition that
/// prevents further progress returns with whatever was populated so far.
fn parse_one_byte_extensions(extensions: &mut HeaderExtensions, ext_map: &ExtensionMap, buf: &[u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        let id = buf[offset] >> 4;
        let len = usize::from(buf[offset] & 0x0f);
        offset += 1;

        if id == EXTENSION_ID_RESERVED {
            warn!("ext id 15 encountered, extension parsing terminated");
            return;
        }

        let Some(extension_type) = ext_map.lookup(id) else {
            debug!("no extension registered for id {id}");
            return;
        };

        if offset + len + 1 > buf.len() {
            warn!("extension id {id} runs past the extension block");
            return;
        }

        match extension_type {
            ExtensionType::TransmissionTimeOffset => {
                if len != 2 {
                    warn!("incorrect transmission time offset len: {len}");
                    return;
                }
                let mut value = (i32::from(buf[offset]) << 16)
                    | (i32::from(buf[offset + 1]) << 8)
                    | i32::from(buf[offset + 2]);
                if value & 0x80_0000 != 0 {
                    // Negative offset, sign-extend Word24 to Word32.
                    value |= -0x100_0000; // 0xFF000000
                }
                extensions.transmission_time_offset = value;
                extensions.has_transmission_time_offset = true;
            }
            ExtensionType::AudioLevel => {
                // Carried on video streams only for debugging; discarded.
            }
            ExtensionType::AbsoluteSendTime => {
                if len != 2 {
                    warn!("incorrect absolute send time len: {len}");
                    return;
                }
                extensions.absolute_send_time = (u32::from(buf[offset]) << 16)
                    | (u32::from(buf[offset + 1]) << 8)
                    | u32::from(buf[offset + 2]);
                extensions.has_absolute_send_time = true;
            }
        }
        offset += len + 1;

        // Zero bytes pad to the next element.
        while offset < buf.len() && buf[offset] == 0 {
            offset += 1;
        }
    }
}

#[inline]
fn read_u32(buf: &[u8]) -> u32 {
    (u32::from(buf[0]) << 24) | (u32::from(buf[1]) << 16) | (u32::from(buf[2]) << 8) | u32::from(buf[3])
}
