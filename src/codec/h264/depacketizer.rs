//! H.264 depacketizer: classifies incoming payloads by NAL type, rebuilds
//! the NAL header for FU-A start fragments and recovers frame metadata.

use bytes::{BufMut, Bytes, BytesMut};

use super::sps::parse_sps;
use super::{
    FU_A_HEADER_SIZE, FU_END_MASK, FU_START_MASK, NALU_TYPE_FU_A, NALU_TYPE_IDR, NALU_TYPE_MASK,
    NALU_TYPE_NON_IDR, NALU_TYPE_PPS, NALU_TYPE_SPS, NALU_TYPE_STAP_A,
};
use crate::codec::FrameType;
use crate::error::{Error, Result};
use crate::packetizer::Depacketizer;

/// One parsed H.264 payload. `data` is a zero-copy view into the packet
/// buffer except for FU-A start fragments, where the NAL header byte is
/// reconstructed in a fresh buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct H264Payload {
    pub frame_type: FrameType,
    pub data: Bytes,
    /// Type of the carried NAL unit (the inner type for FU-A).
    pub nalu_type: u8,
    /// True when this payload opens a new frame: first_mb_in_slice == 0
    /// for coded slices, the S bit for fragments, always for parameter
    /// sets.
    pub frame_begin: bool,
    /// True when this payload closes the frame (RTP marker, and the E bit
    /// for fragments).
    pub frame_end: bool,
    /// Frame dimensions, non-zero only when this payload carries an SPS.
    pub width: u16,
    pub height: u16,
}

/// Stateless RFC 6184 parser for Single-NALU and FU-A payloads. STAP-A
/// aggregates are rejected; the sender side never produces them.
#[derive(Debug, Default, Copy, Clone)]
pub struct H264Depacketizer;

/// A coded slice opens a frame iff first_mb_in_slice is 0, i.e. its
/// Exp-Golomb code is the single bit `1` at the top of the byte after the
/// NAL header.
fn slice_starts_frame(nalu_type: u8, byte_after_header: Option<u8>) -> bool {
    match nalu_type {
        NALU_TYPE_NON_IDR | NALU_TYPE_IDR => match byte_after_header {
            Some(b) => b & 0x80 != 0,
            None => false,
        },
        _ => true,
    }
}

fn frame_type_of(nalu_type: u8) -> FrameType {
    match nalu_type {
        NALU_TYPE_IDR | NALU_TYPE_SPS | NALU_TYPE_PPS => FrameType::Key,
        _ => FrameType::Delta,
    }
}

impl H264Depacketizer {
    /// Parses one RTP payload. `marker` is the RTP header marker bit, which
    /// closes the frame for non-fragmented payloads.
    pub fn parse(&mut self, payload: &Bytes, marker: bool) -> Result<H264Payload> {
        if payload.is_empty() {
            return Err(Error::ErrShortPayload);
        }

        let nalu_type = payload[0] & NALU_TYPE_MASK;
        match nalu_type {
            1..=23 => {
                let mut parsed = H264Payload {
                    frame_type: frame_type_of(nalu_type),
                    data: payload.clone(),
                    nalu_type,
                    frame_begin: slice_starts_frame(nalu_type, payload.get(1).copied()),
                    frame_end: marker,
                    ..Default::default()
                };
                if nalu_type == NALU_TYPE_SPS {
                    let info = parse_sps(&payload[1..]);
                    parsed.width = info.width;
                    parsed.height = info.height;
                }
                Ok(parsed)
            }
            NALU_TYPE_STAP_A => Err(Error::ErrStapANotSupported),
            NALU_TYPE_FU_A => self.parse_fu_a(payload, marker),
            t => Err(Error::ErrNaluTypeIsNotHandled(t)),
        }
    }

    fn parse_fu_a(&mut self, payload: &Bytes, marker: bool) -> Result<H264Payload> {
        if payload.len() <= FU_A_HEADER_SIZE {
            return Err(Error::ErrShortPayload);
        }

        let fu_header = payload[1];
        let start = fu_header & FU_START_MASK != 0;
        let end = fu_header & FU_END_MASK != 0;
        let nalu_type = fu_header & NALU_TYPE_MASK;

        let data = if start {
            // rebuild the NAL header the payloader stripped
            let mut buf = BytesMut::with_capacity(payload.len() - FU_A_HEADER_SIZE + 1);
            buf.put_u8((payload[0] & 0xe0) | nalu_type);
            buf.put_slice(&payload[FU_A_HEADER_SIZE..]);
            buf.freeze()
        } else {
            payload.slice(FU_A_HEADER_SIZE..)
        };

        Ok(H264Payload {
            frame_type: frame_type_of(nalu_type),
            frame_begin: start && slice_starts_frame(nalu_type, data.get(1).copied()),
            frame_end: end && marker,
            nalu_type,
            data,
            ..Default::default()
        })
    }
}

impl Depacketizer for H264Depacketizer {
    fn depacketize(&mut self, b: &Bytes) -> Result<Bytes> {
        Ok(self.parse(b, false)?.data)
    }

    fn is_partition_head(&self, payload: &Bytes) -> bool {
        if payload.len() < 2 {
            return false;
        }
        if payload[0] & NALU_TYPE_MASK == NALU_TYPE_FU_A {
            payload[1] & FU_START_MASK != 0
        } else {
            true
        }
    }

    fn is_partition_tail(&self, marker: bool, payload: &Bytes) -> bool {
        if payload.len() >= 2 && payload[0] & NALU_TYPE_MASK == NALU_TYPE_FU_A {
            marker && payload[1] & FU_END_MASK != 0
        } else {
            marker
        }
    }
}
