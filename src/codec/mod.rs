//! Codec-specific payload formats.

pub mod h264;
pub mod vp8;

use crate::codec::h264::depacketizer::H264Payload;
use crate::codec::vp8::Vp8Payload;

/// RTP video codec selected by payload-type registration.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum VideoCodecType {
    #[default]
    Generic,
    H264,
    Vp8,
}

impl VideoCodecType {
    /// Maps an SDP payload name onto a codec type; unknown names fall back
    /// to the generic packetization.
    pub fn from_payload_name(name: &str) -> VideoCodecType {
        let name = name.as_bytes();
        if name.len() >= 3 && name[..3].eq_ignore_ascii_case(b"vp8") {
            VideoCodecType::Vp8
        } else if name.len() >= 4 && name[..4].eq_ignore_ascii_case(b"h264") {
            VideoCodecType::H264
        } else {
            VideoCodecType::Generic
        }
    }
}

/// Frame classification derived from the parsed payload.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FrameType {
    /// Key frame (the original's kIFrame / kVideoFrameKey).
    Key,
    /// Delta frame (kPFrame / kVideoFrameDelta).
    #[default]
    Delta,
}

/// One depacketized video payload. The variant data holds zero-copy views
/// into the packet buffer it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoPayload {
    H264(H264Payload),
    Vp8(Vp8Payload),
}

impl VideoPayload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            VideoPayload::H264(h264) => h264.frame_type,
            VideoPayload::Vp8(vp8) => vp8.frame_type,
        }
    }

    pub fn data(&self) -> &bytes::Bytes {
        match self {
            VideoPayload::H264(h264) => &h264.data,
            VideoPayload::Vp8(vp8) => &vp8.data,
        }
    }
}
