//! H.264 RTP payload format, RFC 6184.

pub mod depacketizer;
pub mod packetizer;
pub mod sps;

/// Maximum RTP payload for one H.264 packet. Intentionally well below a
/// typical MTU to leave margin for RTP header, RED and FEC overhead.
pub const H264_MAX_MTU_SIZE: usize = 1147;

/// Annex-B start code preceding every NAL unit handled here.
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL header layout: F(1) | NRI(2) | Type(5).
pub const NALU_TYPE_MASK: u8 = 0x1f;
pub const NALU_NRI_MASK: u8 = 0x60;
pub const NALU_FORBIDDEN_MASK: u8 = 0x80;

/// Coded slice of a non-IDR picture.
pub const NALU_TYPE_NON_IDR: u8 = 1;
/// Coded slice of an IDR picture.
pub const NALU_TYPE_IDR: u8 = 5;
/// Sequence parameter set.
pub const NALU_TYPE_SPS: u8 = 7;
/// Picture parameter set.
pub const NALU_TYPE_PPS: u8 = 8;
/// Single-time aggregation packet A.
pub const NALU_TYPE_STAP_A: u8 = 24;
/// Fragmentation unit A.
pub const NALU_TYPE_FU_A: u8 = 28;

/// FU header layout: S(1) | E(1) | R(1) | Type(5).
pub const FU_START_MASK: u8 = 0x80;
pub const FU_END_MASK: u8 = 0x40;

/// FU indicator + FU header.
pub const FU_A_HEADER_SIZE: usize = 2;

/// The two NAL-header fields needed while building Single-NALU and FU-A
/// payload headers; recreated per NAL unit.
#[derive(Debug, Default, Copy, Clone)]
pub struct H264SliceHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
}

impl H264SliceHeader {
    pub fn parse(nal_header: u8) -> Self {
        Self {
            nal_ref_idc: (nal_header & NALU_NRI_MASK) >> 5,
            nal_unit_type: nal_header & NALU_TYPE_MASK,
        }
    }

    /// FU indicator byte: F=0, original NRI, type FU-A.
    pub fn fu_indicator(&self) -> u8 {
        (self.nal_ref_idc << 5) | NALU_TYPE_FU_A
    }

    /// FU header byte for a fragment at the given position.
    pub fn fu_header(&self, start: bool, end: bool) -> u8 {
        let mut b = self.nal_unit_type;
        if start {
            b |= FU_START_MASK;
        }
        if end {
            b |= FU_END_MASK;
        }
        b
    }
}
