//! H.264 payloader: Annex-B access units in, Single-NALU and FU-A
//! RTP payloads out.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;

use super::{
    H264SliceHeader, ANNEX_B_START_CODE, FU_A_HEADER_SIZE, NALU_TYPE_MASK, NALU_TYPE_PPS,
    NALU_TYPE_SPS,
};
use crate::error::{Error, Result};
use crate::packetizer::Payloader;

/// RFC 6184 packetization modes. Mode selection is not negotiated via SDP;
/// `NonInterleaved` is the hardcoded default and `SingleNalu` exists only
/// for receivers that cannot take fragmentation units.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum PacketizationMode {
    /// Mode 0: one slice per NAL unit, no FU-A. The encoder is expected to
    /// keep slices under the MTU; oversized NAL units are an error.
    SingleNalu,
    /// Mode 1: Single-NALU for small NAL units, FU-A for large ones.
    #[default]
    NonInterleaved,
}

/// Splits Annex-B encoded access units into RTP payloads.
#[derive(Debug, Default, Copy, Clone)]
pub struct H264Payloader {
    pub mode: PacketizationMode,
}

impl H264Payloader {
    /// Iterates NAL units delimited by 4-byte `00 00 00 01` start codes.
    fn each_nalu(access_unit: &Bytes, mut f: impl FnMut(Bytes)) {
        let finder = memmem::Finder::new(&ANNEX_B_START_CODE);
        let mut start = match finder.find(access_unit) {
            Some(i) => i + ANNEX_B_START_CODE.len(),
            None => return,
        };
        while start < access_unit.len() {
            let end = match finder.find(&access_unit[start..]) {
                Some(i) => start + i,
                None => access_unit.len(),
            };
            if end > start {
                f(access_unit.slice(start..end));
            }
            start = end + ANNEX_B_START_CODE.len();
        }
    }

    fn fragment(nalu: &Bytes, mtu: usize, payloads: &mut Vec<Bytes>) {
        let header = H264SliceHeader::parse(nalu[0]);
        let max_chunk = mtu - FU_A_HEADER_SIZE;
        let data = &nalu[1..];

        let mut offset = 0;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(max_chunk);
            let start = offset == 0;
            let end = offset + chunk == data.len();

            let mut out = BytesMut::with_capacity(FU_A_HEADER_SIZE + chunk);
            out.put_u8(header.fu_indicator());
            out.put_u8(header.fu_header(start, end));
            out.put_slice(&data[offset..offset + chunk]);
            payloads.push(out.freeze());

            offset += chunk;
        }
    }
}

impl Payloader for H264Payloader {
    /// Emits one payload per parameter-set or small NAL unit and a run of
    /// FU-A fragments for each NAL unit over the budget. Start codes are
    /// never transmitted. The marker bit on the final payload is the
    /// sender's responsibility.
    fn payload(&mut self, mtu: usize, access_unit: &Bytes) -> Result<Vec<Bytes>> {
        if access_unit.is_empty() {
            return Err(Error::ErrEmptyFrame);
        }
        if mtu <= FU_A_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }

        let mut payloads = vec![];
        let mut oversized = None;
        Self::each_nalu(access_unit, |nalu| {
            let nalu_type = nalu[0] & NALU_TYPE_MASK;
            if nalu.len() <= mtu
                || nalu_type == NALU_TYPE_SPS
                || nalu_type == NALU_TYPE_PPS
                || self.mode == PacketizationMode::SingleNalu
            {
                if nalu.len() > mtu {
                    oversized = Some(nalu_type);
                }
                payloads.push(nalu);
            } else {
                Self::fragment(&nalu, mtu, &mut payloads);
            }
        });

        if let Some(t) = oversized {
            log::warn!("single NALU of type {t} exceeds the payload budget");
            return Err(Error::ErrShortPacket);
        }
        if payloads.is_empty() {
            return Err(Error::ErrEmptyFrame);
        }
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::{
        FU_END_MASK, FU_START_MASK, H264_MAX_MTU_SIZE, NALU_NRI_MASK, NALU_TYPE_FU_A,
        NALU_TYPE_IDR,
    };

    fn annex_b(nalus: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for nalu in nalus {
            buf.put_slice(&ANNEX_B_START_CODE);
            buf.put_slice(nalu);
        }
        buf.freeze()
    }

    #[test]
    fn test_empty_frame_errors() {
        let mut p = H264Payloader::default();
        assert_eq!(
            p.payload(H264_MAX_MTU_SIZE, &Bytes::new()),
            Err(Error::ErrEmptyFrame)
        );
        // a frame with no start code carries no NAL units
        assert_eq!(
            p.payload(H264_MAX_MTU_SIZE, &Bytes::from_static(&[0x65, 0x01])),
            Err(Error::ErrEmptyFrame)
        );
    }

    #[test]
    fn test_single_nalu_round_trip() {
        let nalu = [0x65, 0x01, 0x02, 0x03];
        let mut p = H264Payloader::default();
        let payloads = p.payload(H264_MAX_MTU_SIZE, &annex_b(&[&nalu])).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], &nalu[..]);
    }

    #[test]
    fn test_sps_pps_emitted_before_slice() {
        let sps = [0x67, 0x42, 0x00, 0x1f];
        let pps = [0x68, 0xce, 0x3c, 0x80];
        let idr = [0x65, 0x88, 0x84, 0x00];
        let mut p = H264Payloader::default();
        let payloads = p
            .payload(H264_MAX_MTU_SIZE, &annex_b(&[&sps, &pps, &idr]))
            .unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(&payloads[0][..], &sps[..]);
        assert_eq!(&payloads[1][..], &pps[..]);
        assert_eq!(&payloads[2][..], &idr[..]);
    }

    #[test]
    fn test_fu_a_fragmentation() {
        // 1-byte NAL header plus 2500 data bytes forces three fragments
        let mut nalu = vec![0x65u8];
        nalu.extend((0..2500).map(|i| (i % 251) as u8));
        let mut p = H264Payloader::default();
        let payloads = p.payload(H264_MAX_MTU_SIZE, &annex_b(&[&nalu])).unwrap();
        assert_eq!(payloads.len(), 3);

        let mut reassembled = vec![nalu[0]];
        for (i, payload) in payloads.iter().enumerate() {
            assert!(payload.len() <= H264_MAX_MTU_SIZE);
            let indicator = payload[0];
            let fu_header = payload[1];
            assert_eq!(indicator & NALU_TYPE_MASK, NALU_TYPE_FU_A);
            assert_eq!(indicator & NALU_NRI_MASK, nalu[0] & NALU_NRI_MASK);
            assert_eq!(fu_header & NALU_TYPE_MASK, NALU_TYPE_IDR);
            assert_eq!(fu_header & FU_START_MASK != 0, i == 0);
            assert_eq!(fu_header & FU_END_MASK != 0, i == payloads.len() - 1);
            reassembled.extend_from_slice(&payload[2..]);
        }
        // concatenated fragment data plus the NAL header equals the input
        assert_eq!(reassembled, nalu);
    }

    #[test]
    fn test_fu_a_chunk_size_is_mtu_minus_two() {
        let mut nalu = vec![0x41u8];
        nalu.extend(std::iter::repeat(0xaa).take(3 * (H264_MAX_MTU_SIZE - 2)));
        let mut p = H264Payloader::default();
        let payloads = p.payload(H264_MAX_MTU_SIZE, &annex_b(&[&nalu])).unwrap();
        assert_eq!(payloads.len(), 3);
        for payload in &payloads {
            assert_eq!(payload.len(), H264_MAX_MTU_SIZE);
        }
    }

    #[test]
    fn test_single_nalu_mode_rejects_oversized() {
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0x00).take(H264_MAX_MTU_SIZE + 100));
        let mut p = H264Payloader {
            mode: PacketizationMode::SingleNalu,
        };
        assert_eq!(
            p.payload(H264_MAX_MTU_SIZE, &annex_b(&[&nalu])),
            Err(Error::ErrShortPacket)
        );
    }
}
