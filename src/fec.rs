//! RED encapsulation, XOR forward error correction over a window of media
//! packets, and the bitrate accounting for both.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Which packet-mask family the FEC generator draws from.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FecMaskType {
    /// Spreads protection evenly over the window, best against random loss.
    #[default]
    Random,
    /// Concentrates protection on consecutive packets for bursty loss.
    Bursty,
}

/// Protection settings applied per frame. Separate instances exist for
/// delta and key frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FecProtectionParams {
    /// Protection factor in 1/255 units of the media packet count.
    pub fec_rate: u8,
    /// Number of complete frames gathered before FEC is generated.
    pub max_fec_frames: u8,
    pub mask_type: FecMaskType,
}

impl Default for FecProtectionParams {
    fn default() -> Self {
        Self {
            fec_rate: 0,
            max_fec_frames: 1,
            mask_type: FecMaskType::Random,
        }
    }
}

/// RFC 2198 RED wrapping with a single block: a 1-byte RED header naming
/// the carried payload type, between the RTP header and the payload.
#[derive(Debug)]
pub struct RedPacket;

impl RedPacket {
    /// Re-encapsulates `packet` (a full RTP packet) as RED. The RTP header
    /// is copied with the payload type rewritten to `red_payload_type`,
    /// keeping the marker bit; the RED header carries the original payload
    /// type.
    pub fn build(
        packet: &[u8],
        payload_len: usize,
        header_len: usize,
        red_payload_type: u8,
    ) -> Result<Bytes> {
        if packet.len() < header_len + payload_len || header_len < 12 {
            return Err(Error::ErrShortPacket);
        }

        let mut out = BytesMut::with_capacity(header_len + 1 + payload_len);
        out.put_slice(&packet[..header_len]);
        out[1] = (out[1] & 0x80) | (red_payload_type & 0x7f);
        out.put_u8(packet[1] & 0x7f);
        out.put_slice(&packet[header_len..header_len + payload_len]);
        Ok(out.freeze())
    }
}

#[derive(Debug, Clone)]
struct ProtectedPacket {
    /// Full packet bytes, RTP header included.
    data: Bytes,
    header_len: usize,
}

impl ProtectedPacket {
    fn seq(&self) -> u16 {
        ((self.data[2] as u16) << 8) | self.data[3] as u16
    }

    fn payload(&self) -> &[u8] {
        &self.data[self.header_len..]
    }
}

/// Accumulates the media packets of up to `max_fec_frames` frames and
/// produces RFC 5109 XOR parity packets over that window. FEC packets are
/// handed out RED-wrapped and consume sequence numbers from the same
/// series as the media.
#[derive(Debug, Default)]
pub struct FecProducer {
    params: FecProtectionParams,
    media_packets: Vec<ProtectedPacket>,
    complete_frames: u8,
    fec_payloads: VecDeque<Bytes>,
    /// RTP header of the first packet of the last protected window, used
    /// as the template for outgoing FEC packets.
    header_template: Option<Bytes>,
}

/// FEC header (10 bytes) plus one level header (4 bytes).
const FEC_HEADER_SIZE: usize = 14;

impl FecProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the protection parameters for the frame being sent. Takes
    /// effect for the window being accumulated.
    pub fn set_fec_parameters(&mut self, params: FecProtectionParams) {
        self.params = params;
    }

    /// Adds one media packet to the protected window. When `marker` closes
    /// the frame and the window is full, parity payloads are generated.
    pub fn add_rtp_packet(
        &mut self,
        packet: &[u8],
        payload_len: usize,
        header_len: usize,
        marker: bool,
    ) -> Result<()> {
        if packet.len() < header_len + payload_len || header_len < 12 {
            return Err(Error::ErrShortPacket);
        }
        self.media_packets.push(ProtectedPacket {
            data: Bytes::copy_from_slice(&packet[..header_len + payload_len]),
            header_len,
        });
        if marker {
            self.complete_frames += 1;
            if self.complete_frames >= self.params.max_fec_frames.max(1) {
                self.generate_fec();
            }
        }
        Ok(())
    }

    pub fn fec_available(&self) -> bool {
        !self.fec_payloads.is_empty()
    }

    pub fn num_available_fec_packets(&self) -> usize {
        self.fec_payloads.len()
    }

    /// Pops one generated parity payload and wraps it into a RED packet
    /// carrying `fec_payload_type`, using the RTP header template of the
    /// protected window and the caller-provided sequence number.
    pub fn get_fec_packet(
        &mut self,
        red_payload_type: u8,
        fec_payload_type: u8,
        sequence_number: u16,
        header_len: usize,
    ) -> Option<Bytes> {
        let template = self.header_template.clone()?;
        let parity = self.fec_payloads.pop_front()?;
        let header_len = header_len.min(template.len());

        let mut out = BytesMut::with_capacity(header_len + 1 + parity.len());
        out.put_slice(&template[..header_len]);
        // RED payload type, marker cleared
        out[1] = red_payload_type & 0x7f;
        out[2] = (sequence_number >> 8) as u8;
        out[3] = sequence_number as u8;
        out.put_u8(fec_payload_type & 0x7f);
        out.put_slice(&parity);
        if self.fec_payloads.is_empty() {
            self.header_template = None;
        }
        Some(out.freeze())
    }

    fn generate_fec(&mut self) {
        let num_media = self.media_packets.len();
        if num_media == 0 || self.params.fec_rate == 0 {
            self.reset_window();
            return;
        }
        // at least one parity packet whenever protection is on
        let num_fec = ((num_media * self.params.fec_rate as usize).div_ceil(255)).max(1);

        for k in 0..num_fec {
            let members: Vec<&ProtectedPacket> = self
                .media_packets
                .iter()
                .enumerate()
                .filter(|(i, _)| match self.params.mask_type {
                    // interleave packets across parity streams
                    FecMaskType::Random => i % num_fec == k,
                    // consecutive runs per parity stream
                    FecMaskType::Bursty => i / num_media.div_ceil(num_fec) == k,
                })
                .map(|(_, p)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            self.fec_payloads.push_back(Self::xor_parity(&members));
        }

        if let Some(first) = self.media_packets.first() {
            self.header_template = Some(first.data.slice(..first.header_len));
        }
        self.reset_window();
    }

    /// RFC 5109 parity: recovery fields for the first two header bytes,
    /// length, timestamp and payload, the sequence-number base, and a
    /// 16-bit mask of protected offsets.
    fn xor_parity(members: &[&ProtectedPacket]) -> Bytes {
        let sn_base = members[0].seq();
        let protection_len = members
            .iter()
            .map(|p| p.payload().len())
            .max()
            .unwrap_or(0);

        let mut header_recovery = [0u8; 2];
        let mut ts_recovery = [0u8; 4];
        let mut len_recovery = [0u8; 2];
        let mut mask: u16 = 0;
        let mut payload = vec![0u8; protection_len];

        for p in members {
            header_recovery[0] ^= p.data[0];
            header_recovery[1] ^= p.data[1];
            for i in 0..4 {
                ts_recovery[i] ^= p.data[4 + i];
            }
            let plen = p.payload().len() as u16;
            len_recovery[0] ^= (plen >> 8) as u8;
            len_recovery[1] ^= plen as u8;
            mask |= 1 << (15 - (p.seq().wrapping_sub(sn_base) & 0x0f));
            for (dst, src) in payload.iter_mut().zip(p.payload()) {
                *dst ^= src;
            }
        }

        let mut out = BytesMut::with_capacity(FEC_HEADER_SIZE + protection_len);
        // E=0, L=0 in the recovered-first-byte field's top bits
        out.put_u8(header_recovery[0] & 0x3f);
        out.put_u8(header_recovery[1]);
        out.put_u16(sn_base);
        out.put_slice(&ts_recovery);
        out.put_slice(&len_recovery);
        out.put_u16(protection_len as u16);
        out.put_u16(mask);
        out.put_slice(&payload);
        out.freeze()
    }

    fn reset_window(&mut self) {
        self.media_packets.clear();
        self.complete_frames = 0;
    }
}

/// Byte counter with a sliding one-second window, one instance each for
/// video payload and FEC overhead.
#[derive(Debug, Default)]
pub struct BitrateTracker {
    samples: VecDeque<(i64, usize)>,
}

const BITRATE_WINDOW_MS: i64 = 1000;

impl BitrateTracker {
    pub fn update(&mut self, bytes: usize, now_ms: i64) {
        self.samples.push_back((now_ms, bytes));
        self.prune(now_ms);
    }

    pub fn bitrate_bps(&mut self, now_ms: i64) -> u32 {
        self.prune(now_ms);
        let bytes: usize = self.samples.iter().map(|(_, b)| b).sum();
        ((bytes as u64 * 8 * 1000) / BITRATE_WINDOW_MS as u64) as u32
    }

    fn prune(&mut self, now_ms: i64) {
        while let Some(&(t, _)) = self.samples.front() {
            if now_ms - t > BITRATE_WINDOW_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_packet(pt: u8, seq: u16, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![
            0x80,
            pt | if marker { 0x80 } else { 0x00 },
            (seq >> 8) as u8,
            seq as u8,
            0x00,
            0x01,
            0xe2,
            0x40, // timestamp
            0x12,
            0x34,
            0x56,
            0x78, // ssrc
        ];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_red_packet_build() {
        let media = media_packet(96, 1000, true, &[0xaa, 0xbb, 0xcc]);
        let red = RedPacket::build(&media, 3, 12, 116).unwrap();
        assert_eq!(red.len(), media.len() + 1);
        // marker kept, payload type rewritten to RED
        assert_eq!(red[1], 0x80 | 116);
        // RED header names the carried payload type
        assert_eq!(red[12], 96);
        assert_eq!(&red[13..], &[0xaa, 0xbb, 0xcc]);
        let mut expected_header = media[..12].to_vec();
        expected_header[1] = 0x80 | 116;
        assert_eq!(&red[..12], &expected_header[..]);
    }

    #[test]
    fn test_red_packet_build_short_input() {
        assert_eq!(
            RedPacket::build(&[0x80, 0x60], 10, 12, 116),
            Err(Error::ErrShortPacket)
        );
    }

    #[test]
    fn test_no_fec_until_frame_complete() {
        let mut producer = FecProducer::new();
        producer.set_fec_parameters(FecProtectionParams {
            fec_rate: 255,
            max_fec_frames: 1,
            mask_type: FecMaskType::Random,
        });
        let p = media_packet(96, 100, false, &[0x01; 20]);
        producer.add_rtp_packet(&p, 20, 12, false).unwrap();
        assert!(!producer.fec_available());
        let p = media_packet(96, 101, true, &[0x02; 20]);
        producer.add_rtp_packet(&p, 20, 12, true).unwrap();
        assert!(producer.fec_available());
    }

    #[test]
    fn test_fec_rate_zero_produces_nothing() {
        let mut producer = FecProducer::new();
        producer.set_fec_parameters(FecProtectionParams::default());
        let p = media_packet(96, 100, true, &[0x01; 20]);
        producer.add_rtp_packet(&p, 20, 12, true).unwrap();
        assert!(!producer.fec_available());
    }

    #[test]
    fn test_fec_packet_is_red_wrapped_with_given_sequence() {
        let mut producer = FecProducer::new();
        producer.set_fec_parameters(FecProtectionParams {
            fec_rate: 128,
            max_fec_frames: 1,
            mask_type: FecMaskType::Random,
        });
        for (i, marker) in [(0u16, false), (1, true)] {
            let p = media_packet(96, 500 + i, marker, &[i as u8; 30]);
            producer.add_rtp_packet(&p, 30, 12, marker).unwrap();
        }
        // ceil(2 * 128 / 255) == 1
        assert_eq!(producer.num_available_fec_packets(), 1);

        let fec = producer.get_fec_packet(116, 117, 502, 12).unwrap();
        assert_eq!(fec[1] & 0x7f, 116);
        assert_eq!(fec[1] & 0x80, 0);
        assert_eq!(((fec[2] as u16) << 8) | fec[3] as u16, 502);
        assert_eq!(fec[12], 117);
        // sequence-number base of the protected window
        assert_eq!(((fec[15] as u16) << 8) | fec[16] as u16, 500);
        assert!(producer.get_fec_packet(116, 117, 503, 12).is_none());
    }

    #[test]
    fn test_parity_recovers_lost_payload() {
        let mut producer = FecProducer::new();
        producer.set_fec_parameters(FecProtectionParams {
            fec_rate: 255,
            max_fec_frames: 1,
            mask_type: FecMaskType::Random,
        });
        let a = [0x11u8, 0x22, 0x33];
        let b = [0x44u8, 0x55, 0x66];
        let pa = media_packet(96, 10, false, &a);
        let pb = media_packet(96, 11, true, &b);
        producer.add_rtp_packet(&pa, 3, 12, false).unwrap();
        producer.add_rtp_packet(&pb, 3, 12, true).unwrap();

        // 255/255 yields one parity packet per media packet, interleaved
        assert_eq!(producer.num_available_fec_packets(), 2);
        let fec_a = producer.get_fec_packet(116, 117, 12, 12).unwrap();
        // parity payload for a single member equals the member's payload
        let parity = &fec_a[13 + FEC_HEADER_SIZE..];
        assert_eq!(parity, &a[..]);
    }

    #[test]
    fn test_bitrate_tracker_window() {
        let mut tracker = BitrateTracker::default();
        tracker.update(1000, 0);
        tracker.update(1000, 500);
        assert_eq!(tracker.bitrate_bps(500), 16_000);
        // first sample ages out of the 1s window
        assert_eq!(tracker.bitrate_bps(1200), 8_000);
        assert_eq!(tracker.bitrate_bps(2000), 0);
    }
}
