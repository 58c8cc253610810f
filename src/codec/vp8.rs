//! VP8 RTP payload format, RFC 7741.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::FrameType;
use crate::error::{Error, Result};
use crate::packetizer::{Depacketizer, Payloader};

const X_BIT: u8 = 0x80;
const N_BIT: u8 = 0x20;
const S_BIT: u8 = 0x10;
const PART_ID_MASK: u8 = 0x0f;

const I_BIT: u8 = 0x80;
const L_BIT: u8 = 0x40;
const T_BIT: u8 = 0x20;
const K_BIT: u8 = 0x10;

/// M bit of the first PictureID byte extends it to 15 bits.
const PICTURE_ID_EXTENDED: u8 = 0x80;

/// One parsed VP8 payload. `data` is a zero-copy view of the VP8 frame
/// data after the payload descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Vp8Payload {
    pub frame_type: FrameType,
    pub data: Bytes,
    pub partition_id: u8,
    /// S bit: first packet of the partition.
    pub beginning_of_partition: bool,
    /// N bit: frame is discardable without harming the reference chain.
    pub non_reference: bool,
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub temporal_idx: Option<u8>,
    pub layer_sync: bool,
    pub key_idx: Option<u8>,
    /// Frame dimensions from the uncompressed data chunk, key frames only.
    pub width: u16,
    pub height: u16,
}

/// Stateless parser for the VP8 payload descriptor and, on key frames,
/// the start of the uncompressed data chunk.
#[derive(Debug, Default, Copy, Clone)]
pub struct Vp8Depacketizer;

impl Vp8Depacketizer {
    pub fn parse(&mut self, payload: &Bytes) -> Result<Vp8Payload> {
        if payload.is_empty() {
            return Err(Error::ErrShortPayload);
        }

        let b0 = payload[0];
        let mut parsed = Vp8Payload {
            partition_id: b0 & PART_ID_MASK,
            beginning_of_partition: b0 & S_BIT != 0,
            non_reference: b0 & N_BIT != 0,
            ..Default::default()
        };
        if parsed.partition_id > 8 {
            return Err(Error::ErrVp8PartitionIdOutOfRange);
        }

        let mut offset = 1;
        if b0 & X_BIT != 0 {
            let ext = *payload.get(offset).ok_or(Error::ErrShortPayload)?;
            offset += 1;

            if ext & I_BIT != 0 {
                let b = *payload.get(offset).ok_or(Error::ErrShortPayload)?;
                offset += 1;
                if b & PICTURE_ID_EXTENDED != 0 {
                    let lo = *payload.get(offset).ok_or(Error::ErrShortPayload)?;
                    offset += 1;
                    parsed.picture_id = Some((((b & 0x7f) as u16) << 8) | lo as u16);
                } else {
                    parsed.picture_id = Some(b as u16);
                }
            }
            if ext & L_BIT != 0 {
                parsed.tl0_pic_idx = Some(*payload.get(offset).ok_or(Error::ErrShortPayload)?);
                offset += 1;
            }
            if ext & (T_BIT | K_BIT) != 0 {
                let b = *payload.get(offset).ok_or(Error::ErrShortPayload)?;
                offset += 1;
                if ext & T_BIT != 0 {
                    parsed.temporal_idx = Some((b >> 6) & 0x3);
                    parsed.layer_sync = b & 0x20 != 0;
                }
                if ext & K_BIT != 0 {
                    parsed.key_idx = Some(b & 0x1f);
                }
            }
        }

        if offset >= payload.len() {
            return Err(Error::ErrShortPayload);
        }
        parsed.data = payload.slice(offset..);

        // P bit of the VP8 payload header, valid only at partition start
        let key = parsed.beginning_of_partition
            && parsed.partition_id == 0
            && parsed.data[0] & 0x01 == 0;
        parsed.frame_type = if key { FrameType::Key } else { FrameType::Delta };

        if key {
            if parsed.data.len() < 10 {
                return Err(Error::ErrVp8FrameSizeUnavailable);
            }
            parsed.width = ((parsed.data[7] as u16) << 8 | parsed.data[6] as u16) & 0x3fff;
            parsed.height = ((parsed.data[9] as u16) << 8 | parsed.data[8] as u16) & 0x3fff;
        }

        Ok(parsed)
    }
}

impl Depacketizer for Vp8Depacketizer {
    fn depacketize(&mut self, b: &Bytes) -> Result<Bytes> {
        Ok(self.parse(b)?.data)
    }

    fn is_partition_head(&self, payload: &Bytes) -> bool {
        !payload.is_empty() && payload[0] & S_BIT != 0
    }

    fn is_partition_tail(&self, marker: bool, _payload: &Bytes) -> bool {
        marker
    }
}

/// Per-frame codec info driving the payload descriptor the payloader
/// writes.
#[derive(Debug, Default, Copy, Clone)]
pub struct Vp8Payloader {
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub temporal_idx: Option<u8>,
    pub layer_sync: bool,
    pub key_idx: Option<u8>,
    pub non_reference: bool,
}

impl Vp8Payloader {
    fn descriptor_size(&self) -> usize {
        let mut size = 1;
        if self.has_extension() {
            size += 1;
            if let Some(pid) = self.picture_id {
                size += if pid >= 0x80 { 2 } else { 1 };
            }
            if self.tl0_pic_idx.is_some() {
                size += 1;
            }
            if self.temporal_idx.is_some() || self.key_idx.is_some() {
                size += 1;
            }
        }
        size
    }

    fn has_extension(&self) -> bool {
        self.picture_id.is_some()
            || self.tl0_pic_idx.is_some()
            || self.temporal_idx.is_some()
            || self.key_idx.is_some()
    }

    fn write_descriptor(&self, out: &mut BytesMut, first: bool) {
        let mut b0 = 0u8;
        if self.has_extension() {
            b0 |= X_BIT;
        }
        if self.non_reference {
            b0 |= N_BIT;
        }
        if first {
            // S bit plus partition id 0; one partition per frame
            b0 |= S_BIT;
        }
        out.put_u8(b0);

        if !self.has_extension() {
            return;
        }
        let mut ext = 0u8;
        if self.picture_id.is_some() {
            ext |= I_BIT;
        }
        if self.tl0_pic_idx.is_some() {
            ext |= L_BIT;
        }
        if self.temporal_idx.is_some() {
            ext |= T_BIT;
        }
        if self.key_idx.is_some() {
            ext |= K_BIT;
        }
        out.put_u8(ext);

        if let Some(pid) = self.picture_id {
            if pid >= 0x80 {
                out.put_u8(PICTURE_ID_EXTENDED | ((pid >> 8) as u8 & 0x7f));
                out.put_u8(pid as u8);
            } else {
                out.put_u8(pid as u8 & 0x7f);
            }
        }
        if let Some(tl0) = self.tl0_pic_idx {
            out.put_u8(tl0);
        }
        if self.temporal_idx.is_some() || self.key_idx.is_some() {
            let mut b = 0u8;
            if let Some(tid) = self.temporal_idx {
                b |= (tid & 0x3) << 6;
                if self.layer_sync {
                    b |= 0x20;
                }
            }
            if let Some(kidx) = self.key_idx {
                b |= kidx & 0x1f;
            }
            out.put_u8(b);
        }
    }
}

impl Payloader for Vp8Payloader {
    /// Splits the frame into roughly equal-size packets instead of filling
    /// each packet to the MTU, so loss hits partitions evenly.
    fn payload(&mut self, mtu: usize, frame: &Bytes) -> Result<Vec<Bytes>> {
        if frame.is_empty() {
            return Err(Error::ErrEmptyFrame);
        }
        let descriptor_size = self.descriptor_size();
        if mtu <= descriptor_size {
            return Err(Error::ErrShortPacket);
        }

        let max_data = mtu - descriptor_size;
        let num_packets = frame.len().div_ceil(max_data);
        let per_packet = frame.len().div_ceil(num_packets);

        let mut payloads = Vec::with_capacity(num_packets);
        let mut offset = 0;
        while offset < frame.len() {
            let chunk = per_packet.min(frame.len() - offset);
            let mut out = BytesMut::with_capacity(descriptor_size + chunk);
            self.write_descriptor(&mut out, offset == 0);
            out.put_slice(&frame[offset..offset + chunk]);
            payloads.push(out.freeze());
            offset += chunk;
        }
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal key-frame data chunk: P bit 0, frame size at bytes 6..10.
    fn key_frame_data(width: u16, height: u16) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x00, 0x9d, 0x01, 0x2a];
        v.extend_from_slice(&width.to_le_bytes());
        v.extend_from_slice(&height.to_le_bytes());
        v.extend_from_slice(&[0xde, 0xad]);
        v
    }

    #[test]
    fn test_empty_and_truncated_payloads() {
        let mut d = Vp8Depacketizer;
        assert_eq!(d.parse(&Bytes::new()), Err(Error::ErrShortPayload));
        // X set but extension byte missing
        assert_eq!(
            d.parse(&Bytes::from_static(&[0x80])),
            Err(Error::ErrShortPayload)
        );
        // descriptor only, no frame data
        assert_eq!(
            d.parse(&Bytes::from_static(&[0x90, 0x80, 0x01])),
            Err(Error::ErrShortPayload)
        );
    }

    #[test]
    fn test_partition_id_out_of_range() {
        let mut d = Vp8Depacketizer;
        assert_eq!(
            d.parse(&Bytes::from_static(&[0x09, 0x00])),
            Err(Error::ErrVp8PartitionIdOutOfRange)
        );
    }

    #[test]
    fn test_key_frame_with_dimensions() {
        let mut payload = vec![0x10]; // S=1, PartID=0
        payload.extend(key_frame_data(640, 480));
        let mut d = Vp8Depacketizer;
        let parsed = d.parse(&Bytes::from(payload)).unwrap();
        assert_eq!(parsed.frame_type, FrameType::Key);
        assert!(parsed.beginning_of_partition);
        assert_eq!((parsed.width, parsed.height), (640, 480));
    }

    #[test]
    fn test_key_frame_too_short_for_size() {
        let payload = Bytes::from_static(&[0x10, 0x00, 0x00, 0x00]);
        let mut d = Vp8Depacketizer;
        assert_eq!(
            d.parse(&payload),
            Err(Error::ErrVp8FrameSizeUnavailable)
        );
    }

    #[test]
    fn test_delta_frame_via_p_bit() {
        let payload = Bytes::from_static(&[0x10, 0x01, 0x02]);
        let mut d = Vp8Depacketizer;
        let parsed = d.parse(&payload).unwrap();
        assert_eq!(parsed.frame_type, FrameType::Delta);
        assert_eq!(parsed.width, 0);
    }

    #[test]
    fn test_descriptor_round_trip_short_picture_id() {
        let mut p = Vp8Payloader {
            picture_id: Some(0x11),
            ..Default::default()
        };
        let frame = Bytes::from(key_frame_data(320, 240));
        let payloads = p.payload(1200, &frame).unwrap();
        assert_eq!(payloads.len(), 1);

        let mut d = Vp8Depacketizer;
        let parsed = d.parse(&payloads[0]).unwrap();
        assert_eq!(parsed.picture_id, Some(0x11));
        assert_eq!(parsed.data, frame);
        assert_eq!(parsed.frame_type, FrameType::Key);
    }

    #[test]
    fn test_descriptor_round_trip_extended_fields() {
        let mut p = Vp8Payloader {
            picture_id: Some(0x1234),
            tl0_pic_idx: Some(7),
            temporal_idx: Some(2),
            layer_sync: true,
            key_idx: Some(3),
            non_reference: true,
        };
        let frame = Bytes::from(vec![0x01; 50]);
        let payloads = p.payload(1200, &frame).unwrap();
        assert_eq!(payloads.len(), 1);

        let mut d = Vp8Depacketizer;
        let parsed = d.parse(&payloads[0]).unwrap();
        assert_eq!(parsed.picture_id, Some(0x1234));
        assert_eq!(parsed.tl0_pic_idx, Some(7));
        assert_eq!(parsed.temporal_idx, Some(2));
        assert!(parsed.layer_sync);
        assert_eq!(parsed.key_idx, Some(3));
        assert!(parsed.non_reference);
        assert_eq!(parsed.frame_type, FrameType::Delta);
    }

    #[test]
    fn test_equal_size_split() {
        let frame = Bytes::from(vec![0x01; 1000]);
        let mut p = Vp8Payloader::default();
        let payloads = p.payload(600, &frame).unwrap();
        assert_eq!(payloads.len(), 2);
        // 1000 data bytes split 500/500 rather than 599/401
        assert_eq!(payloads[0].len(), 501);
        assert_eq!(payloads[1].len(), 501);
        assert_eq!(payloads[0][0] & S_BIT, S_BIT);
        assert_eq!(payloads[1][0] & S_BIT, 0);
    }
}
