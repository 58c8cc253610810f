//! Video send path: splits encoded frames into RTP packets through the
//! codec payloaders and feeds them, optionally RED/FEC protected, to the
//! network transport.

use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::h264::packetizer::{H264Payloader, PacketizationMode};
use crate::codec::h264::H264_MAX_MTU_SIZE;
use crate::codec::vp8::Vp8Payloader;
use crate::codec::{FrameType, VideoCodecType};
use crate::error::{Error, Result};
use crate::fec::{BitrateTracker, FecProducer, FecProtectionParams, RedPacket};
use crate::header::Header;
use crate::packetizer::Payloader;
use crate::sequence::Sequencer;

/// Generic video payload header bits (1-byte header before the fragment).
const GENERIC_KEY_FRAME_BIT: u8 = 0x01;
const GENERIC_FIRST_PACKET_BIT: u8 = 0x02;

/// Default payload budget for codecs without their own cap.
const DEFAULT_MAX_PAYLOAD_LEN: usize = 1200;

/// Full Intra Request, RFC 2032.
const FIR_PAYLOAD_TYPE: u8 = 192;

/// How the paced sender should treat an outgoing packet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum PacketPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Retransmission eligibility recorded alongside a sent packet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum StorageType {
    #[default]
    DontStore,
    DontRetransmit,
    AllowRetransmission,
}

/// Which packet classes may be retransmitted on NACK.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RetransmissionSettings(u8);

impl RetransmissionSettings {
    pub const OFF: Self = Self(0);
    pub const BASE_LAYER: Self = Self(0x1);
    pub const HIGHER_LAYERS: Self = Self(0x2);
    pub const FEC_PACKETS: Self = Self(0x4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RetransmissionSettings {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outgoing packet sink. Implemented by the transport, consumed here.
/// Send failures propagate to the `send_video` caller; there is no
/// internal retry.
pub trait NetworkSender {
    #[allow(clippy::too_many_arguments)]
    fn send_to_network(
        &mut self,
        packet: &[u8],
        payload_len: usize,
        header_len: usize,
        capture_time_ms: i64,
        storage: StorageType,
        priority: PacketPriority,
    ) -> Result<()>;
}

/// Codec-specific per-frame info supplied by the encoder.
#[derive(Debug, Clone)]
pub enum VideoTypeHeader {
    H264 { mode: PacketizationMode },
    Vp8(Vp8Payloader),
}

#[derive(Debug, Clone)]
struct SenderConfig {
    video_type: VideoCodecType,
    fec_enabled: bool,
    red_payload_type: u8,
    fec_payload_type: u8,
    delta_fec_params: FecProtectionParams,
    key_fec_params: FecProtectionParams,
    retransmission_settings: RetransmissionSettings,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            video_type: VideoCodecType::Generic,
            fec_enabled: false,
            red_payload_type: 0,
            fec_payload_type: 0,
            delta_fec_params: FecProtectionParams::default(),
            key_fec_params: FecProtectionParams::default(),
            retransmission_settings: RetransmissionSettings::BASE_LAYER
                | RetransmissionSettings::HIGHER_LAYERS,
        }
    }
}

/// Sends encoded video frames as RTP. Mutable configuration sits behind a
/// `Mutex` and is snapshotted at the start of each send, so the
/// packetization loop runs without holding the lock.
pub struct RtpSenderVideo<T: NetworkSender> {
    ssrc: u32,
    sequencer: Sequencer,
    transport: T,
    config: Mutex<SenderConfig>,
    fec_producer: Mutex<FecProducer>,
    video_bitrate: Mutex<BitrateTracker>,
    fec_overhead_bitrate: Mutex<BitrateTracker>,
}

impl<T: NetworkSender> RtpSenderVideo<T> {
    pub fn new(ssrc: u32, transport: T) -> Self {
        Self {
            ssrc,
            sequencer: Sequencer::new_random(),
            transport,
            config: Mutex::new(SenderConfig::default()),
            fec_producer: Mutex::new(FecProducer::new()),
            video_bitrate: Mutex::new(BitrateTracker::default()),
            fec_overhead_bitrate: Mutex::new(BitrateTracker::default()),
        }
    }

    pub fn with_sequencer(ssrc: u32, sequencer: Sequencer, transport: T) -> Self {
        Self {
            sequencer,
            ..Self::new(ssrc, transport)
        }
    }

    pub fn set_video_codec_type(&self, video_type: VideoCodecType) -> Result<()> {
        self.config.lock()?.video_type = video_type;
        Ok(())
    }

    /// Turns RED/FEC protection on or off and records the payload types
    /// used for the RED wrapper and the FEC packets.
    pub fn set_generic_fec_status(
        &self,
        enabled: bool,
        red_payload_type: u8,
        fec_payload_type: u8,
    ) -> Result<()> {
        let mut config = self.config.lock()?;
        config.fec_enabled = enabled;
        config.red_payload_type = red_payload_type;
        config.fec_payload_type = fec_payload_type;
        config.delta_fec_params = FecProtectionParams::default();
        config.key_fec_params = FecProtectionParams::default();
        Ok(())
    }

    pub fn generic_fec_status(&self) -> Result<(bool, u8, u8)> {
        let config = self.config.lock()?;
        Ok((
            config.fec_enabled,
            config.red_payload_type,
            config.fec_payload_type,
        ))
    }

    pub fn set_fec_parameters(
        &self,
        delta: FecProtectionParams,
        key: FecProtectionParams,
    ) -> Result<()> {
        let mut config = self.config.lock()?;
        config.delta_fec_params = delta;
        config.key_fec_params = key;
        Ok(())
    }

    pub fn set_retransmission_settings(&self, settings: RetransmissionSettings) -> Result<()> {
        self.config.lock()?.retransmission_settings = settings;
        Ok(())
    }

    pub fn video_bitrate_sent(&self, now_ms: i64) -> Result<u32> {
        Ok(self.video_bitrate.lock()?.bitrate_bps(now_ms))
    }

    pub fn fec_overhead_rate(&self, now_ms: i64) -> Result<u32> {
        Ok(self.fec_overhead_bitrate.lock()?.bitrate_bps(now_ms))
    }

    /// Packetizes and sends one encoded frame. The marker bit is set on
    /// exactly one packet, the last of the frame.
    pub fn send_video(
        &mut self,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &Bytes,
        type_header: Option<&VideoTypeHeader>,
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::ErrEmptyFrame);
        }

        let config = self.config.lock()?.clone();
        if config.fec_enabled {
            let params = match frame_type {
                FrameType::Key => config.key_fec_params,
                FrameType::Delta => config.delta_fec_params,
            };
            self.fec_producer.lock()?.set_fec_parameters(params);
        }

        match config.video_type {
            VideoCodecType::Generic => self.send_generic(
                &config,
                frame_type,
                payload_type,
                capture_timestamp,
                capture_time_ms,
                payload,
            ),
            VideoCodecType::H264 => self.send_h264(
                &config,
                payload_type,
                capture_timestamp,
                capture_time_ms,
                payload,
                type_header,
            ),
            VideoCodecType::Vp8 => self.send_vp8(
                &config,
                payload_type,
                capture_timestamp,
                capture_time_ms,
                payload,
                type_header,
            ),
        }
    }

    /// RFC 2032 Full Intra Request: an 8-byte packet of payload type 192
    /// asking the remote encoder for a key frame.
    pub fn send_rtp_intra_request(&mut self, capture_time_ms: i64) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(0x80);
        buf.put_u8(FIR_PAYLOAD_TYPE);
        buf.put_u16(1);
        buf.put_u32(self.ssrc);
        self.transport.send_to_network(
            &buf,
            0,
            buf.len(),
            capture_time_ms,
            StorageType::DontStore,
            PacketPriority::High,
        )
    }

    fn send_generic(
        &mut self,
        config: &SenderConfig,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &Bytes,
    ) -> Result<()> {
        // 1-byte generic header eats into every fragment's budget
        let max_data = DEFAULT_MAX_PAYLOAD_LEN - 1;
        let num_packets = payload.len().div_ceil(max_data);
        let per_packet = payload.len().div_ceil(num_packets);

        let mut generic_header = GENERIC_FIRST_PACKET_BIT;
        if frame_type == FrameType::Key {
            generic_header |= GENERIC_KEY_FRAME_BIT;
        }

        let mut offset = 0;
        while offset < payload.len() {
            let chunk = per_packet.min(payload.len() - offset);
            let last = offset + chunk == payload.len();

            let mut data = BytesMut::with_capacity(1 + chunk);
            data.put_u8(generic_header);
            data.put_slice(&payload[offset..offset + chunk]);
            generic_header &= !GENERIC_FIRST_PACKET_BIT;

            self.send_payload(
                config,
                payload_type,
                last,
                capture_timestamp,
                capture_time_ms,
                &data.freeze(),
                StorageType::AllowRetransmission,
                true,
            )?;
            offset += chunk;
        }
        Ok(())
    }

    fn send_h264(
        &mut self,
        config: &SenderConfig,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &Bytes,
        type_header: Option<&VideoTypeHeader>,
    ) -> Result<()> {
        let mode = match type_header {
            Some(VideoTypeHeader::H264 { mode }) => *mode,
            _ => PacketizationMode::default(),
        };
        let mut payloader = H264Payloader { mode };
        let payloads = payloader.payload(H264_MAX_MTU_SIZE, payload)?;

        let last_index = payloads.len() - 1;
        for (i, data) in payloads.iter().enumerate() {
            self.send_payload(
                config,
                payload_type,
                i == last_index,
                capture_timestamp,
                capture_time_ms,
                data,
                StorageType::AllowRetransmission,
                true,
            )?;
        }
        Ok(())
    }

    fn send_vp8(
        &mut self,
        config: &SenderConfig,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &Bytes,
        type_header: Option<&VideoTypeHeader>,
    ) -> Result<()> {
        let mut payloader = match type_header {
            Some(VideoTypeHeader::Vp8(info)) => *info,
            _ => Vp8Payloader::default(),
        };

        // layers above the base are retransmitted and FEC protected
        // separately from the base layer
        let temporal_idx = payloader.temporal_idx.unwrap_or(0);
        let storage = if temporal_idx == 0 {
            if config
                .retransmission_settings
                .contains(RetransmissionSettings::BASE_LAYER)
            {
                StorageType::AllowRetransmission
            } else {
                StorageType::DontRetransmit
            }
        } else if config
            .retransmission_settings
            .contains(RetransmissionSettings::HIGHER_LAYERS)
        {
            StorageType::AllowRetransmission
        } else {
            StorageType::DontRetransmit
        };
        let protect = temporal_idx < 1;

        let payloads = payloader.payload(DEFAULT_MAX_PAYLOAD_LEN, payload)?;
        let last_index = payloads.len() - 1;
        for (i, data) in payloads.iter().enumerate() {
            self.send_payload(
                config,
                payload_type,
                i == last_index,
                capture_timestamp,
                capture_time_ms,
                data,
                storage,
                protect,
            )?;
        }
        Ok(())
    }

    fn build_packet(
        &self,
        payload_type: u8,
        marker: bool,
        timestamp: u32,
        payload: &Bytes,
    ) -> (Bytes, usize) {
        let header = Header {
            version: 2,
            marker,
            payload_type,
            sequence_number: self.sequencer.next_sequence_number(),
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };
        let mut buf = BytesMut::with_capacity(12 + payload.len());
        let header_len = header.marshal_to(&mut buf);
        buf.put_slice(payload);
        (buf.freeze(), header_len)
    }

    /// Sends one RTP payload, RED/FEC wrapping it when protection is on,
    /// and drains any parity packets the producer has ready.
    #[allow(clippy::too_many_arguments)]
    fn send_payload(
        &mut self,
        config: &SenderConfig,
        payload_type: u8,
        marker: bool,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &Bytes,
        storage: StorageType,
        protect: bool,
    ) -> Result<()> {
        let (packet, header_len) = self.build_packet(payload_type, marker, capture_timestamp, payload);
        let payload_len = packet.len() - header_len;

        if !config.fec_enabled {
            self.transport.send_to_network(
                &packet,
                payload_len,
                header_len,
                capture_time_ms,
                storage,
                PacketPriority::Normal,
            )?;
            self.video_bitrate.lock()?.update(packet.len(), capture_time_ms);
            return Ok(());
        }

        let red = RedPacket::build(&packet, payload_len, header_len, config.red_payload_type)?;
        self.transport.send_to_network(
            &red,
            payload_len + 1,
            header_len,
            capture_time_ms,
            storage,
            PacketPriority::Normal,
        )?;
        self.video_bitrate.lock()?.update(red.len(), capture_time_ms);

        let fec_storage = if config
            .retransmission_settings
            .contains(RetransmissionSettings::FEC_PACKETS)
        {
            StorageType::AllowRetransmission
        } else {
            StorageType::DontRetransmit
        };

        let mut producer = self.fec_producer.lock()?;
        if protect {
            producer.add_rtp_packet(&packet, payload_len, header_len, marker)?;
        }
        while producer.fec_available() {
            let seq = self.sequencer.next_sequence_number();
            let Some(fec_packet) = producer.get_fec_packet(
                config.red_payload_type,
                config.fec_payload_type,
                seq,
                header_len,
            ) else {
                break;
            };
            self.transport.send_to_network(
                &fec_packet,
                fec_packet.len() - header_len,
                header_len,
                capture_time_ms,
                fec_storage,
                PacketPriority::Normal,
            )?;
            self.fec_overhead_bitrate
                .lock()?
                .update(fec_packet.len(), capture_time_ms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecMaskType;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug, Clone)]
    struct SentPacket {
        data: Vec<u8>,
        header_len: usize,
        storage: StorageType,
    }

    #[derive(Default, Clone)]
    struct MockTransport {
        sent: Arc<StdMutex<Vec<SentPacket>>>,
        fail: bool,
    }

    impl NetworkSender for MockTransport {
        fn send_to_network(
            &mut self,
            packet: &[u8],
            _payload_len: usize,
            header_len: usize,
            _capture_time_ms: i64,
            storage: StorageType,
            _priority: PacketPriority,
        ) -> Result<()> {
            if self.fail {
                return Err(Error::ErrSendFailed(-1));
            }
            self.sent.lock().unwrap().push(SentPacket {
                data: packet.to_vec(),
                header_len,
                storage,
            });
            Ok(())
        }
    }

    fn sender_with_mock(video_type: VideoCodecType) -> (RtpSenderVideo<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let sender =
            RtpSenderVideo::with_sequencer(0x1234_5678, Sequencer::new(100), transport.clone());
        sender.set_video_codec_type(video_type).unwrap();
        (sender, transport)
    }

    fn annex_b_idr(len: usize) -> Bytes {
        let mut v = vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88];
        v.extend((0..len).map(|i| (i % 251) as u8));
        Bytes::from(v)
    }

    #[test]
    fn test_empty_payload_is_an_error() {
        let (mut sender, _) = sender_with_mock(VideoCodecType::Generic);
        assert_eq!(
            sender.send_video(FrameType::Key, 96, 0, 0, &Bytes::new(), None),
            Err(Error::ErrEmptyFrame)
        );
    }

    #[test]
    fn test_marker_set_on_exactly_the_last_packet() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::H264);
        sender
            .send_video(FrameType::Key, 96, 3000, 0, &annex_b_idr(5000), None)
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent.len() > 1);
        let markers: Vec<bool> = sent.iter().map(|p| p.data[1] & 0x80 != 0).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(markers.last().unwrap());
    }

    #[test]
    fn test_sequence_numbers_are_consecutive_without_fec() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::H264);
        sender
            .send_video(FrameType::Key, 96, 3000, 0, &annex_b_idr(5000), None)
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        for (i, p) in sent.iter().enumerate() {
            let seq = ((p.data[2] as u16) << 8) | p.data[3] as u16;
            assert_eq!(seq, 100 + i as u16);
        }
    }

    #[test]
    fn test_generic_path_header_bits() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::Generic);
        let frame = Bytes::from(vec![0xab; 3000]);
        sender
            .send_video(FrameType::Key, 101, 0, 0, &frame, None)
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        for (i, p) in sent.iter().enumerate() {
            let generic = p.data[p.header_len];
            assert_eq!(generic & GENERIC_KEY_FRAME_BIT, GENERIC_KEY_FRAME_BIT);
            assert_eq!(generic & GENERIC_FIRST_PACKET_BIT != 0, i == 0);
        }
        let reassembled: Vec<u8> = sent
            .iter()
            .flat_map(|p| p.data[p.header_len + 1..].to_vec())
            .collect();
        assert_eq!(reassembled, frame.to_vec());
    }

    #[test]
    fn test_fec_enabled_sends_red_and_parity() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::Vp8);
        sender.set_generic_fec_status(true, 116, 117).unwrap();
        sender
            .set_fec_parameters(
                FecProtectionParams {
                    fec_rate: 255,
                    max_fec_frames: 1,
                    mask_type: FecMaskType::Random,
                },
                FecProtectionParams {
                    fec_rate: 255,
                    max_fec_frames: 1,
                    mask_type: FecMaskType::Random,
                },
            )
            .unwrap();

        let mut frame = vec![0x00u8; 40]; // P bit 0: key frame
        frame[6] = 0x40;
        frame[8] = 0xf0;
        sender
            .send_video(FrameType::Key, 96, 9000, 10, &Bytes::from(frame), None)
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        // one RED-wrapped media packet and one parity packet
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[1] & 0x7f, 116);
        assert_eq!(sent[0].data[sent[0].header_len], 96);
        assert_eq!(sent[1].data[1] & 0x7f, 116);
        assert_eq!(sent[1].data[sent[1].header_len], 117);
        // FEC consumes the next number in the media sequence
        let media_seq = ((sent[0].data[2] as u16) << 8) | sent[0].data[3] as u16;
        let fec_seq = ((sent[1].data[2] as u16) << 8) | sent[1].data[3] as u16;
        assert_eq!(media_seq, 100);
        assert_eq!(fec_seq, 101);
        assert_eq!(sent[1].storage, StorageType::DontRetransmit);

        assert!(sender.video_bitrate_sent(10).unwrap() > 0);
        assert!(sender.fec_overhead_rate(10).unwrap() > 0);
    }

    #[test]
    fn test_vp8_higher_layer_not_protected() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::Vp8);
        sender.set_generic_fec_status(true, 116, 117).unwrap();
        sender
            .set_fec_parameters(
                FecProtectionParams {
                    fec_rate: 255,
                    max_fec_frames: 1,
                    mask_type: FecMaskType::Random,
                },
                FecProtectionParams {
                    fec_rate: 255,
                    max_fec_frames: 1,
                    mask_type: FecMaskType::Random,
                },
            )
            .unwrap();
        sender
            .set_retransmission_settings(RetransmissionSettings::BASE_LAYER)
            .unwrap();

        let info = VideoTypeHeader::Vp8(Vp8Payloader {
            temporal_idx: Some(2),
            ..Default::default()
        });
        sender
            .send_video(
                FrameType::Delta,
                96,
                9000,
                10,
                &Bytes::from(vec![0x01u8; 40]),
                Some(&info),
            )
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        // RED-wrapped media only, no parity for a higher temporal layer
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].storage, StorageType::DontRetransmit);
    }

    #[test]
    fn test_send_failure_propagates() {
        let transport = MockTransport {
            fail: true,
            ..Default::default()
        };
        let mut sender = RtpSenderVideo::new(1, transport);
        sender.set_video_codec_type(VideoCodecType::Generic).unwrap();
        assert_eq!(
            sender.send_video(FrameType::Delta, 96, 0, 0, &Bytes::from(vec![1u8; 10]), None),
            Err(Error::ErrSendFailed(-1))
        );
    }

    #[test]
    fn test_send_rtp_intra_request() {
        let (mut sender, transport) = sender_with_mock(VideoCodecType::H264);
        sender.send_rtp_intra_request(0).unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), 8);
        assert_eq!(sent[0].data[1], FIR_PAYLOAD_TYPE);
        assert_eq!(
            &sent[0].data[4..8],
            &0x1234_5678u32.to_be_bytes()
        );
    }
}
