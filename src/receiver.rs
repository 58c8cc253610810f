//! Video receive path: per-payload-type codec dispatch, payload parsing
//! and delivery to the depacketized-data callback.

use std::sync::Mutex;

use bytes::Bytes;

use crate::codec::h264::depacketizer::H264Depacketizer;
use crate::codec::h264::sps::{decode_sprop_parameter_sets, parse_sps};
use crate::codec::vp8::Vp8Depacketizer;
use crate::codec::{FrameType, VideoCodecType, VideoPayload};
use crate::error::{Error, Result};
use crate::header::Header;

const GENERIC_KEY_FRAME_BIT: u8 = 0x01;
const GENERIC_FIRST_PACKET_BIT: u8 = 0x02;

/// Parsed video metadata handed to the payload callback with each packet.
#[derive(Debug, Default, Clone)]
pub struct VideoRtpHeader {
    pub header: Header,
    pub frame_type: FrameType,
    /// Codec-specific descriptor, absent for empty packets.
    pub codec: Option<VideoPayload>,
    pub width: u16,
    pub height: u16,
    pub is_first_packet: bool,
}

/// Consumer of depacketized payload data. An empty `payload` signals a
/// packet that carried no media (padding only).
pub trait RtpData {
    fn on_received_payload_data(&mut self, payload: &[u8], header: &VideoRtpHeader) -> Result<()>;
}

/// Receiver-side control notifications.
pub trait RtpFeedback {
    fn on_initialize_decoder(
        &mut self,
        payload_type: u8,
        payload_name: &str,
        frequency: u32,
    ) -> Result<()>;
}

/// Callback sinks that swallow everything, for callers without a decoder.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullRtpData;

impl RtpData for NullRtpData {
    fn on_received_payload_data(&mut self, _: &[u8], _: &VideoRtpHeader) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct NullRtpFeedback;

impl RtpFeedback for NullRtpFeedback {
    fn on_initialize_decoder(&mut self, _: u8, _: &str, _: u32) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct ReceiverState {
    /// payload type -> codec, from `register_receive_payload`
    payload_types: Vec<(u8, VideoCodecType)>,
    /// Frame dimensions carried forward from the last SPS seen, either
    /// in-band or out-of-band via sprop-parameter-sets.
    width: u16,
    height: u16,
    packetization_mode: u8,
    profile_level_id: String,
}

/// Parses incoming video RTP payloads and hands the elementary-stream
/// fragments to the registered `RtpData` callback. Shared state sits
/// behind a `Mutex`; each packet snapshots what it needs and runs the
/// parse and callback dispatch without holding the lock.
pub struct RtpReceiverVideo<D: RtpData, F: RtpFeedback> {
    data_callback: D,
    feedback: F,
    state: Mutex<ReceiverState>,
}

impl<D: RtpData, F: RtpFeedback> RtpReceiverVideo<D, F> {
    pub fn new(data_callback: D, feedback: F) -> Self {
        Self {
            data_callback,
            feedback,
            state: Mutex::new(ReceiverState::default()),
        }
    }

    /// Maps `payload_type` to the codec named by `payload_name` and asks
    /// the decoder side to initialize for it.
    pub fn register_receive_payload(
        &mut self,
        payload_name: &str,
        payload_type: u8,
        frequency: u32,
    ) -> Result<()> {
        let codec = VideoCodecType::from_payload_name(payload_name);
        {
            let mut state = self.state.lock()?;
            state.payload_types.retain(|(pt, _)| *pt != payload_type);
            state.payload_types.push((payload_type, codec));
        }
        self.feedback
            .on_initialize_decoder(payload_type, payload_name, frequency)
    }

    /// Applies the H.264 SDP fmtp line: decodes `sprop_parameter_sets`
    /// and seeds the cached frame dimensions from the out-of-band SPS.
    pub fn register_h264_fmtp_parameters(
        &self,
        profile_level_id: &str,
        packetization_mode: u8,
        sprop_parameter_sets: &str,
    ) -> Result<()> {
        let (sps, _pps) = decode_sprop_parameter_sets(sprop_parameter_sets)?;
        let info = parse_sps(&sps[1..]);

        let mut state = self.state.lock()?;
        state.width = info.width;
        state.height = info.height;
        state.packetization_mode = packetization_mode;
        state.profile_level_id = profile_level_id.to_owned();
        Ok(())
    }

    /// Parses one media packet. A padding-stripped empty payload is
    /// delivered as an empty-frame callback; parse failures drop the
    /// packet by propagating the error.
    pub fn parse_rtp_packet(&mut self, header: &Header, payload: &Bytes) -> Result<()> {
        if payload.is_empty() {
            let video_header = VideoRtpHeader {
                header: header.clone(),
                ..Default::default()
            };
            return self.data_callback.on_received_payload_data(&[], &video_header);
        }

        let (codec, cached_width, cached_height) = {
            let state = self.state.lock()?;
            let codec = state
                .payload_types
                .iter()
                .find(|(pt, _)| *pt == header.payload_type)
                .map(|(_, c)| *c)
                .ok_or(Error::ErrCodecNotRegistered)?;
            (codec, state.width, state.height)
        };

        let (mut video_header, data) = match codec {
            VideoCodecType::H264 => {
                let parsed = H264Depacketizer.parse(payload, header.marker)?;
                let (width, height) = if parsed.width > 0 {
                    let mut state = self.state.lock()?;
                    state.width = parsed.width;
                    state.height = parsed.height;
                    (parsed.width, parsed.height)
                } else {
                    (cached_width, cached_height)
                };
                let data = parsed.data.clone();
                (
                    VideoRtpHeader {
                        frame_type: parsed.frame_type,
                        is_first_packet: parsed.frame_begin,
                        width,
                        height,
                        codec: Some(VideoPayload::H264(parsed)),
                        ..Default::default()
                    },
                    data,
                )
            }
            VideoCodecType::Vp8 => {
                let parsed = Vp8Depacketizer.parse(payload)?;
                let (width, height) = if parsed.width > 0 {
                    let mut state = self.state.lock()?;
                    state.width = parsed.width;
                    state.height = parsed.height;
                    (parsed.width, parsed.height)
                } else {
                    (cached_width, cached_height)
                };
                let data = parsed.data.clone();
                (
                    VideoRtpHeader {
                        frame_type: parsed.frame_type,
                        is_first_packet: parsed.beginning_of_partition,
                        width,
                        height,
                        codec: Some(VideoPayload::Vp8(parsed)),
                        ..Default::default()
                    },
                    data,
                )
            }
            VideoCodecType::Generic => {
                let generic = payload[0];
                let frame_type = if generic & GENERIC_KEY_FRAME_BIT != 0 {
                    FrameType::Key
                } else {
                    FrameType::Delta
                };
                (
                    VideoRtpHeader {
                        frame_type,
                        is_first_packet: generic & GENERIC_FIRST_PACKET_BIT != 0,
                        width: cached_width,
                        height: cached_height,
                        ..Default::default()
                    },
                    payload.slice(1..),
                )
            }
        };
        video_header.header = header.clone();

        self.data_callback
            .on_received_payload_data(&data, &video_header)
    }
}
