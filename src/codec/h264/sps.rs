//! Sequence parameter set parsing, enough to recover frame dimensions
//! from out-of-band `sprop-parameter-sets` or an in-band SPS NAL unit.

use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::Bytes;

use crate::error::{Error, Result};

/// MSB-first bit cursor over a byte slice. Built fresh for every parse;
/// reads past the end of the buffer yield zero bits, so a truncated or
/// corrupt SPS produces garbage dimensions rather than an error.
struct BitReader<'a> {
    buf: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    fn read_bit(&mut self) -> u32 {
        let bit = match self.buf.get(self.byte_offset) {
            Some(b) => ((b >> (7 - self.bit_offset)) & 0x1) as u32,
            None => 0,
        };
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
        bit
    }

    fn read_bits(&mut self, n: u8) -> u32 {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.read_bit();
        }
        v
    }

    /// Unsigned Exp-Golomb: count leading zero bits (capped at 32), then
    /// `(1 << zeros) - 1 + suffix`.
    fn read_exp_golomb(&mut self) -> u32 {
        let mut zeros = 0u8;
        while zeros < 32 && self.read_bit() == 0 {
            zeros += 1;
        }
        if zeros == 32 {
            return u32::MAX;
        }
        (1u32 << zeros) - 1 + self.read_bits(zeros)
    }

    /// Signed Exp-Golomb: even codes map to `-(v/2)`, odd to `(v+1)/2`.
    fn read_signed_exp_golomb(&mut self) -> i32 {
        let v = self.read_exp_golomb();
        if v % 2 == 0 {
            -((v / 2) as i32)
        } else {
            ((v / 2) + 1) as i32
        }
    }
}

/// Frame dimensions and identification read out of an SPS.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u16,
    pub height: u16,
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_signed_exp_golomb();
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
}

/// Parses the SPS RBSP (the bytes after the 1-byte NAL header) for frame
/// dimensions. Never fails; feeding it garbage yields garbage dimensions.
pub fn parse_sps(rbsp: &[u8]) -> SpsInfo {
    let mut r = BitReader::new(rbsp);

    let profile_idc = r.read_bits(8) as u8;
    let _constraint_flags = r.read_bits(8);
    let level_idc = r.read_bits(8) as u8;
    let _seq_parameter_set_id = r.read_exp_golomb();

    if matches!(profile_idc, 100 | 110 | 122 | 244) {
        let chroma_format_idc = r.read_exp_golomb();
        if chroma_format_idc == 3 {
            let _separate_colour_plane_flag = r.read_bit();
        }
        let _bit_depth_luma_minus8 = r.read_exp_golomb();
        let _bit_depth_chroma_minus8 = r.read_exp_golomb();
        let _qpprime_y_zero_transform_bypass_flag = r.read_bit();
        if r.read_bit() == 1 {
            // seq_scaling_matrix_present_flag
            for i in 0..8 {
                if r.read_bit() == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 });
                }
            }
        }
    }

    let _log2_max_frame_num_minus4 = r.read_exp_golomb();
    let pic_order_cnt_type = r.read_exp_golomb();
    if pic_order_cnt_type == 0 {
        let _log2_max_pic_order_cnt_lsb_minus4 = r.read_exp_golomb();
    } else if pic_order_cnt_type == 1 {
        let _delta_pic_order_always_zero_flag = r.read_bit();
        let _offset_for_non_ref_pic = r.read_signed_exp_golomb();
        let _offset_for_top_to_bottom_field = r.read_signed_exp_golomb();
        let cycle_len = r.read_exp_golomb().min(256);
        for _ in 0..cycle_len {
            let _offset_for_ref_frame = r.read_signed_exp_golomb();
        }
    }
    let _max_num_ref_frames = r.read_exp_golomb();
    let _gaps_in_frame_num_value_allowed_flag = r.read_bit();

    let pic_width_in_mbs_minus1 = r.read_exp_golomb();
    let pic_height_in_map_units_minus1 = r.read_exp_golomb();

    SpsInfo {
        profile_idc,
        level_idc,
        width: (pic_width_in_mbs_minus1.wrapping_add(1).wrapping_mul(16) & 0xffff) as u16,
        height: (pic_height_in_map_units_minus1.wrapping_add(1).wrapping_mul(16) & 0xffff) as u16,
    }
}

/// Splits an SDP `sprop-parameter-sets` value at the comma and Base64
/// decodes the SPS and PPS NAL units (each including its NAL header byte).
pub fn decode_sprop_parameter_sets(sprop: &str) -> Result<(Bytes, Bytes)> {
    let (sps_b64, pps_b64) = sprop
        .split_once(',')
        .ok_or(Error::ErrSpropParameterSetsMalformed)?;

    let sps = BASE64_STANDARD
        .decode(sps_b64)
        .map_err(|_| Error::ErrSpropParameterSetsBase64)?;
    let pps = BASE64_STANDARD
        .decode(pps_b64)
        .map_err(|_| Error::ErrSpropParameterSetsBase64)?;

    if sps.is_empty() || pps.is_empty() {
        return Err(Error::ErrSpropParameterSetsMalformed);
    }

    Ok((Bytes::from(sps), Bytes::from(pps)))
}
