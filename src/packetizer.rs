//! Codec seams: payload fan-out on the send side, payload parsing on the
//! receive side.

use bytes::Bytes;

use crate::error::Result;

/// Splits one encoded frame into RTP payloads no larger than `mtu` bytes.
/// RTP headers and marker-bit handling are the sender's job.
pub trait Payloader {
    fn payload(&mut self, mtu: usize, b: &Bytes) -> Result<Vec<Bytes>>;
}

/// Parses one RTP payload back into an elementary-stream fragment.
pub trait Depacketizer {
    fn depacketize(&mut self, b: &Bytes) -> Result<Bytes>;

    /// Checks if the packet is at the beginning of a partition.
    fn is_partition_head(&self, payload: &Bytes) -> bool;

    /// Checks if the packet is at the end of a partition.
    fn is_partition_tail(&self, marker: bool, payload: &Bytes) -> bool;
}
