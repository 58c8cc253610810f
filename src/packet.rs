//! One RTP packet: header plus payload view.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extension::ExtensionMap;
use crate::header::Header;

/// A parsed or to-be-sent RTP packet. The payload is a zero-copy view when
/// the packet was produced by [`Packet::unmarshal`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    /// Parses a full RTP packet; the payload excludes any padding bytes.
    pub fn unmarshal(buf: &Bytes, ext_map: &ExtensionMap) -> Result<Packet> {
        let header = Header::parse(buf, ext_map)?;
        let payload_end = buf
            .len()
            .checked_sub(usize::from(header.padding_length))
            .ok_or(Error::ErrShortPacket)?;
        if payload_end < header.header_length {
            return Err(Error::ErrShortPacket);
        }
        let payload = buf.slice(header.header_length..payload_end);
        Ok(Packet { header, payload })
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.header_length + self.payload.len());
        self.header.marshal_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}
