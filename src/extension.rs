//! RTP header extension registration, RFC 5285 one-byte profile.
//!
//! Extension ids are negotiated out of band; parsing only interprets
//! elements whose id has been registered here.

/// One-byte header extension ids live in 1..=14; 15 terminates parsing.
pub const ONE_BYTE_EXTENSION_MAX_ID: u8 = 14;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtensionType {
    /// RTP transmission time offset, 24-bit signed.
    TransmissionTimeOffset,
    /// Audio level indication; parsed but discarded for video streams.
    AudioLevel,
    /// Absolute send time, 24-bit unsigned.
    AbsoluteSendTime,
}

/// Maps negotiated extension ids to their types.
#[derive(Debug, Default, Clone)]
pub struct ExtensionMap {
    slots: [Option<ExtensionType>; ONE_BYTE_EXTENSION_MAX_ID as usize],
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `extension_type` under `id`. Ids outside 1..=14 are
    /// rejected.
    pub fn register(&mut self, id: u8, extension_type: ExtensionType) -> crate::error::Result<()> {
        if id == 0 || id > ONE_BYTE_EXTENSION_MAX_ID {
            return Err(crate::error::Error::ErrOneByteHeaderIdRange);
        }
        self.slots[(id - 1) as usize] = Some(extension_type);
        Ok(())
    }

    pub fn lookup(&self, id: u8) -> Option<ExtensionType> {
        if id == 0 || id > ONE_BYTE_EXTENSION_MAX_ID {
            return None;
        }
        self.slots[(id - 1) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut map = ExtensionMap::new();
        map.register(2, ExtensionType::TransmissionTimeOffset)
            .unwrap();
        map.register(3, ExtensionType::AbsoluteSendTime).unwrap();

        assert_eq!(map.lookup(2), Some(ExtensionType::TransmissionTimeOffset));
        assert_eq!(map.lookup(3), Some(ExtensionType::AbsoluteSendTime));
        assert_eq!(map.lookup(4), None);
        assert_eq!(map.lookup(0), None);
        assert_eq!(map.lookup(15), None);
    }

    #[test]
    fn test_register_rejects_reserved_ids() {
        let mut map = ExtensionMap::new();
        assert!(map.register(0, ExtensionType::AudioLevel).is_err());
        assert!(map.register(15, ExtensionType::AudioLevel).is_err());
    }
}
