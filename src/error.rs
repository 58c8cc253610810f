use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Parse and send failures are local and non-fatal: callers are expected to
/// drop the offending packet and continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("RTP version must be 2")]
    ErrBadVersion,
    #[error("RTCP header size insufficient")]
    ErrRtcpHeaderSizeInsufficient,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("payload is not large enough")]
    ErrShortPayload,
    #[error("header extension id must be between 1 and 14 for RFC 5285 one byte extensions")]
    ErrOneByteHeaderIdRange,

    #[error("VP8 partition id must not be larger than 8")]
    ErrVp8PartitionIdOutOfRange,
    #[error("payload is too small for VP8 uncompressed header")]
    ErrVp8FrameSizeUnavailable,

    #[error("STAP-A de-aggregation is not supported")]
    ErrStapANotSupported,
    #[error("nalu type {0} is currently not handled")]
    ErrNaluTypeIsNotHandled(u8),

    #[error("sprop-parameter-sets must be a comma separated SPS,PPS pair")]
    ErrSpropParameterSetsMalformed,
    #[error("invalid base64 in sprop-parameter-sets")]
    ErrSpropParameterSetsBase64,

    #[error("frame payload must not be empty")]
    ErrEmptyFrame,
    #[error("no payload type registered for codec")]
    ErrCodecNotRegistered,
    #[error("network send failed with code {0}")]
    ErrSendFailed(i32),
    #[error("mutex poison: {0}")]
    PoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
