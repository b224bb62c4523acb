use std::str::Utf8Error;

/// Error decoding or encoding wire data
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer ended in the middle of a frame. This is the only
    /// recoverable error: the caller should supply more bytes and retry.
    #[error("not enough data")]
    Truncated,

    /// The byte after the payload was not the 0xCE end-of-frame marker
    #[error("invalid end of frame marker")]
    BadFrameEnd,

    /// Frame payload exceeds the negotiated maximum frame size
    #[error("frame size exceeded")]
    FrameTooLarge,

    /// Frame type byte is not method, header, body or heartbeat
    #[error("unrecognized frame type {0}")]
    UnknownFrameType(u8),

    /// Method or header frame carries a class id that is not recognized
    #[error("unrecognized frame class {0}")]
    UnknownClass(u16),

    /// Method frame carries a method id that is not recognized for its class
    #[error("unrecognized method {1} for class {0}")]
    UnknownMethod(u16, u16),

    /// A complete frame whose payload does not decode
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// A string field that is not valid utf-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// A short string longer than 255 bytes was passed to the encoder
    #[error("short string exceeds 255 bytes")]
    ShortStringTooLong,
}

impl Error {
    pub(crate) fn utf8(field: &'static str) -> impl FnOnce(Utf8Error) -> Error {
        move |_| Error::Utf8(field)
    }
}
