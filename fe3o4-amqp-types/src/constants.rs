//! Protocol constants

/// The literal protocol header that opens every connection: `AMQP` followed
/// by the protocol id 0 and version 0-9-1
pub const PROTOCOL_HEADER: [u8; 8] = [0x41, 0x4d, 0x51, 0x50, 0x00, 0x00, 0x09, 0x01];

/// Byte that terminates every frame
pub const FRAME_END: u8 = 0xCE;

/// Type byte of a method frame
pub const FRAME_METHOD: u8 = 1;

/// Type byte of a content header frame
pub const FRAME_HEADER: u8 = 2;

/// Type byte of a content body frame
pub const FRAME_BODY: u8 = 3;

/// Type byte of a heartbeat frame
pub const FRAME_HEARTBEAT: u8 = 8;

/// Bytes a frame occupies on the wire in addition to its payload: the
/// seven byte frame header plus the end-of-frame byte
pub const FRAME_OVERHEAD: u32 = 8;
