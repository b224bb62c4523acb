//! Helpers for writing wire encodings into a growable buffer

use bytes::{BufMut, BytesMut};

use crate::Error;

/// Append a short string: one length byte plus at most 255 bytes of utf-8
pub fn put_short_string(buf: &mut BytesMut, s: &str) -> Result<(), Error> {
    if s.len() > u8::MAX as usize {
        return Err(Error::ShortStringTooLong);
    }
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Append a long string: a four byte length plus arbitrary bytes
pub fn put_long_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Reserve a four byte length prefix and return its offset so it can be
/// patched once the payload that follows has been written
pub fn start_length_prefix(buf: &mut BytesMut) -> usize {
    let at = buf.len();
    buf.put_u32(0);
    at
}

/// Patch a length prefix created by [`start_length_prefix`] with the number
/// of bytes written since
pub fn finish_length_prefix(buf: &mut BytesMut, at: usize) {
    let len = (buf.len() - at - 4) as u32;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
}
