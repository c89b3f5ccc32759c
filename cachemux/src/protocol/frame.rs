//! Binary protocol header and frame encode/decode, directly against a
//! `bytes::BytesMut` buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::opcode::Opcode;
use super::status::Status;
use crate::error::Error;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;
const HEADER_LEN: usize = 24;

/// A fully-framed request, ready to be written to the wire.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub opcode: Opcode,
    pub vbucket_id: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RequestFrame {
    pub fn new(opcode: Opcode, opaque: u32) -> Self {
        RequestFrame {
            opcode,
            vbucket_id: 0,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = key;
        self
    }

    pub fn with_extras(mut self, extras: Bytes) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = value;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        buf.reserve(HEADER_LEN + body_len);
        buf.put_u8(MAGIC_REQUEST);
        buf.put_u8(self.opcode.into());
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0); // data type: always raw bytes
        buf.put_u16(self.vbucket_id);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }
}

/// A decoded response header plus its body, sliced out of the read buffer.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub opcode: Opcode,
    pub raw_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl ResponseFrame {
    pub fn status(&self) -> Result<Status, Error> {
        Status::try_from(self.raw_status)
            .map_err(|_| Error::Protocol(format!("unknown status code {:#06x}", self.raw_status)))
    }

    pub fn is_success(&self) -> bool {
        self.raw_status == 0x0000
    }
}

/// Attempt to decode one complete response frame from the front of `buf`.
/// Returns `Ok(None)` when the buffer doesn't yet hold a full frame -- the
/// caller should read more bytes and retry. Consumes the frame's bytes from
/// `buf` only when a full frame is available.
pub fn try_decode_response(buf: &mut BytesMut) -> Result<Option<ResponseFrame>, Error> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let magic = buf[0];
    if magic != MAGIC_RESPONSE {
        return Err(Error::Protocol(format!("bad response magic {:#04x}", magic)));
    }
    let key_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let extras_len = buf[4] as usize;
    let total_body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let frame_len = HEADER_LEN + total_body_len;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(frame_len);
    let mut header = frame.split_to(HEADER_LEN);
    header.advance(1); // magic, already checked
    let opcode_byte = header.get_u8();
    let opcode = Opcode::try_from(opcode_byte)
        .map_err(|_| Error::Protocol(format!("unknown opcode {:#04x}", opcode_byte)))?;
    header.advance(2); // key length, already read
    header.advance(1); // extras length, already read
    header.advance(1); // data type, ignored
    let raw_status = header.get_u16();
    header.advance(4); // total body length, already read
    let opaque = header.get_u32();
    let cas = header.get_u64();

    let value_len = total_body_len - key_len - extras_len;
    let extras = frame.split_to(extras_len).freeze();
    let key = frame.split_to(key_len).freeze();
    let value = frame.split_to(value_len).freeze();

    Ok(Some(ResponseFrame {
        opcode,
        raw_status,
        opaque,
        cas,
        extras,
        key,
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_bytes(opcode: u8, status: u16, opaque: u32, key: &[u8], value: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let body_len = key.len() + value.len();
        buf.put_u8(MAGIC_RESPONSE);
        buf.put_u8(opcode);
        buf.put_u16(key.len() as u16);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(status);
        buf.put_u32(body_len as u32);
        buf.put_u32(opaque);
        buf.put_u64(0);
        buf.put_slice(key);
        buf.put_slice(value);
        buf
    }

    #[test]
    fn encode_request_matches_header_layout() {
        let req = RequestFrame::new(Opcode::Get, 42).with_key(Bytes::from_static(b"foo"));
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(buf[0], MAGIC_REQUEST);
        assert_eq!(buf[1], 0x00);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 3);
        assert_eq!(u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]), 42);
        assert_eq!(&buf[HEADER_LEN..], b"foo");
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut buf = response_bytes(0x00, 0, 1, b"k", b"v");
        let mut partial = buf.split_to(HEADER_LEN - 1);
        assert!(try_decode_response(&mut partial).unwrap().is_none());
        // the full frame still decodes once complete.
        let mut whole = response_bytes(0x00, 0, 1, b"k", b"v");
        let frame = try_decode_response(&mut whole).unwrap().unwrap();
        assert_eq!(frame.key.as_ref(), b"k");
        assert_eq!(frame.value.as_ref(), b"v");
    }

    #[test]
    fn unknown_status_surfaces_as_protocol_error() {
        let mut buf = response_bytes(0x00, 0x00F0, 1, b"", b"");
        let frame = try_decode_response(&mut buf).unwrap().unwrap();
        assert!(matches!(frame.status(), Err(Error::Protocol(_))));
    }

    #[test]
    fn opaque_roundtrips() {
        let mut buf = response_bytes(0x00, 0, 0xDEADBEEF, b"", b"");
        let frame = try_decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opaque, 0xDEADBEEF);
    }
}
