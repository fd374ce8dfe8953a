//! RPC frame header
//!
//! The core forwards RPC payloads as opaque bytes; only the fixed header is
//! parsed, exposing the service key, the caller identity and the
//! request/response discriminator. Wire layout (big-endian):
//!
//! ```text
//! magic(2) | version(1) | kind(1) | status(1) | reserved(1) |
//! service_key(4) | client_id(8) | seq(8) | payload_len(4)
//! ```
//!
//! followed by `payload_len` payload bytes that the fabric never inspects.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ErrorCode;
use crate::{ClientId, ServiceKey};

/// Magic bytes `BN` at the start of every frame.
pub const FRAME_MAGIC: u16 = 0x424E;

/// Current header version.
pub const FRAME_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 30;

/// Upper bound on a single frame payload; larger lengths are treated as a
/// protocol violation by the transport.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Request/response discriminator carried explicitly in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// Parsed view of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Zero on success; otherwise an [`ErrorCode`] status byte. Only
    /// meaningful on responses.
    pub status: u8,
    pub service_key: ServiceKey,
    pub client_id: ClientId,
    /// Client-side correlation id pairing a response with its request.
    pub seq: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse the header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<FrameHeader, ErrorCode> {
        if data.len() < HEADER_LEN {
            return Err(ErrorCode::InvalidArguments);
        }
        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != FRAME_MAGIC || data[2] != FRAME_VERSION {
            return Err(ErrorCode::InvalidArguments);
        }
        let kind = match data[3] {
            0 => FrameKind::Request,
            1 => FrameKind::Response,
            _ => return Err(ErrorCode::InvalidArguments),
        };
        let service_key = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let client_id = u64::from_be_bytes([
            data[10], data[11], data[12], data[13], data[14], data[15], data[16], data[17],
        ]);
        let seq = u64::from_be_bytes([
            data[18], data[19], data[20], data[21], data[22], data[23], data[24], data[25],
        ]);
        let payload_len = u32::from_be_bytes([data[26], data[27], data[28], data[29]]);
        Ok(FrameHeader {
            kind,
            status: data[4],
            service_key,
            client_id,
            seq,
            payload_len,
        })
    }

    /// The [`ErrorCode`] carried by a response, if any.
    pub fn error(&self) -> Option<ErrorCode> {
        ErrorCode::from_status(self.status)
    }

    fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(match self.kind {
            FrameKind::Request => 0,
            FrameKind::Response => 1,
        });
        buf.put_u8(self.status);
        buf.put_u8(0);
        buf.put_u32(self.service_key);
        buf.put_u64(self.client_id);
        buf.put_u64(self.seq);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Build a request frame.
pub fn request_frame(
    service_key: ServiceKey,
    client_id: ClientId,
    seq: u64,
    payload: &[u8],
) -> Bytes {
    FrameHeader {
        kind: FrameKind::Request,
        status: 0,
        service_key,
        client_id,
        seq,
        payload_len: payload.len() as u32,
    }
    .encode(payload)
}

/// Build a successful response frame mirroring a request header.
pub fn response_frame(
    service_key: ServiceKey,
    client_id: ClientId,
    seq: u64,
    payload: &[u8],
) -> Bytes {
    FrameHeader {
        kind: FrameKind::Response,
        status: 0,
        service_key,
        client_id,
        seq,
        payload_len: payload.len() as u32,
    }
    .encode(payload)
}

/// Build an error response frame carrying `code` in the status byte.
pub fn error_response_frame(
    service_key: ServiceKey,
    client_id: ClientId,
    seq: u64,
    code: ErrorCode,
) -> Bytes {
    FrameHeader {
        kind: FrameKind::Response,
        status: code.status_byte(),
        service_key,
        client_id,
        seq,
        payload_len: 0,
    }
    .encode(&[])
}

/// The payload portion of a complete frame.
pub fn frame_payload(frame: &Bytes) -> Bytes {
    if frame.len() <= HEADER_LEN {
        Bytes::new()
    } else {
        frame.slice(HEADER_LEN..)
    }
}

/// Copy of `frame` with its correlation id replaced.
///
/// Used by the cluster router to stamp a forwarded request with its own
/// request id and to restore the caller's id on the way back; everything
/// else, payload included, is carried through untouched.
pub fn with_seq(frame: &Bytes, seq: u64) -> Bytes {
    let mut buf = BytesMut::from(frame.as_ref());
    if buf.len() >= HEADER_LEN {
        buf[18..26].copy_from_slice(&seq.to_be_bytes());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_round_trip() {
        let frame = request_frame(202, 0xABCD, 7, b"ping");
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.kind, FrameKind::Request);
        assert_eq!(header.service_key, 202);
        assert_eq!(header.client_id, 0xABCD);
        assert_eq!(header.seq, 7);
        assert_eq!(header.payload_len, 4);
        assert_eq!(frame_payload(&frame).as_ref(), b"ping");
    }

    #[test]
    fn error_response_carries_status() {
        let frame = error_response_frame(5, 1, 9, ErrorCode::ServiceIdNotFound);
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.kind, FrameKind::Response);
        assert_eq!(header.error(), Some(ErrorCode::ServiceIdNotFound));
    }

    #[test]
    fn with_seq_rewrites_only_the_correlation_id() {
        let frame = request_frame(202, 0xABCD, 7, b"ping");
        let stamped = with_seq(&frame, 9001);
        let header = FrameHeader::parse(&stamped).unwrap();
        assert_eq!(header.seq, 9001);
        assert_eq!(header.kind, FrameKind::Request);
        assert_eq!(header.service_key, 202);
        assert_eq!(header.client_id, 0xABCD);
        assert_eq!(frame_payload(&stamped).as_ref(), b"ping");
        assert_eq!(with_seq(&stamped, 7), frame);
    }

    #[test]
    fn short_or_garbled_input_is_rejected() {
        assert_eq!(
            FrameHeader::parse(&[0u8; 4]),
            Err(ErrorCode::InvalidArguments)
        );
        let mut frame = request_frame(1, 1, 1, b"").to_vec();
        frame[0] = 0xFF;
        assert_eq!(
            FrameHeader::parse(&frame),
            Err(ErrorCode::InvalidArguments)
        );
    }
}
