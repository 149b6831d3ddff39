//! RPC-over-RDMA wire format.
//!
//! Every message starts with a fixed header of four big-endian words
//! (`xid`, `vers`, `credit`, `type`). `MSG` and `NOMSG` messages follow it
//! with three chunk lists, see [`ChunkLists`]; `MSG` then carries the inline
//! RPC body, `NOMSG` carries nothing else. `ERROR` messages follow the
//! header with an error code and, for version errors, the supported range.
//!
//! All functions here are pure: no I/O, no shared state.

mod chunk;

use thiserror::Error;

pub use self::chunk::*;

/// Protocol version spoken by this implementation.
pub const RDMA_VERSION: u32 = 1;

/// Maximum number of chunk segments in one message, across all lists.
pub const MAX_SEGMENTS: usize = 8;

/// Largest message sent as a plain SEND payload.
pub const INLINE_THRESHOLD: usize = 2048;

/// Room reserved for the transport header when deciding whether a message
/// fits inline. Covers the fixed header plus a full set of chunk lists.
pub const MAX_HEADER_SIZE: usize = 228;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 16;

/// Errors of the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("message truncated: need {need} more bytes at offset {at}")]
    Truncated { at: usize, need: usize },

    #[error("buffer too small to encode the message")]
    Overflow,

    #[error("invalid chunk list discriminator {0}")]
    BadDiscriminator(u32),

    #[error("too many chunk segments ({0}, at most 8)")]
    TooManySegments(usize),

    #[error("message carries both a write list and a reply chunk")]
    ConflictingChunks,

    #[error("unsupported protocol version {0}")]
    BadVersion(u32),

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("message type {0:?} is not supported")]
    UnsupportedType(MsgType),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u32),
}

/// Message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    /// Header plus inline RPC body.
    Msg = 0,
    /// Header only; the RPC message travels in chunks.
    NoMsg = 1,
    /// Padded message.
    Msgp = 2,
    /// Client signals it is done with a reply chunk.
    Done = 3,
    /// Protocol error.
    Error = 4,
}

impl TryFrom<u32> for MsgType {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(MsgType::Msg),
            1 => Ok(MsgType::NoMsg),
            2 => Ok(MsgType::Msgp),
            3 => Ok(MsgType::Done),
            4 => Ok(MsgType::Error),
            x => Err(ProtoError::UnknownType(x)),
        }
    }
}

/// Fixed message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub xid: u32,
    pub vers: u32,
    pub credit: u32,
    pub msg_type: MsgType,
}

impl Header {
    pub fn new(xid: u32, credit: u32, msg_type: MsgType) -> Self {
        Self {
            xid,
            vers: RDMA_VERSION,
            credit,
            msg_type,
        }
    }
}

/// Error carried by an `ERROR` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Version mismatch; the sender supports `[low, high]`.
    Vers { low: u32, high: u32 },
    /// A message did not fit inline and had no usable chunk.
    Chunk,
}

impl ErrorCode {
    const ERR_VERS: u32 = 1;
    const ERR_CHUNK: u32 = 2;
}

/// Read cursor over a received buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset into the buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes after the cursor.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or(ProtoError::Truncated {
            at: self.pos,
            need: end - self.buf.len().min(end),
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_be_bytes(self.take()?))
    }
}

/// Write cursor over a send buffer.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        let end = self.pos + data.len();
        self.buf
            .get_mut(self.pos..end)
            .ok_or(ProtoError::Overflow)?
            .copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub fn u32(&mut self, v: u32) -> Result<(), ProtoError> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn u64(&mut self, v: u64) -> Result<(), ProtoError> {
        self.bytes(&v.to_be_bytes())
    }
}

/// Decode the fixed header. The version is not checked here so that a
/// mismatch can still be answered with the peer's xid.
pub fn decode_header(r: &mut Reader<'_>) -> Result<Header, ProtoError> {
    let xid = r.u32()?;
    let vers = r.u32()?;
    let credit = r.u32()?;
    let msg_type = MsgType::try_from(r.u32()?)?;
    Ok(Header {
        xid,
        vers,
        credit,
        msg_type,
    })
}

pub fn encode_header(w: &mut Writer<'_>, header: &Header) -> Result<(), ProtoError> {
    w.u32(header.xid)?;
    w.u32(header.vers)?;
    w.u32(header.credit)?;
    w.u32(header.msg_type as u32)
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// `MSG` or `NOMSG`: chunk lists, then `inline_offset` is where the
    /// inline body starts (equal to the message length for `NOMSG`).
    Chunks {
        header: Header,
        lists: ChunkLists,
        inline_offset: usize,
    },
    /// `ERROR`.
    Error { header: Header, code: ErrorCode },
}

impl Decoded {
    pub fn header(&self) -> &Header {
        match self {
            Decoded::Chunks { header, .. } | Decoded::Error { header, .. } => header,
        }
    }
}

/// Decode a whole received message.
pub fn decode_message(buf: &[u8]) -> Result<Decoded, ProtoError> {
    let mut r = Reader::new(buf);
    let header = decode_header(&mut r)?;
    if header.vers != RDMA_VERSION {
        return Err(ProtoError::BadVersion(header.vers));
    }
    match header.msg_type {
        MsgType::Msg | MsgType::NoMsg => {
            let lists = ChunkLists::decode(&mut r)?;
            Ok(Decoded::Chunks {
                header,
                lists,
                inline_offset: r.position(),
            })
        }
        MsgType::Error => {
            let code = match r.u32()? {
                ErrorCode::ERR_VERS => ErrorCode::Vers {
                    low: r.u32()?,
                    high: r.u32()?,
                },
                ErrorCode::ERR_CHUNK => ErrorCode::Chunk,
                x => return Err(ProtoError::UnknownErrorCode(x)),
            };
            Ok(Decoded::Error { header, code })
        }
        t @ (MsgType::Msgp | MsgType::Done) => Err(ProtoError::UnsupportedType(t)),
    }
}

/// Encode the header and chunk lists of a `MSG`/`NOMSG` message. Return the
/// number of bytes written; any inline body goes right after.
pub fn encode_message(buf: &mut [u8], header: &Header, lists: &ChunkLists) -> Result<usize, ProtoError> {
    lists.validate()?;
    let mut w = Writer::new(buf);
    encode_header(&mut w, header)?;
    lists.encode(&mut w)?;
    Ok(w.position())
}

/// Encode the header of a reply. Replies never carry read chunks; the write
/// list or reply chunk describe where the payload or the whole reply was
/// RDMA-written.
pub fn encode_reply_header(
    buf: &mut [u8],
    xid: u32,
    credit: u32,
    writes: Option<&[Segment]>,
    reply: Option<&[Segment]>,
) -> Result<usize, ProtoError> {
    let msg_type = if reply.is_some() { MsgType::NoMsg } else { MsgType::Msg };
    let lists = ChunkLists {
        reads: Vec::new(),
        writes: writes.map(<[Segment]>::to_vec),
        reply: reply.map(<[Segment]>::to_vec),
    };
    encode_message(buf, &Header::new(xid, credit, msg_type), &lists)
}

/// Encode an `ERROR` message. Return the number of bytes written.
pub fn encode_error(buf: &mut [u8], xid: u32, credit: u32, code: ErrorCode) -> Result<usize, ProtoError> {
    let mut w = Writer::new(buf);
    encode_header(&mut w, &Header::new(xid, credit, MsgType::Error))?;
    match code {
        ErrorCode::Vers { low, high } => {
            w.u32(ErrorCode::ERR_VERS)?;
            w.u32(low)?;
            w.u32(high)?;
        }
        ErrorCode::Chunk => w.u32(ErrorCode::ERR_CHUNK)?,
    }
    Ok(w.position())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = [0u8; 64];
        let n = encode_message(&mut buf, &Header::new(0xdead_beef, 32, MsgType::Msg), &ChunkLists::default()).unwrap();
        // Header plus three empty lists.
        assert_eq!(n, HEADER_SIZE + 12);
        assert_eq!(&buf[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&buf[4..8], &1u32.to_be_bytes());
        assert_eq!(&buf[8..12], &32u32.to_be_bytes());
        assert_eq!(&buf[12..n], &[0u8; 16]);

        match decode_message(&buf[..n]).unwrap() {
            Decoded::Chunks {
                header,
                lists,
                inline_offset,
            } => {
                assert_eq!(header.xid, 0xdead_beef);
                assert!(lists.is_empty());
                assert_eq!(inline_offset, n);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_messages() {
        let mut buf = [0u8; 32];
        let n = encode_error(&mut buf, 7, 1, ErrorCode::Vers { low: 1, high: 1 }).unwrap();
        assert_eq!(n, 28);
        assert_eq!(
            decode_message(&buf[..n]).unwrap(),
            Decoded::Error {
                header: Header::new(7, 1, MsgType::Error),
                code: ErrorCode::Vers { low: 1, high: 1 }
            }
        );

        let n = encode_error(&mut buf, 8, 1, ErrorCode::Chunk).unwrap();
        assert_eq!(n, 20);
        assert!(matches!(
            decode_message(&buf[..n]),
            Ok(Decoded::Error {
                code: ErrorCode::Chunk,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut buf = [0u8; 32];
        let n = encode_message(&mut buf, &Header::new(1, 1, MsgType::Msg), &ChunkLists::default()).unwrap();

        assert!(matches!(decode_message(&buf[..10]), Err(ProtoError::Truncated { .. })));

        let mut bad = buf;
        bad[4..8].copy_from_slice(&2u32.to_be_bytes());
        assert_eq!(decode_message(&bad[..n]), Err(ProtoError::BadVersion(2)));

        let mut bad = buf;
        bad[12..16].copy_from_slice(&3u32.to_be_bytes());
        assert_eq!(decode_message(&bad[..n]), Err(ProtoError::UnsupportedType(MsgType::Done)));

        let mut bad = buf;
        bad[12..16].copy_from_slice(&9u32.to_be_bytes());
        assert_eq!(decode_message(&bad[..n]), Err(ProtoError::UnknownType(9)));

        assert_eq!(
            encode_message(&mut buf[..8], &Header::new(1, 1, MsgType::Msg), &ChunkLists::default()),
            Err(ProtoError::Overflow)
        );
    }

    #[test]
    fn test_reply_header_type() {
        let seg = [Segment::new(5, 100, 0x1000)];
        let mut buf = [0u8; 64];
        let n = encode_reply_header(&mut buf, 3, 16, None, Some(&seg)).unwrap();
        let decoded = decode_message(&buf[..n]).unwrap();
        assert_eq!(decoded.header().msg_type, MsgType::NoMsg);

        let n = encode_reply_header(&mut buf, 3, 16, Some(&seg), None).unwrap();
        let decoded = decode_message(&buf[..n]).unwrap();
        assert_eq!(decoded.header().msg_type, MsgType::Msg);

        assert_eq!(
            encode_reply_header(&mut buf, 3, 16, Some(&seg), Some(&seg)),
            Err(ProtoError::ConflictingChunks)
        );
    }
}
