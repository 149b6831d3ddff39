//! Chunk selection: how each part of a message travels.

use super::error::TransportError;
use super::msg::RpcRequest;
use crate::mem::{iov_len, IoBuf};
use crate::proto::{ChunkLists, ReadChunk, Segment, MAX_HEADER_SIZE, MAX_SEGMENTS};
use crate::rdma::mr::MrRemote;

/// How the request body reaches the responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadType {
    /// Everything is sent inline.
    None,
    /// Headers inline, payload RDMA-read by the responder.
    Payload,
    /// Headers and payload RDMA-read by the responder; nothing inline.
    Whole,
}

/// Where the responder puts the reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    /// The reply comes back inline.
    None,
    /// Reply payload RDMA-written into the requester's payload buffers.
    WriteList,
    /// Whole reply RDMA-written into the requester's reply buffer.
    ReplyChunk,
}

/// Chunk decision for one outgoing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub read: ReadType,
    pub write: WriteType,
}

impl ChunkPlan {
    /// Decide the chunk types of `req` for a connection carrying at most
    /// `inline_size` bytes per SEND, and check the resulting message may go
    /// on the wire.
    pub fn for_request(req: &RpcRequest, inline_size: usize) -> Result<Self, TransportError> {
        let send_size = req.header_len() + MAX_HEADER_SIZE;
        let read = if send_size > inline_size {
            ReadType::Whole
        } else if send_size + iov_len(&req.payload) <= inline_size {
            ReadType::None
        } else {
            ReadType::Payload
        };

        let write = match (req.rsphdr.is_empty(), req.rsp_payload.is_empty()) {
            (false, false) => return Err(TransportError::ConflictingChunks),
            _ if req.rsphdr.len() == 1 => WriteType::ReplyChunk,
            (_, false) => WriteType::WriteList,
            _ => WriteType::None,
        };

        let plan = Self { read, write };
        let n = plan.read_vectors(req).len() + plan.reply_vectors(req).len();
        if n > MAX_SEGMENTS {
            return Err(TransportError::TooManyChunks(n));
        }
        Ok(plan)
    }

    /// Vectors exposed for the responder to read.
    pub fn read_vectors(&self, req: &RpcRequest) -> Vec<IoBuf> {
        match self.read {
            ReadType::None => Vec::new(),
            ReadType::Payload => non_empty(&req.payload),
            ReadType::Whole => req
                .rpchdr
                .iter()
                .chain(&req.proghdr)
                .chain(&req.payload)
                .filter(|b| !b.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Vectors exposed for the responder to write the reply into.
    pub fn reply_vectors(&self, req: &RpcRequest) -> Vec<IoBuf> {
        match self.write {
            WriteType::None => Vec::new(),
            WriteType::WriteList => non_empty(&req.rsp_payload),
            WriteType::ReplyChunk => non_empty(&req.rsphdr),
        }
    }

    /// Vectors copied into the SEND itself.
    pub fn inline_vectors(&self, req: &RpcRequest) -> Vec<IoBuf> {
        let headers = req.rpchdr.iter().chain(&req.proghdr);
        match self.read {
            ReadType::None => headers.chain(&req.payload).cloned().collect(),
            ReadType::Payload => headers.cloned().collect(),
            ReadType::Whole => Vec::new(),
        }
    }

    /// Chunk lists describing registered `reads` and `replies`.
    ///
    /// Payload read chunks are positioned after the inline headers; chunks of
    /// a whole-message read are numbered from 0. Positions advance by the
    /// length of each chunk.
    pub fn lists(&self, header_len: u32, reads: &[Segment], replies: &[Segment]) -> ChunkLists {
        let start = match self.read {
            ReadType::Payload => header_len,
            _ => 0,
        };
        let mut position = start;
        let reads = reads
            .iter()
            .map(|seg| {
                let rc = ReadChunk::new(position, *seg);
                position += seg.length;
                rc
            })
            .collect();
        let (writes, reply) = match self.write {
            WriteType::None => (None, None),
            WriteType::WriteList => (Some(replies.to_vec()), None),
            WriteType::ReplyChunk => (None, Some(replies.to_vec())),
        };
        ChunkLists { reads, writes, reply }
    }
}

pub(crate) fn non_empty(iov: &[IoBuf]) -> Vec<IoBuf> {
    iov.iter().filter(|b| !b.is_empty()).cloned().collect()
}

/// One RDMA write: `len` bytes at `offset` of local vector `vector`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WritePiece {
    pub vector: usize,
    pub offset: usize,
    pub len: usize,
    pub remote: MrRemote,
}

/// Placement of local data into the segments a requester offered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct WritePlan {
    pub pieces: Vec<WritePiece>,
    /// The segments used, with their lengths cut to the bytes written.
    pub written: Vec<Segment>,
    /// Bytes that did not fit.
    pub remaining: usize,
}

/// Fill `segs` in order with vectors of lengths `lens`.
pub(crate) fn write_plan(segs: &[Segment], lens: &[usize]) -> WritePlan {
    let total: usize = lens.iter().sum();
    let mut plan = WritePlan::default();
    let (mut vi, mut voff) = (0, 0);

    for seg in segs {
        if vi == lens.len() {
            break;
        }
        let mut used = 0usize;
        while used < seg.length as usize && vi < lens.len() {
            let n = (seg.length as usize - used).min(lens[vi] - voff);
            if n > 0 {
                plan.pieces.push(WritePiece {
                    vector: vi,
                    offset: voff,
                    len: n,
                    remote: MrRemote::new(seg.offset + used as u64, n, seg.handle),
                });
            }
            used += n;
            voff += n;
            if voff == lens[vi] {
                vi += 1;
                voff = 0;
            }
        }
        plan.written.push(Segment::new(seg.handle, used as u32, seg.offset));
    }

    let written: usize = plan.written.iter().map(|s| s.length as usize).sum();
    plan.remaining = total - written;
    plan
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::proto::{decode_message, encode_message, Decoded, Header, MsgType, INLINE_THRESHOLD};

    fn buf(len: usize) -> IoBuf {
        IoBuf::new(len).unwrap()
    }

    fn request(rpchdr: usize, proghdr: usize, payload: &[usize]) -> RpcRequest {
        let mut hdr = vec![0u8; rpchdr.max(4)];
        hdr[..4].copy_from_slice(&7u32.to_be_bytes());
        RpcRequest::new(vec![IoBuf::from_slice(&hdr).unwrap()])
            .with_proghdr(if proghdr > 0 { vec![buf(proghdr)] } else { Vec::new() })
            .with_payload(payload.iter().map(|&n| buf(n)).collect())
    }

    /// Pretend every vector was registered at its own address with key 1.
    fn segments(iov: &[IoBuf]) -> Vec<Segment> {
        iov.iter()
            .map(|b| Segment::new(1, b.len() as u32, b.addr() as u64))
            .collect()
    }

    #[test]
    fn test_small_request_is_inline() {
        let req = request(40, 60, &[1024]);
        let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
        assert_eq!(plan, ChunkPlan { read: ReadType::None, write: WriteType::None });
        assert_eq!(plan.inline_vectors(&req).len(), 3);

        let lists = plan.lists(100, &[], &[]);
        assert!(lists.is_empty());
        let mut wire = [0u8; 64];
        let n = encode_message(&mut wire, &Header::new(7, 32, MsgType::Msg), &lists).unwrap();
        match decode_message(&wire[..n]).unwrap() {
            Decoded::Chunks { header, lists, .. } => {
                assert_eq!((header.xid, header.msg_type), (7, MsgType::Msg));
                assert!(lists.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_large_payload_uses_read_chunk() {
        let req = request(40, 60, &[4 << 20]);
        let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
        assert_eq!(plan.read, ReadType::Payload);

        let inline = plan.inline_vectors(&req);
        assert_eq!(iov_len(&inline), 100);
        let lists = plan.lists(100, &segments(&plan.read_vectors(&req)), &[]);
        assert_eq!(lists.reads.len(), 1);
        assert_eq!(lists.reads[0].position, 100);
        assert_eq!(lists.reads[0].target.length, 4 << 20);
    }

    #[test]
    fn test_oversized_headers_read_everything() {
        let req = request(1000, 1200, &[10]);
        let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
        assert_eq!(plan.read, ReadType::Whole);
        assert!(plan.inline_vectors(&req).is_empty());

        let lists = plan.lists(2200, &segments(&plan.read_vectors(&req)), &[]);
        let positions: Vec<u32> = lists.reads.iter().map(|rc| rc.position).collect();
        assert_eq!(positions, vec![0, 1000, 2200]);
    }

    #[test]
    fn test_smaller_receive_buffers_lower_the_threshold() {
        let req = request(40, 60, &[1400]);
        assert_eq!(ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap().read, ReadType::None);
        assert_eq!(ChunkPlan::for_request(&req, 1024).unwrap().read, ReadType::Payload);

        let big_headers = request(500, 400, &[10]);
        assert_eq!(ChunkPlan::for_request(&big_headers, INLINE_THRESHOLD).unwrap().read, ReadType::None);
        assert_eq!(ChunkPlan::for_request(&big_headers, 1024).unwrap().read, ReadType::Whole);
    }

    #[test]
    fn test_reply_buffer_selection() {
        let req = request(40, 0, &[]).with_reply_buffer(buf(8192));
        let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
        assert_eq!(plan.write, WriteType::ReplyChunk);
        let lists = plan.lists(40, &[], &segments(&plan.reply_vectors(&req)));
        assert!(lists.writes.is_none());
        assert_eq!(lists.reply.as_ref().map(Vec::len), Some(1));

        let req = request(40, 0, &[]).with_reply_payload(vec![buf(4096), buf(4096)]);
        let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
        assert_eq!(plan.write, WriteType::WriteList);
        let lists = plan.lists(40, &[], &segments(&plan.reply_vectors(&req)));
        assert_eq!(lists.writes.as_ref().map(Vec::len), Some(2));
        assert!(lists.reply.is_none());

        let both = request(40, 0, &[])
            .with_reply_buffer(buf(64))
            .with_reply_payload(vec![buf(64)]);
        assert!(matches!(ChunkPlan::for_request(&both, INLINE_THRESHOLD), Err(TransportError::ConflictingChunks)));
    }

    #[test]
    fn test_too_many_chunks() {
        let req = request(40, 0, &[4096; 6]).with_reply_payload((0..3).map(|_| buf(64)).collect());
        assert!(matches!(ChunkPlan::for_request(&req, INLINE_THRESHOLD), Err(TransportError::TooManyChunks(9))));
    }

    #[test]
    fn test_write_plan_splits_across_segments() {
        let segs = [Segment::new(5, 100, 0x1000), Segment::new(6, 100, 0x2000)];
        let plan = write_plan(&segs, &[30, 120]);
        assert_eq!(plan.remaining, 0);
        assert_eq!(
            plan.written,
            vec![Segment::new(5, 100, 0x1000), Segment::new(6, 50, 0x2000)]
        );
        let shape: Vec<(usize, usize, usize, u64)> = plan
            .pieces
            .iter()
            .map(|p| (p.vector, p.offset, p.len, p.remote.addr))
            .collect();
        assert_eq!(shape, vec![(0, 0, 30, 0x1000), (1, 0, 70, 0x1000 + 30), (1, 70, 50, 0x2000)]);

        let short = write_plan(&segs[..1], &[150]);
        assert_eq!(short.remaining, 50);
    }

    proptest! {
        #[test]
        fn test_small_messages_stay_inline(rpchdr in 4usize..200, proghdr in 0usize..200, payload in 0usize..1400) {
            let req = request(rpchdr, proghdr, &[payload]);
            let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
            prop_assume!(rpchdr + proghdr + payload + MAX_HEADER_SIZE <= INLINE_THRESHOLD);
            prop_assert_eq!(plan.read, ReadType::None);
            prop_assert_eq!(plan.write, WriteType::None);
        }

        #[test]
        fn test_read_chunks_cover_payload(
            rpchdr in 4usize..400,
            payload in prop::collection::vec(1usize..(1 << 20), 1..6),
        ) {
            let total: usize = payload.iter().sum();
            prop_assume!(rpchdr + MAX_HEADER_SIZE + total > INLINE_THRESHOLD);
            let req = request(rpchdr, 0, &payload);
            let plan = ChunkPlan::for_request(&req, INLINE_THRESHOLD).unwrap();
            prop_assert_eq!(plan.read, ReadType::Payload);

            let lists = plan.lists(rpchdr as u32, &segments(&plan.read_vectors(&req)), &[]);
            let sum: usize = lists.reads.iter().map(|rc| rc.target.length as usize).sum();
            prop_assert_eq!(sum, total);
            prop_assert!(lists.writes.is_none() || lists.reply.is_none());
            // Chunks tile the XDR stream after the headers without gaps.
            let mut pos = rpchdr as u32;
            for rc in &lists.reads {
                prop_assert_eq!(rc.position, pos);
                pos += rc.target.length;
            }
        }

        #[test]
        fn test_write_plan_accounts_for_every_byte(
            seg_lens in prop::collection::vec(0u32..5000, 1..8),
            lens in prop::collection::vec(0usize..6000, 0..6),
        ) {
            let segs: Vec<Segment> = seg_lens
                .iter()
                .enumerate()
                .map(|(i, &l)| Segment::new(i as u32, l, (i as u64) << 20))
                .collect();
            let plan = write_plan(&segs, &lens);
            let total: usize = lens.iter().sum();
            let placed: usize = plan.pieces.iter().map(|p| p.len).sum();
            prop_assert_eq!(placed + plan.remaining, total);
            for (w, s) in plan.written.iter().zip(&segs) {
                prop_assert!(w.length <= s.length);
            }
            for p in &plan.pieces {
                prop_assert!(p.len > 0);
                prop_assert!(p.offset + p.len <= lens[p.vector]);
            }
        }
    }
}
