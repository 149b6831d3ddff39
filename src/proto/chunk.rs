use super::{ProtoError, Reader, Writer, MAX_SEGMENTS};

/// A registered remote region: `(handle, length, offset)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Segment {
    pub handle: u32,
    pub length: u32,
    pub offset: u64,
}

impl Segment {
    pub const WIRE_SIZE: usize = 16;

    pub fn new(handle: u32, length: u32, offset: u64) -> Self {
        Self { handle, length, offset }
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.u32(self.handle)?;
        w.u32(self.length)?;
        w.u64(self.offset)
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            handle: r.u32()?,
            length: r.u32()?,
            offset: r.u64()?,
        })
    }
}

/// Read list entry: the peer may RDMA-read `target`, whose data belongs at
/// `position` of the XDR stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ReadChunk {
    pub position: u32,
    pub target: Segment,
}

impl ReadChunk {
    /// Discriminator, position and segment.
    pub const WIRE_SIZE: usize = 8 + Segment::WIRE_SIZE;

    pub fn new(position: u32, target: Segment) -> Self {
        Self { position, target }
    }
}

/// The three chunk lists following a `MSG`/`NOMSG` header.
///
/// On the wire the read list is a sequence of `1`-prefixed entries closed by
/// a `0` word. The write list and the reply chunk are each either a single
/// `0` (absent) or `1`, a segment count, the segments and a closing `0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkLists {
    pub reads: Vec<ReadChunk>,
    pub writes: Option<Vec<Segment>>,
    pub reply: Option<Vec<Segment>>,
}

impl ChunkLists {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_none() && self.reply.is_none()
    }

    /// Total number of segments across all lists.
    pub fn segment_count(&self) -> usize {
        self.reads.len()
            + self.writes.as_ref().map_or(0, Vec::len)
            + self.reply.as_ref().map_or(0, Vec::len)
    }

    /// Check the list combination is one we may put on the wire.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.writes.is_some() && self.reply.is_some() {
            return Err(ProtoError::ConflictingChunks);
        }
        let n = self.segment_count();
        if n > MAX_SEGMENTS {
            return Err(ProtoError::TooManySegments(n));
        }
        Ok(())
    }

    /// Encoded size of the lists, header excluded.
    pub fn encoded_len(&self) -> usize {
        fn array_len(a: &Option<Vec<Segment>>) -> usize {
            match a {
                None => 4,
                Some(segs) => 12 + segs.len() * Segment::WIRE_SIZE,
            }
        }
        self.reads.len() * ReadChunk::WIRE_SIZE + 4 + array_len(&self.writes) + array_len(&self.reply)
    }

    pub(super) fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        for rc in &self.reads {
            w.u32(1)?;
            w.u32(rc.position)?;
            rc.target.encode(w)?;
        }
        w.u32(0)?;
        encode_array(w, self.writes.as_deref())?;
        encode_array(w, self.reply.as_deref())
    }

    pub(super) fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let mut reads = Vec::new();
        loop {
            match r.u32()? {
                0 => break,
                1 => {
                    if reads.len() == MAX_SEGMENTS {
                        return Err(ProtoError::TooManySegments(MAX_SEGMENTS + 1));
                    }
                    let position = r.u32()?;
                    reads.push(ReadChunk::new(position, Segment::decode(r)?));
                }
                x => return Err(ProtoError::BadDiscriminator(x)),
            }
        }
        let writes = decode_array(r)?;
        let reply = decode_array(r)?;

        let lists = Self { reads, writes, reply };
        lists.validate()?;
        Ok(lists)
    }
}

fn encode_array(w: &mut Writer<'_>, segs: Option<&[Segment]>) -> Result<(), ProtoError> {
    match segs {
        None => w.u32(0),
        Some(segs) => {
            w.u32(1)?;
            w.u32(segs.len() as u32)?;
            for seg in segs {
                seg.encode(w)?;
            }
            w.u32(0)
        }
    }
}

fn decode_array(r: &mut Reader<'_>) -> Result<Option<Vec<Segment>>, ProtoError> {
    match r.u32()? {
        0 => Ok(None),
        1 => {
            let n = r.u32()? as usize;
            if n > MAX_SEGMENTS {
                return Err(ProtoError::TooManySegments(n));
            }
            let segs = (0..n).map(|_| Segment::decode(r)).collect::<Result<Vec<_>, _>>()?;
            match r.u32()? {
                0 => Ok(Some(segs)),
                x => Err(ProtoError::BadDiscriminator(x)),
            }
        }
        x => Err(ProtoError::BadDiscriminator(x)),
    }
}
