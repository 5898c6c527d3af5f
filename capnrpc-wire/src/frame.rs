//! Length-prefixed segmented frame reassembly and serialization.
//!
//! A frame on the wire is a little-endian header followed by the segment
//! bodies:
//!
//! ```text
//! u32 segment_count_minus_one
//! u32 segment_0_size_words
//! ... u32 segment_n_size_words
//! [u32 padding if segment_count is even]
//! segment bodies, 8 * size_words bytes each
//! ```
//!
//! The header is `1 + segment_count + padding` words so that the bodies
//! start on an 8-byte boundary.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Upper bound on the summed segment sizes of a single frame, in words.
pub const MAX_FRAME_WORDS: u64 = 8 * 1024 * 1024;

/// Upper bound on the number of segments in a single frame.
///
/// A hostile header claiming billions of segments would otherwise force a
/// proportionally sized header allocation before any body byte arrives.
pub const MAX_SEGMENTS: u64 = 512;

/// Errors surfaced by frame reassembly.
///
/// Both variants are fatal to the connection that produced them.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// IO error bubbled up from the codec transport.
    #[error("IO Error {0:?}")]
    Io(#[from] std::io::Error),

    /// The header does not describe a well-formed frame.
    #[error("invalid frame header")]
    InvalidFrame,

    /// The summed segment sizes exceed the reassembly budget.
    #[error("frame exceeds maximum total word count")]
    FrameTooLarge,
}

/// A complete reassembled frame. Owns its bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Bytes,
    /// Byte ranges of the segment bodies within `bytes`.
    segments: Vec<(usize, usize)>,
}

impl Frame {
    /// Parses a buffer holding exactly one frame.
    ///
    /// Fails with [`FrameError::InvalidFrame`] when the buffer is shorter
    /// or longer than the frame its header describes.
    pub fn parse(bytes: Bytes) -> Result<Self, FrameError> {
        let header = match parse_header(&bytes, MAX_FRAME_WORDS)? {
            Some(header) => header,
            None => return Err(FrameError::InvalidFrame),
        };
        if bytes.len() as u64 != header.total_bytes {
            return Err(FrameError::InvalidFrame);
        }
        Ok(Self::from_parts(bytes, &header))
    }

    fn from_parts(bytes: Bytes, header: &Header) -> Self {
        let mut segments = Vec::with_capacity(header.segment_words.len());
        let mut offset = header.header_bytes as usize;
        for words in &header.segment_words {
            let len = (*words as usize) * 8;
            segments.push((offset, len));
            offset += len;
        }
        Self { bytes, segments }
    }

    /// Number of segments in the frame. Always at least one.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Borrows the body of segment `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of range.
    pub fn segment(&self, index: usize) -> &[u8] {
        let (offset, len) = self.segments[index];
        &self.bytes[offset..offset + len]
    }

    /// Returns a cheaply cloned handle to the body of segment `index`.
    pub fn segment_bytes(&self, index: usize) -> Bytes {
        let (offset, len) = self.segments[index];
        self.bytes.slice(offset..offset + len)
    }

    /// Summed segment sizes in words.
    pub fn total_words(&self) -> usize {
        self.segments.iter().map(|(_, len)| len / 8).sum()
    }

    /// The full frame, header included.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consumes the frame, returning the full byte sequence.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

struct Header {
    header_bytes: u64,
    total_bytes: u64,
    segment_words: Vec<u32>,
}

/// Parses a frame header out of `buf`.
///
/// Returns `Ok(None)` while the header is still incomplete. Size errors
/// are reported as soon as the header itself is readable, before any body
/// byte has arrived.
fn parse_header(buf: &[u8], max_words: u64) -> Result<Option<Header>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let count_minus_one = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
    let segment_count = count_minus_one
        .checked_add(1)
        .ok_or(FrameError::InvalidFrame)?;
    if segment_count > MAX_SEGMENTS {
        return Err(FrameError::InvalidFrame);
    }

    let padding = u64::from(segment_count % 2 == 0);
    let header_words = 1 + segment_count + padding;
    let header_bytes = header_words * 4;
    if (buf.len() as u64) < header_bytes {
        return Ok(None);
    }

    let mut segment_words = Vec::with_capacity(segment_count as usize);
    let mut total_words: u64 = 0;
    for i in 0..segment_count {
        let at = (4 + i * 4) as usize;
        let words = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        total_words = total_words
            .checked_add(u64::from(words))
            .ok_or(FrameError::InvalidFrame)?;
        segment_words.push(words);
    }
    if total_words > max_words {
        warn!(total_words, max_words, "rejecting oversize frame");
        return Err(FrameError::FrameTooLarge);
    }

    let total_bytes = header_bytes
        .checked_add(total_words.checked_mul(8).ok_or(FrameError::InvalidFrame)?)
        .ok_or(FrameError::InvalidFrame)?;
    Ok(Some(Header {
        header_bytes,
        total_bytes,
        segment_words,
    }))
}

/// Incremental frame reassembler.
///
/// Bytes go in through [`push`](Framer::push) in arbitrary slices;
/// complete frames come out of [`pop_frame`](Framer::pop_frame) in
/// arrival order. Ownership of a frame's bytes transfers to the caller
/// when the frame is yielded.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    max_words: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Creates a framer with the default [`MAX_FRAME_WORDS`] budget.
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_WORDS)
    }

    /// Creates a framer with a custom reassembly budget in words.
    pub fn with_limit(max_words: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            max_words,
        }
    }

    /// Appends raw bytes to the reassembly buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one has fully arrived.
    ///
    /// Errors are sticky in the sense that the caller is expected to tear
    /// the connection down; the framer makes no attempt to resynchronize.
    pub fn pop_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let header = match parse_header(&self.buf, self.max_words)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if (self.buf.len() as u64) < header.total_bytes {
            return Ok(None);
        }
        let bytes = self.buf.split_to(header.total_bytes as usize).freeze();
        Ok(Some(Frame::from_parts(bytes, &header)))
    }

    /// Number of bytes currently buffered and not yet yielded.
    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Serializes segment bodies into a complete frame.
///
/// Every segment length must be a multiple of 8.
pub fn encode_segments(segments: &[&[u8]]) -> Bytes {
    debug_assert!(!segments.is_empty());
    debug_assert!(segments.iter().all(|s| s.len() % 8 == 0));

    let segment_count = segments.len();
    let padding = usize::from(segment_count % 2 == 0);
    let header_bytes = 4 * (1 + segment_count + padding);
    let body_bytes: usize = segments.iter().map(|s| s.len()).sum();

    let mut out = BytesMut::with_capacity(header_bytes + body_bytes);
    out.put_u32_le((segment_count - 1) as u32);
    for segment in segments {
        out.put_u32_le((segment.len() / 8) as u32);
    }
    if padding == 1 {
        out.put_u32_le(0);
    }
    for segment in segments {
        out.put_slice(segment);
    }
    out.freeze()
}

/// [`tokio_util::codec`] adapter around the same header math as
/// [`Framer`], for connections driven through `FramedRead`/`FramedWrite`.
///
/// Outbound items are pre-serialized frames; the encoder copies them into
/// the write buffer untouched.
#[derive(Debug, Default)]
pub struct FrameCodec {
    max_words: Option<u64>,
}

impl FrameCodec {
    /// Creates a codec with the default reassembly budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the reassembly budget in words.
    pub fn with_limit(max_words: u64) -> Self {
        Self {
            max_words: Some(max_words),
        }
    }

    fn limit(&self) -> u64 {
        self.max_words.unwrap_or(MAX_FRAME_WORDS)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match parse_header(src, self.limit())? {
            Some(header) => header,
            None => return Ok(None),
        };
        if (src.len() as u64) < header.total_bytes {
            src.reserve((header.total_bytes as usize).saturating_sub(src.len()));
            return Ok(None);
        }
        let bytes = src.split_to(header.total_bytes as usize).freeze();
        Ok(Some(Frame::from_parts(bytes, &header)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put(item);
        Ok(())
    }
}
