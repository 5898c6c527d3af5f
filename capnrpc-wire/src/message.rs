//! Segmented message arena: readers over a decoded frame and a
//! single-segment builder for outbound messages.
//!
//! Readers only ever traverse the root segment. Far pointers are an
//! inter-segment feature of the arena library this engine does not
//! consume; encountering one is a decode error, not a fallback path.
//!
//! The builder is a bump allocator over 8-byte words. Word 0 is the root
//! pointer. Sub-builders are plain index handles so that every mutation
//! goes through the one `&mut MessageBuilder`, which keeps the borrow
//! story trivial for the capability walkers that rewrite pointer words in
//! place.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Frame, FrameError};
use crate::ptr::{self, elem, PointerKind};

/// Limit on pointer nesting for deep copies and traversals.
const MAX_POINTER_DEPTH: usize = 64;

/// Errors surfaced by pointer traversal and message building.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// A pointer word is malformed.
    #[error("malformed pointer word")]
    InvalidPointer,

    /// A pointer target lands outside the segment.
    #[error("pointer target out of segment bounds")]
    PointerOutOfBounds,

    /// A capability id does not fit in 30 bits.
    #[error("capability id exceeds 2^30")]
    CapabilityIdTooLarge,

    /// A pointer kind that this engine does not decode (far pointers),
    /// or a kind that does not match what the schema requires.
    #[error("unexpected pointer type")]
    UnexpectedPointerType,
}

/// A decoded message over the root segment of a frame.
#[derive(Debug, Clone)]
pub struct Message {
    seg: Bytes,
}

impl Message {
    /// Wraps the root segment of a reassembled frame.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            seg: frame.segment_bytes(0),
        }
    }

    /// Parses a serialized frame and wraps its root segment.
    pub fn parse_frame(bytes: Bytes) -> Result<Self, FrameError> {
        let frame = Frame::parse(bytes)?;
        Ok(Self::from_frame(&frame))
    }

    /// Wraps a bare segment (8-byte aligned words, word 0 is the root
    /// pointer).
    pub fn from_segment(seg: Bytes) -> Self {
        Self { seg }
    }

    /// Resolves the root pointer.
    pub fn root(&self) -> Result<Option<AnyReader<'_>>, MessageError> {
        if self.seg.len() < 8 {
            return Ok(None);
        }
        resolve_pointer(&self.seg, 0)
    }

    /// Resolves the root pointer as a struct. A null root reads as an
    /// empty struct, the way a zeroed message decodes to all defaults.
    pub fn root_struct(&self) -> Result<StructReader<'_>, MessageError> {
        match self.root()? {
            None => Ok(StructReader::empty()),
            Some(AnyReader::Struct(reader)) => Ok(reader),
            Some(_) => Err(MessageError::UnexpectedPointerType),
        }
    }
}

/// A resolved pointer: struct, list, or capability.
#[derive(Debug, Clone, Copy)]
pub enum AnyReader<'a> {
    /// Struct body.
    Struct(StructReader<'a>),
    /// List body.
    List(ListReader<'a>),
    /// Capability pointer; the value is the encoded capability id.
    Capability(u32),
}

impl<'a> AnyReader<'a> {
    /// The struct body, if this is a struct pointer.
    pub fn as_struct(&self) -> Option<StructReader<'a>> {
        match self {
            AnyReader::Struct(reader) => Some(*reader),
            _ => None,
        }
    }

    /// The list body, if this is a list pointer.
    pub fn as_list(&self) -> Option<ListReader<'a>> {
        match self {
            AnyReader::List(reader) => Some(*reader),
            _ => None,
        }
    }

    /// The capability id, if this is a capability pointer.
    pub fn as_capability(&self) -> Option<u32> {
        match self {
            AnyReader::Capability(id) => Some(*id),
            _ => None,
        }
    }

    /// Raw bytes of a byte list. Opaque keys travel on the wire in this
    /// shape, so this is the accessor token handling goes through.
    pub fn as_key_bytes(&self) -> Option<Vec<u8>> {
        match self {
            AnyReader::List(reader) if reader.elem_size() == elem::BYTE => {
                Some(reader.bytes().to_vec())
            }
            _ => None,
        }
    }
}

fn seg_words(seg: &[u8]) -> usize {
    seg.len() / 8
}

fn get_word(seg: &[u8], index: usize) -> Result<u64, MessageError> {
    let at = index
        .checked_mul(8)
        .ok_or(MessageError::PointerOutOfBounds)?;
    let bytes = seg
        .get(at..at + 8)
        .ok_or(MessageError::PointerOutOfBounds)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}

fn checked_target(word_index: usize, offset: i32) -> Result<usize, MessageError> {
    let target = word_index as i64 + 1 + i64::from(offset);
    usize::try_from(target).map_err(|_| MessageError::PointerOutOfBounds)
}

/// Resolves the pointer word at `word_index` within `seg`.
pub(crate) fn resolve_pointer(
    seg: &[u8],
    word_index: usize,
) -> Result<Option<AnyReader<'_>>, MessageError> {
    let word = get_word(seg, word_index)?;
    if word == 0 {
        return Ok(None);
    }
    match ptr::kind(word) {
        PointerKind::Struct => {
            let sp = ptr::parse_struct(word);
            let target = checked_target(word_index, sp.offset)?;
            let end = target + sp.data_words as usize + sp.ptr_words as usize;
            if end > seg_words(seg) {
                return Err(MessageError::PointerOutOfBounds);
            }
            Ok(Some(AnyReader::Struct(StructReader {
                seg,
                data_word: target,
                data_words: sp.data_words,
                ptr_word: target + sp.data_words as usize,
                ptr_words: sp.ptr_words,
            })))
        }
        PointerKind::List => {
            let lp = ptr::parse_list(word);
            let target = checked_target(word_index, lp.offset)?;
            if lp.elem_size == elem::COMPOSITE {
                // `count` is the total content word count; the element
                // count lives in the tag word.
                let content_end = target + 1 + lp.count as usize;
                if content_end > seg_words(seg) {
                    return Err(MessageError::PointerOutOfBounds);
                }
                let tag = get_word(seg, target)?;
                if ptr::kind(tag) != PointerKind::Struct {
                    return Err(MessageError::InvalidPointer);
                }
                let tp = ptr::parse_struct(tag);
                let elem_count =
                    u32::try_from(tp.offset).map_err(|_| MessageError::InvalidPointer)?;
                let stride = tp.data_words as u64 + tp.ptr_words as u64;
                if u64::from(elem_count) * stride > u64::from(lp.count) {
                    return Err(MessageError::PointerOutOfBounds);
                }
                Ok(Some(AnyReader::List(ListReader {
                    seg,
                    first_word: target + 1,
                    count: elem_count,
                    elem_size: elem::COMPOSITE,
                    elem_data_words: tp.data_words,
                    elem_ptr_words: tp.ptr_words,
                })))
            } else {
                let words = ptr::list_content_words(lp.elem_size, lp.count);
                let content_end = target as u64 + words;
                if content_end > seg_words(seg) as u64 {
                    return Err(MessageError::PointerOutOfBounds);
                }
                Ok(Some(AnyReader::List(ListReader {
                    seg,
                    first_word: target,
                    count: lp.count,
                    elem_size: lp.elem_size,
                    elem_data_words: 0,
                    elem_ptr_words: 0,
                })))
            }
        }
        PointerKind::Far => Err(MessageError::UnexpectedPointerType),
        PointerKind::Capability => Ok(Some(AnyReader::Capability(ptr::parse_cap(word)?))),
    }
}

/// Reader over a struct body.
///
/// Field accessors return the zeroed default when the field lies beyond
/// the encoded data section, which is how messages built against an older
/// schema read forward.
#[derive(Debug, Clone, Copy)]
pub struct StructReader<'a> {
    seg: &'a [u8],
    data_word: usize,
    data_words: u16,
    ptr_word: usize,
    ptr_words: u16,
}

impl<'a> StructReader<'a> {
    /// An empty struct: every field reads as its default.
    pub fn empty() -> StructReader<'static> {
        StructReader {
            seg: &[],
            data_word: 0,
            data_words: 0,
            ptr_word: 0,
            ptr_words: 0,
        }
    }

    /// Data section size in words.
    pub fn data_words(&self) -> u16 {
        self.data_words
    }

    /// Pointer section size in words.
    pub fn ptr_count(&self) -> u16 {
        self.ptr_words
    }

    fn data_byte(&self, byte_off: usize) -> u8 {
        if byte_off >= self.data_words as usize * 8 {
            return 0;
        }
        self.seg[self.data_word * 8 + byte_off]
    }

    /// Reads the `i`-th data word, zero when out of range.
    pub fn data_word(&self, i: u16) -> u64 {
        if i >= self.data_words {
            return 0;
        }
        get_word(self.seg, self.data_word + i as usize).unwrap_or(0)
    }

    /// Reads a `u8` at a byte offset into the data section.
    pub fn get_u8(&self, byte_off: usize) -> u8 {
        self.data_byte(byte_off)
    }

    /// Reads a little-endian `u16` at a byte offset.
    pub fn get_u16(&self, byte_off: usize) -> u16 {
        u16::from_le_bytes([self.data_byte(byte_off), self.data_byte(byte_off + 1)])
    }

    /// Reads a little-endian `u32` at a byte offset.
    pub fn get_u32(&self, byte_off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.data_byte(byte_off + i);
        }
        u32::from_le_bytes(bytes)
    }

    /// Reads a little-endian `u64` at a byte offset.
    pub fn get_u64(&self, byte_off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.data_byte(byte_off + i);
        }
        u64::from_le_bytes(bytes)
    }

    /// Reads the boolean at bit index `bit` of the data section.
    pub fn get_bool(&self, bit: usize) -> bool {
        self.data_byte(bit / 8) & (1 << (bit % 8)) != 0
    }

    /// Resolves pointer slot `i`; `None` when the slot is null or out of
    /// range.
    pub fn get_pointer(&self, i: u16) -> Result<Option<AnyReader<'a>>, MessageError> {
        if i >= self.ptr_words {
            return Ok(None);
        }
        resolve_pointer(self.seg, self.ptr_word + i as usize)
    }
}

/// Reader over a list body.
#[derive(Debug, Clone, Copy)]
pub struct ListReader<'a> {
    seg: &'a [u8],
    first_word: usize,
    count: u32,
    elem_size: u8,
    elem_data_words: u16,
    elem_ptr_words: u16,
}

impl<'a> ListReader<'a> {
    /// Element count.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Element size ordinal; see [`crate::ptr::elem`].
    pub fn elem_size(&self) -> u8 {
        self.elem_size
    }

    pub(crate) fn composite_shape(&self) -> Option<(u16, u16)> {
        (self.elem_size == elem::COMPOSITE).then_some((self.elem_data_words, self.elem_ptr_words))
    }

    pub(crate) fn content_words(&self) -> u64 {
        if self.elem_size == elem::COMPOSITE {
            u64::from(self.count) * (self.elem_data_words as u64 + self.elem_ptr_words as u64)
        } else {
            ptr::list_content_words(self.elem_size, self.count)
        }
    }

    pub(crate) fn content_word(&self, k: usize) -> u64 {
        get_word(self.seg, self.first_word + k).unwrap_or(0)
    }

    /// Struct reader for element `i` of a composite list.
    pub fn get_struct(&self, i: u32) -> Option<StructReader<'a>> {
        if self.elem_size != elem::COMPOSITE || i >= self.count {
            return None;
        }
        let stride = self.elem_data_words as usize + self.elem_ptr_words as usize;
        let body = self.first_word + i as usize * stride;
        Some(StructReader {
            seg: self.seg,
            data_word: body,
            data_words: self.elem_data_words,
            ptr_word: body + self.elem_data_words as usize,
            ptr_words: self.elem_ptr_words,
        })
    }

    /// Resolves element `i` of a pointer list.
    pub fn get_pointer(&self, i: u32) -> Result<Option<AnyReader<'a>>, MessageError> {
        if self.elem_size != elem::POINTER || i >= self.count {
            return Ok(None);
        }
        resolve_pointer(self.seg, self.first_word + i as usize)
    }

    /// Raw bytes of a byte list; empty for other element sizes.
    pub fn bytes(&self) -> &'a [u8] {
        if self.elem_size != elem::BYTE {
            return &[];
        }
        let at = self.first_word * 8;
        &self.seg[at..at + self.count as usize]
    }

    /// Decodes the list as NUL-terminated UTF-8 text.
    pub fn text(&self) -> Option<&'a str> {
        let bytes = self.bytes();
        let (last, head) = bytes.split_last()?;
        if *last != 0 {
            return None;
        }
        std::str::from_utf8(head).ok()
    }
}

/// Handle to a struct under construction in a [`MessageBuilder`].
#[derive(Debug, Clone, Copy)]
pub struct StructHandle {
    data_word: usize,
    data_words: u16,
    ptr_word: usize,
    ptr_words: u16,
}

impl StructHandle {
    /// Absolute word index of pointer slot `i`, for walkers that rewrite
    /// pointer words in place.
    pub fn pointer_word(&self, i: u16) -> usize {
        debug_assert!(i < self.ptr_words);
        self.ptr_word + i as usize
    }

    /// Pointer section size in words.
    pub fn ptr_count(&self) -> u16 {
        self.ptr_words
    }
}

/// Handle to a pointer list under construction.
#[derive(Debug, Clone, Copy)]
pub struct ListHandle {
    first_word: usize,
    count: u32,
}

impl ListHandle {
    /// Absolute word index of element `i`'s pointer word.
    pub fn element_word(&self, i: u32) -> usize {
        debug_assert!(i < self.count);
        self.first_word + i as usize
    }

    /// Element count the list was initialized with.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the list was initialized with zero elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Handle to a composite list under construction.
#[derive(Debug, Clone, Copy)]
pub struct CompositeHandle {
    first_word: usize,
    count: u32,
    data_words: u16,
    ptr_words: u16,
}

impl CompositeHandle {
    /// Element count the list was initialized with.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the list was initialized with zero elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Single-segment message builder.
#[derive(Debug)]
pub struct MessageBuilder {
    words: Vec<u64>,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    /// Creates a builder holding only a null root pointer.
    pub fn new() -> Self {
        Self { words: vec![0] }
    }

    fn alloc(&mut self, words: usize) -> usize {
        let at = self.words.len();
        self.words.resize(at + words, 0);
        at
    }

    /// Current segment size in words.
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Raw word read, for payload walkers.
    pub fn word(&self, index: usize) -> u64 {
        self.words[index]
    }

    /// Raw word write, for payload walkers.
    pub fn set_word(&mut self, index: usize, value: u64) {
        self.words[index] = value;
    }

    fn init_struct_at(&mut self, ptr_loc: usize, data_words: u16, ptr_words: u16) -> StructHandle {
        let target = self.alloc(data_words as usize + ptr_words as usize);
        self.words[ptr_loc] =
            ptr::encode_struct((target - ptr_loc - 1) as i32, data_words, ptr_words);
        StructHandle {
            data_word: target,
            data_words,
            ptr_word: target + data_words as usize,
            ptr_words,
        }
    }

    /// Allocates the root struct.
    pub fn init_root(&mut self, data_words: u16, ptr_words: u16) -> StructHandle {
        self.init_struct_at(0, data_words, ptr_words)
    }

    /// Allocates a struct into pointer slot `i` of `parent`.
    pub fn init_struct(&mut self, parent: StructHandle, i: u16, data_words: u16, ptr_words: u16) -> StructHandle {
        self.init_struct_at(parent.pointer_word(i), data_words, ptr_words)
    }

    fn set_data(&mut self, s: StructHandle, byte_off: usize, width: usize, value: u64) {
        debug_assert!(byte_off + width <= s.data_words as usize * 8);
        let word = s.data_word + byte_off / 8;
        let shift = (byte_off % 8) * 8;
        debug_assert!(byte_off % 8 + width <= 8, "field must not straddle a word");
        let mask = if width == 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
        self.words[word] &= !(mask << shift);
        self.words[word] |= (value & mask) << shift;
    }

    /// Writes a `u8` field.
    pub fn set_u8(&mut self, s: StructHandle, byte_off: usize, value: u8) {
        self.set_data(s, byte_off, 1, u64::from(value));
    }

    /// Writes a `u16` field.
    pub fn set_u16(&mut self, s: StructHandle, byte_off: usize, value: u16) {
        self.set_data(s, byte_off, 2, u64::from(value));
    }

    /// Writes a `u32` field.
    pub fn set_u32(&mut self, s: StructHandle, byte_off: usize, value: u32) {
        self.set_data(s, byte_off, 4, u64::from(value));
    }

    /// Writes a `u64` field.
    pub fn set_u64(&mut self, s: StructHandle, byte_off: usize, value: u64) {
        self.set_data(s, byte_off, 8, value);
    }

    /// Writes the boolean at bit index `bit` of the data section.
    pub fn set_bool(&mut self, s: StructHandle, bit: usize, value: bool) {
        debug_assert!(bit < s.data_words as usize * 64);
        let word = s.data_word + bit / 64;
        let mask = 1u64 << (bit % 64);
        if value {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
    }

    /// Writes a capability pointer into slot `i` of `parent`.
    pub fn set_cap(&mut self, parent: StructHandle, i: u16, cap_id: u32) -> Result<(), MessageError> {
        let word = ptr::encode_cap(cap_id)?;
        self.words[parent.pointer_word(i)] = word;
        Ok(())
    }

    /// Allocates a byte list into slot `i` of `parent` and fills it.
    pub fn set_byte_list(&mut self, parent: StructHandle, i: u16, data: &[u8]) {
        let ptr_loc = parent.pointer_word(i);
        let count = data.len() as u32;
        let words = ptr::list_content_words(elem::BYTE, count) as usize;
        let target = self.alloc(words);
        self.words[ptr_loc] = ptr::encode_list((target - ptr_loc - 1) as i32, elem::BYTE, count);
        for (k, byte) in data.iter().enumerate() {
            let word = target + k / 8;
            let shift = (k % 8) * 8;
            self.words[word] |= u64::from(*byte) << shift;
        }
    }

    /// Writes NUL-terminated text into slot `i` of `parent`.
    pub fn set_text(&mut self, parent: StructHandle, i: u16, text: &str) {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.set_byte_list(parent, i, &bytes);
    }

    /// Allocates a pointer list into slot `i` of `parent`. Elements start
    /// null and are filled through [`set_list_cap`](Self::set_list_cap)
    /// or [`copy_from`](Self::copy_from) at the element's word.
    pub fn init_pointer_list(&mut self, parent: StructHandle, i: u16, count: u32) -> ListHandle {
        let ptr_loc = parent.pointer_word(i);
        let target = self.alloc(count as usize);
        self.words[ptr_loc] =
            ptr::encode_list((target - ptr_loc - 1) as i32, elem::POINTER, count);
        ListHandle {
            first_word: target,
            count,
        }
    }

    /// Writes a capability pointer into element `i` of a pointer list.
    pub fn set_list_cap(&mut self, list: ListHandle, i: u32, cap_id: u32) -> Result<(), MessageError> {
        let word = ptr::encode_cap(cap_id)?;
        self.words[list.element_word(i)] = word;
        Ok(())
    }

    /// Allocates a composite list into slot `i` of `parent`.
    pub fn init_composite_list(
        &mut self,
        parent: StructHandle,
        i: u16,
        count: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> CompositeHandle {
        let ptr_loc = parent.pointer_word(i);
        let stride = data_words as usize + ptr_words as usize;
        let total = count as usize * stride;
        let target = self.alloc(1 + total);
        self.words[ptr_loc] =
            ptr::encode_list((target - ptr_loc - 1) as i32, elem::COMPOSITE, total as u32);
        self.words[target] = ptr::encode_composite_tag(count, data_words, ptr_words);
        CompositeHandle {
            first_word: target + 1,
            count,
            data_words,
            ptr_words,
        }
    }

    /// Struct handle for element `i` of a composite list.
    ///
    /// # Panics
    ///
    /// Panics when `i` is out of range.
    pub fn composite_elem(&self, list: CompositeHandle, i: u32) -> StructHandle {
        assert!(i < list.count);
        let stride = list.data_words as usize + list.ptr_words as usize;
        let body = list.first_word + i as usize * stride;
        StructHandle {
            data_word: body,
            data_words: list.data_words,
            ptr_word: body + list.data_words as usize,
            ptr_words: list.ptr_words,
        }
    }

    /// Deep-copies `src` into pointer slot `i` of `parent`.
    pub fn copy_into_slot(
        &mut self,
        parent: StructHandle,
        i: u16,
        src: &AnyReader<'_>,
    ) -> Result<(), MessageError> {
        self.copy_any(parent.pointer_word(i), src, 0)
    }

    /// Deep-copies `src` into the root pointer.
    pub fn set_root_copy(&mut self, src: &AnyReader<'_>) -> Result<(), MessageError> {
        self.copy_any(0, src, 0)
    }

    /// Deep-copies `src` into the pointer word at `ptr_loc`.
    pub fn copy_from(&mut self, ptr_loc: usize, src: &AnyReader<'_>) -> Result<(), MessageError> {
        self.copy_any(ptr_loc, src, 0)
    }

    fn copy_any(
        &mut self,
        ptr_loc: usize,
        src: &AnyReader<'_>,
        depth: usize,
    ) -> Result<(), MessageError> {
        if depth > MAX_POINTER_DEPTH {
            return Err(MessageError::InvalidPointer);
        }
        match src {
            AnyReader::Struct(reader) => {
                let (d, p) = (reader.data_words(), reader.ptr_count());
                let target = self.alloc(d as usize + p as usize);
                self.words[ptr_loc] = ptr::encode_struct((target - ptr_loc - 1) as i32, d, p);
                self.copy_struct_body(target, reader, depth)?;
            }
            AnyReader::List(reader) => {
                if let Some((d, p)) = reader.composite_shape() {
                    let total = reader.content_words() as usize;
                    let target = self.alloc(1 + total);
                    self.words[ptr_loc] =
                        ptr::encode_list((target - ptr_loc - 1) as i32, elem::COMPOSITE, total as u32);
                    self.words[target] = ptr::encode_composite_tag(reader.len(), d, p);
                    let stride = d as usize + p as usize;
                    for idx in 0..reader.len() {
                        let elem_reader = reader.get_struct(idx).expect("composite element");
                        self.copy_struct_body(target + 1 + idx as usize * stride, &elem_reader, depth)?;
                    }
                } else if reader.elem_size() == elem::POINTER {
                    let count = reader.len();
                    let target = self.alloc(count as usize);
                    self.words[ptr_loc] =
                        ptr::encode_list((target - ptr_loc - 1) as i32, elem::POINTER, count);
                    for idx in 0..count {
                        if let Some(child) = reader.get_pointer(idx)? {
                            self.copy_any(target + idx as usize, &child, depth + 1)?;
                        }
                    }
                } else {
                    let words = reader.content_words() as usize;
                    let target = self.alloc(words);
                    self.words[ptr_loc] = ptr::encode_list(
                        (target - ptr_loc - 1) as i32,
                        reader.elem_size(),
                        reader.len(),
                    );
                    for k in 0..words {
                        self.words[target + k] = reader.content_word(k);
                    }
                }
            }
            AnyReader::Capability(id) => {
                self.words[ptr_loc] = ptr::encode_cap(*id)?;
            }
        }
        Ok(())
    }

    fn copy_struct_body(
        &mut self,
        body_word: usize,
        reader: &StructReader<'_>,
        depth: usize,
    ) -> Result<(), MessageError> {
        let (d, p) = (reader.data_words(), reader.ptr_count());
        for w in 0..d {
            self.words[body_word + w as usize] = reader.data_word(w);
        }
        for i in 0..p {
            if let Some(child) = reader.get_pointer(i)? {
                self.copy_any(body_word + d as usize + i as usize, &child, depth + 1)?;
            }
        }
        Ok(())
    }

    /// Serializes the builder as a single-segment frame.
    pub fn into_frame(self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.words.len() * 8);
        out.put_u32_le(0); // one segment
        out.put_u32_le(self.words.len() as u32);
        for word in &self.words {
            out.put_u64_le(*word);
        }
        out.freeze()
    }

    /// Serializes the builder as a bare segment, without a frame header.
    pub fn into_segment(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.words.len() * 8);
        for word in &self.words {
            out.put_u64_le(*word);
        }
        out.freeze()
    }
}

/// Serializes a single resolved pointer into an owned segment whose root
/// pointer leads to a deep copy of `src`.
///
/// This is the clone-any-pointer primitive: peer state that must outlive
/// the frame it arrived in (third-party payloads, cached answers) is
/// parked in this shape and re-read through [`Message::from_segment`].
pub fn clone_pointer(src: &AnyReader<'_>) -> Result<Bytes, MessageError> {
    let mut builder = MessageBuilder::new();
    builder.set_root_copy(src)?;
    Ok(builder.into_segment())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_struct_fields() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(2, 1);
        b.set_u32(root, 0, 0xdead_beef);
        b.set_u16(root, 4, 7);
        b.set_u64(root, 8, u64::MAX);
        b.set_bool(root, 49, true);
        let child = b.init_struct(root, 0, 1, 0);
        b.set_u8(child, 3, 42);

        let msg = Message::from_segment(b.into_segment());
        let root = msg.root_struct().unwrap();
        assert_eq!(root.get_u32(0), 0xdead_beef);
        assert_eq!(root.get_u16(4), 7);
        assert_eq!(root.get_u64(8), u64::MAX);
        assert!(root.get_bool(49));
        assert!(!root.get_bool(48));
        let child = root.get_pointer(0).unwrap().unwrap().as_struct().unwrap();
        assert_eq!(child.get_u8(3), 42);
        // out-of-range reads default to zero
        assert_eq!(child.get_u64(8), 0);
        assert!(root.get_pointer(1).unwrap().is_none());
    }

    #[test]
    fn round_trip_text_and_bytes() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(0, 2);
        b.set_text(root, 0, "hello");
        b.set_byte_list(root, 1, &[1, 2, 3]);

        let msg = Message::from_segment(b.into_segment());
        let root = msg.root_struct().unwrap();
        let text = root.get_pointer(0).unwrap().unwrap().as_list().unwrap();
        assert_eq!(text.text(), Some("hello"));
        let data = root.get_pointer(1).unwrap().unwrap().as_list().unwrap();
        assert_eq!(data.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn round_trip_composite_list() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(0, 1);
        let list = b.init_composite_list(root, 0, 3, 1, 1);
        for i in 0..3 {
            let elem = b.composite_elem(list, i);
            b.set_u32(elem, 0, i * 10);
            b.set_text(elem, 0, "x");
        }

        let msg = Message::from_segment(b.into_segment());
        let root = msg.root_struct().unwrap();
        let list = root.get_pointer(0).unwrap().unwrap().as_list().unwrap();
        assert_eq!(list.len(), 3);
        for i in 0..3 {
            let elem = list.get_struct(i).unwrap();
            assert_eq!(elem.get_u32(0), i * 10);
            let text = elem.get_pointer(0).unwrap().unwrap().as_list().unwrap();
            assert_eq!(text.text(), Some("x"));
        }
    }

    #[test]
    fn capability_pointer_round_trip() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(0, 1);
        b.set_cap(root, 0, 29).unwrap();

        let msg = Message::from_segment(b.into_segment());
        let root = msg.root_struct().unwrap();
        let cap = root.get_pointer(0).unwrap().unwrap();
        assert_eq!(cap.as_capability(), Some(29));
    }

    #[test]
    fn deep_copy_preserves_tree() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(1, 2);
        b.set_u32(root, 0, 11);
        let inner = b.init_struct(root, 0, 0, 1);
        b.set_cap(inner, 0, 5).unwrap();
        b.set_text(root, 1, "copied");
        let original = Message::from_segment(b.into_segment());

        let src = original.root().unwrap().unwrap();
        let cloned = clone_pointer(&src).unwrap();
        let msg = Message::from_segment(cloned);
        let root = msg.root_struct().unwrap();
        assert_eq!(root.get_u32(0), 11);
        let inner = root.get_pointer(0).unwrap().unwrap().as_struct().unwrap();
        assert_eq!(
            inner.get_pointer(0).unwrap().unwrap().as_capability(),
            Some(5)
        );
        let text = root.get_pointer(1).unwrap().unwrap().as_list().unwrap();
        assert_eq!(text.text(), Some("copied"));
    }

    #[test]
    fn far_pointer_is_rejected() {
        let mut seg = Vec::new();
        seg.extend_from_slice(&0b10u64.to_le_bytes());
        let msg = Message::from_segment(Bytes::from(seg));
        assert!(matches!(
            msg.root(),
            Err(MessageError::UnexpectedPointerType)
        ));
    }

    #[test]
    fn out_of_bounds_struct_pointer_is_rejected() {
        // Struct pointer claiming one data word with nothing behind it.
        let word = ptr::encode_struct(0, 1, 0);
        let msg = Message::from_segment(Bytes::from(word.to_le_bytes().to_vec()));
        assert!(matches!(msg.root(), Err(MessageError::PointerOutOfBounds)));
    }

    #[test]
    fn key_bytes_from_any_reader() {
        let mut b = MessageBuilder::new();
        let root = b.init_root(0, 1);
        b.set_byte_list(root, 0, b"K");
        let msg = Message::from_segment(b.into_segment());
        let root = msg.root_struct().unwrap();
        let any = root.get_pointer(0).unwrap().unwrap();
        assert_eq!(any.as_key_bytes(), Some(b"K".to_vec()));
    }
}
