//! Raw pointer-word codec.
//!
//! Every pointer is a single little-endian word whose least-significant
//! two bits select the kind:
//!
//! - `0b00` struct: signed 30-bit word offset (bits 2..32) from the end
//!   of the pointer word to the struct body, 16-bit data size (bits
//!   32..48) and 16-bit pointer-section size (bits 48..64), in words;
//! - `0b01` list: same offset, 3-bit element size (bits 32..35), 29-bit
//!   element count (bits 35..64; total words for composite lists);
//! - `0b10` far: inter-segment pointer, not decoded by this engine;
//! - `0b11` capability: `cap_id << 2 | 0b11` with the high 32 bits zero,
//!   `cap_id < 2^30`.
//!
//! The helpers here are pure word math so that readers, the builder, and
//! the capability walkers all agree on one encoding.

use crate::message::MessageError;

/// Exclusive upper bound on capability ids.
pub const MAX_CAP_ID: u32 = 1 << 30;

/// List element size ordinals.
pub mod elem {
    /// Zero-width elements.
    pub const VOID: u8 = 0;
    /// One bit per element.
    pub const BIT: u8 = 1;
    /// One byte per element. Text and data lists use this size.
    pub const BYTE: u8 = 2;
    /// Two bytes per element.
    pub const TWO_BYTES: u8 = 3;
    /// Four bytes per element.
    pub const FOUR_BYTES: u8 = 4;
    /// Eight bytes per element.
    pub const EIGHT_BYTES: u8 = 5;
    /// One pointer word per element.
    pub const POINTER: u8 = 6;
    /// Inline composite: a tag word followed by packed struct bodies.
    pub const COMPOSITE: u8 = 7;
}

/// Pointer kind selected by the low two bits of a non-null word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// Struct pointer.
    Struct,
    /// List pointer.
    List,
    /// Far pointer (inter-segment; rejected by this engine).
    Far,
    /// Capability pointer.
    Capability,
}

/// Classifies a non-null pointer word.
pub fn kind(word: u64) -> PointerKind {
    match word & 0b11 {
        0 => PointerKind::Struct,
        1 => PointerKind::List,
        2 => PointerKind::Far,
        _ => PointerKind::Capability,
    }
}

/// Decoded struct pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructPointer {
    /// Signed word offset from the end of the pointer word.
    pub offset: i32,
    /// Data section size in words.
    pub data_words: u16,
    /// Pointer section size in words.
    pub ptr_words: u16,
}

/// Decoded list pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListPointer {
    /// Signed word offset from the end of the pointer word.
    pub offset: i32,
    /// Element size ordinal; see [`elem`].
    pub elem_size: u8,
    /// Element count, or total content words for composite lists.
    pub count: u32,
}

fn signed_offset(word: u64) -> i32 {
    // The offset occupies bits 2..32; arithmetic shift restores the sign.
    (word as u32 as i32) >> 2
}

/// Decodes a struct pointer word. The caller has already checked the kind.
pub fn parse_struct(word: u64) -> StructPointer {
    StructPointer {
        offset: signed_offset(word),
        data_words: (word >> 32) as u16,
        ptr_words: (word >> 48) as u16,
    }
}

/// Encodes a struct pointer word.
pub fn encode_struct(offset: i32, data_words: u16, ptr_words: u16) -> u64 {
    let low = (offset << 2) as u32;
    u64::from(low) | (u64::from(data_words) << 32) | (u64::from(ptr_words) << 48)
}

/// Decodes a list pointer word. The caller has already checked the kind.
pub fn parse_list(word: u64) -> ListPointer {
    ListPointer {
        offset: signed_offset(word),
        elem_size: ((word >> 32) & 0b111) as u8,
        count: (word >> 35) as u32,
    }
}

/// Encodes a list pointer word.
pub fn encode_list(offset: i32, elem_size: u8, count: u32) -> u64 {
    let low = ((offset << 2) | 1) as u32;
    u64::from(low) | (u64::from(elem_size & 0b111) << 32) | (u64::from(count) << 35)
}

/// Encodes the tag word that precedes composite list elements.
///
/// The tag word is struct-shaped with the element count stored in the
/// offset slot.
pub fn encode_composite_tag(count: u32, data_words: u16, ptr_words: u16) -> u64 {
    encode_struct(count as i32, data_words, ptr_words)
}

/// Decodes a capability pointer word.
///
/// The high half must be zero; anything else is a malformed pointer
/// rather than a capability with a large id.
pub fn parse_cap(word: u64) -> Result<u32, MessageError> {
    if word >> 32 != 0 {
        return Err(MessageError::InvalidPointer);
    }
    Ok((word as u32) >> 2)
}

/// Encodes a capability pointer word for `cap_id`.
pub fn encode_cap(cap_id: u32) -> Result<u64, MessageError> {
    if cap_id >= MAX_CAP_ID {
        return Err(MessageError::CapabilityIdTooLarge);
    }
    Ok(u64::from((cap_id << 2) | 0b11))
}

/// Bits per element for the fixed-width element sizes.
///
/// # Panics
///
/// Panics on [`elem::COMPOSITE`], whose width lives in its tag word.
pub fn elem_bits(elem_size: u8) -> u32 {
    match elem_size {
        elem::VOID => 0,
        elem::BIT => 1,
        elem::BYTE => 8,
        elem::TWO_BYTES => 16,
        elem::FOUR_BYTES => 32,
        elem::EIGHT_BYTES | elem::POINTER => 64,
        _ => panic!("composite lists have no fixed element width"),
    }
}

/// Content words occupied by a fixed-width list of `count` elements.
pub fn list_content_words(elem_size: u8, count: u32) -> u64 {
    let bits = u64::from(elem_bits(elem_size)) * u64::from(count);
    bits.div_ceil(64)
}
