use crate::error::{Error, Result};

/// Largest possible item head: one initial byte plus an 8-byte extension.
pub const MAX_ITEM_HEAD_SIZE: usize = 9;

pub(crate) const MAJOR_POSINT: u8 = 0 << 5;
pub(crate) const MAJOR_NEGINT: u8 = 1 << 5;
pub(crate) const MAJOR_BINARY: u8 = 2 << 5;
pub(crate) const MAJOR_TEXT: u8 = 3 << 5;
pub(crate) const MAJOR_ARRAY: u8 = 4 << 5;
pub(crate) const MAJOR_MAP: u8 = 5 << 5;

pub(crate) const AI_MASK: u8 = 0x1f;
pub(crate) const AI_INDEFINITE: u8 = 31;

/// Encoded null item.
pub(crate) const NULL_BYTE: u8 = 0xf6;
/// Break byte terminating an indefinite-length container.
pub(crate) const BREAK_BYTE: u8 = 0xff;

/// Type of a decoded item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
    PosInt,
    NegInt,
    Binary,
    Text,
    Array,
    Map,
    Null,
    Break,
}

/// Decoded head of a self-describing item.
///
/// For integers `value` is the payload itself; for strings it is the byte
/// length; for containers it is the element (or pair) count. Indefinite
/// containers carry `indefinite == true` and a meaningless `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemHead {
    pub kind: ItemKind,
    pub value: u64,
    pub indefinite: bool,
}

impl ItemHead {
    pub(crate) fn definite(kind: ItemKind, value: u64) -> Self {
        Self {
            kind,
            value,
            indefinite: false,
        }
    }
}

/// Number of bytes the head for `value` occupies with minimal-width coding.
pub const fn posint_head_size(value: u64) -> usize {
    if value < 24 {
        1
    } else if value <= u8::MAX as u64 {
        2
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Encoded size of a byte string of length `len`.
pub const fn binary_size(len: usize) -> u64 {
    posint_head_size(len as u64) as u64 + len as u64
}

/// Encoded size of a text string of length `len`.
pub const fn text_size(len: usize) -> u64 {
    binary_size(len)
}

/// Decodes `major`/`ai` into an [`ItemHead`] kind, rejecting majors that are
/// not part of the supported grammar.
pub(crate) fn classify(initial: u8) -> Result<ItemKind> {
    match initial & !AI_MASK {
        MAJOR_POSINT => Ok(ItemKind::PosInt),
        MAJOR_NEGINT => Ok(ItemKind::NegInt),
        MAJOR_BINARY => Ok(ItemKind::Binary),
        MAJOR_TEXT => Ok(ItemKind::Text),
        MAJOR_ARRAY => Ok(ItemKind::Array),
        MAJOR_MAP => Ok(ItemKind::Map),
        _ => match initial {
            NULL_BYTE => Ok(ItemKind::Null),
            BREAK_BYTE => Ok(ItemKind::Break),
            _ => Err(Error::ItemTypeMismatch),
        },
    }
}
