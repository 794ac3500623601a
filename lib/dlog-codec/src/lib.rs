//! Self-describing binary item codec.
//!
//! The grammar is a compact subset of CBOR: positive/negative integers,
//! byte strings, text strings, arrays, maps, indefinite-length containers
//! terminated by a break byte, and null. Every item carries its own type
//! and length, so a reader can always skip data it does not understand.
//!
//! Encoding always chooses the minimal integer width. Decoding tolerates
//! wider-than-necessary encodings (the runtime deliberately emits a fixed
//! nine-byte timestamp) but rejects the reserved additional-information
//! values.
//!
//! Composite operations are driven through the [`Output`] and [`Input`]
//! abstractions so the same item emitters can target a fixed shared-memory
//! slot, a growable staging buffer, or a chunked stream.

mod emit;
mod error;
mod input;
mod item;
mod output;
mod parse;
mod skip;

pub use self::{
    emit::*,
    error::{Error, Result},
    input::{Input, SliceInput},
    item::{ItemHead, ItemKind, MAX_ITEM_HEAD_SIZE},
    output::{Output, SliceOutput, VecOutput},
    parse::*,
    skip::skip_item,
};

/// A value that can be written out as a self-describing item sequence.
pub trait Encode {
    /// Exact number of bytes [`encode`](Self::encode) will produce.
    fn encoded_size(&self) -> u64;

    /// Writes the value into `out`.
    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()>;
}

/// A value that can be reconstructed from a self-describing item sequence.
pub trait Decode: Sized {
    /// Reads one value from `input`.
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self>;
}

impl Encode for u64 {
    fn encoded_size(&self) -> u64 {
        posint_head_size(*self) as u64
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_uint(out, *self)
    }
}

impl Decode for u64 {
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self> {
        parse_u64(input)
    }
}

impl Encode for u32 {
    fn encoded_size(&self) -> u64 {
        u64::from(*self).encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_uint(out, u64::from(*self))
    }
}

impl Decode for u32 {
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self> {
        parse_u32(input)
    }
}

impl Encode for i64 {
    fn encoded_size(&self) -> u64 {
        let raw = if *self >= 0 {
            *self as u64
        } else {
            !(*self as u64)
        };
        posint_head_size(raw) as u64
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_int(out, *self)
    }
}

impl Decode for i64 {
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self> {
        parse_i64(input)
    }
}

impl Encode for str {
    fn encoded_size(&self) -> u64 {
        text_size(self.len())
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_text(out, self)
    }
}

impl Encode for String {
    fn encoded_size(&self) -> u64 {
        self.as_str().encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_text(out, self)
    }
}

impl Decode for String {
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self> {
        parse_text(input)
    }
}

impl Encode for [u8] {
    fn encoded_size(&self) -> u64 {
        binary_size(self.len())
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_binary(out, self)
    }
}

impl Encode for Vec<u8> {
    fn encoded_size(&self) -> u64 {
        self.as_slice().encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> Result<()> {
        emit_binary(out, self)
    }
}

impl Decode for Vec<u8> {
    fn decode<I: Input + ?Sized>(input: &mut I) -> Result<Self> {
        parse_binary(input)
    }
}
