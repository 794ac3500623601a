use crate::{
    error::Result,
    item::{
        AI_INDEFINITE, BREAK_BYTE, MAJOR_ARRAY, MAJOR_BINARY, MAJOR_MAP, MAJOR_NEGINT,
        MAJOR_POSINT, MAJOR_TEXT, NULL_BYTE,
    },
    output::Output,
};

pub use crate::item::{binary_size, posint_head_size, text_size};

fn emit_head<O: Output + ?Sized>(out: &mut O, major: u8, value: u64) -> Result<()> {
    let head_size = posint_head_size(value);
    out.ensure_capacity(head_size)?;
    let buf = out.writable();
    match head_size {
        1 => buf[0] = major | value as u8,
        2 => {
            buf[0] = major | 24;
            buf[1] = value as u8;
        }
        3 => {
            buf[0] = major | 25;
            buf[1..3].copy_from_slice(&(value as u16).to_be_bytes());
        }
        5 => {
            buf[0] = major | 26;
            buf[1..5].copy_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            buf[0] = major | 27;
            buf[1..9].copy_from_slice(&value.to_be_bytes());
        }
    }
    out.commit(head_size);
    Ok(())
}

/// Emits a positive integer with minimal-width coding.
pub fn emit_uint<O: Output + ?Sized>(out: &mut O, value: u64) -> Result<()> {
    emit_head(out, MAJOR_POSINT, value)
}

/// Emits a signed integer, choosing the positive or negative major type.
pub fn emit_int<O: Output + ?Sized>(out: &mut O, value: i64) -> Result<()> {
    if value >= 0 {
        emit_head(out, MAJOR_POSINT, value as u64)
    } else {
        emit_head(out, MAJOR_NEGINT, !(value as u64))
    }
}

/// Emits a positive integer in the fixed nine-byte form regardless of value.
///
/// Timestamps use this coding so that every record has the same layout and
/// the consumer can patch or compare them in place.
pub fn emit_uint_fixed<O: Output + ?Sized>(out: &mut O, value: u64) -> Result<()> {
    out.ensure_capacity(9)?;
    let buf = out.writable();
    buf[0] = MAJOR_POSINT | 27;
    buf[1..9].copy_from_slice(&value.to_be_bytes());
    out.commit(9);
    Ok(())
}

/// Emits a byte string (head plus payload).
pub fn emit_binary<O: Output + ?Sized>(out: &mut O, bytes: &[u8]) -> Result<()> {
    emit_head(out, MAJOR_BINARY, bytes.len() as u64)?;
    out.write_all(bytes)
}

/// Emits just the head of a byte string of length `len`.
pub fn emit_binary_head<O: Output + ?Sized>(out: &mut O, len: u64) -> Result<()> {
    emit_head(out, MAJOR_BINARY, len)
}

/// Emits a UTF-8 text string (head plus payload).
pub fn emit_text<O: Output + ?Sized>(out: &mut O, text: &str) -> Result<()> {
    emit_head(out, MAJOR_TEXT, text.len() as u64)?;
    out.write_all(text.as_bytes())
}

/// Emits an array head for `len` elements.
pub fn emit_array<O: Output + ?Sized>(out: &mut O, len: u64) -> Result<()> {
    emit_head(out, MAJOR_ARRAY, len)
}

/// Emits a map head for `len` key/value pairs.
pub fn emit_map<O: Output + ?Sized>(out: &mut O, len: u64) -> Result<()> {
    emit_head(out, MAJOR_MAP, len)
}

/// Opens an indefinite-length array; close it with [`emit_break`].
pub fn emit_array_indefinite<O: Output + ?Sized>(out: &mut O) -> Result<()> {
    out.write_all(&[MAJOR_ARRAY | AI_INDEFINITE])
}

/// Emits the null item.
pub fn emit_null<O: Output + ?Sized>(out: &mut O) -> Result<()> {
    out.write_all(&[NULL_BYTE])
}

/// Emits the break byte terminating an indefinite-length container.
pub fn emit_break<O: Output + ?Sized>(out: &mut O) -> Result<()> {
    out.write_all(&[BREAK_BYTE])
}
