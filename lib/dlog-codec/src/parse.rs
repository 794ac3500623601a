use crate::{
    error::{Error, Result},
    input::Input,
    item::{classify, ItemHead, ItemKind, AI_INDEFINITE, AI_MASK},
};

/// Reads and consumes one item head.
pub fn parse_item_head<I: Input + ?Sized>(input: &mut I) -> Result<ItemHead> {
    let initial = input.require(1)?[0];
    let kind = classify(initial)?;

    match kind {
        ItemKind::Null | ItemKind::Break => {
            input.consume(1);
            return Ok(ItemHead::definite(kind, 0));
        }
        _ => {}
    }

    let ai = initial & AI_MASK;
    let (value, head_size) = match ai {
        0..=23 => (u64::from(ai), 1),
        24 => {
            let buf = input.require(2)?;
            (u64::from(buf[1]), 2)
        }
        25 => {
            let buf = input.require(3)?;
            (u64::from(u16::from_be_bytes([buf[1], buf[2]])), 3)
        }
        26 => {
            let buf = input.require(5)?;
            (
                u64::from(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]])),
                5,
            )
        }
        27 => {
            let buf = input.require(9)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[1..9]);
            (u64::from_be_bytes(raw), 9)
        }
        AI_INDEFINITE => {
            match kind {
                // Indefinite integers do not exist; strings are not
                // emitted in chunked form by this codec.
                ItemKind::Array | ItemKind::Map => {}
                _ => return Err(Error::ItemTypeMismatch),
            }
            input.consume(1);
            return Ok(ItemHead {
                kind,
                value: 0,
                indefinite: true,
            });
        }
        _ => return Err(Error::OversizedAdditionalInformationCoding),
    };

    input.consume(head_size);
    Ok(ItemHead::definite(kind, value))
}

/// Reads an item head and checks that it is a definite item of `kind`.
pub fn expect_item_head<I: Input + ?Sized>(input: &mut I, kind: ItemKind, value: u64) -> Result<()> {
    let head = parse_item_head(input)?;
    if head.kind != kind || head.indefinite {
        return Err(Error::ItemTypeMismatch);
    }
    if head.value != value {
        return Err(match kind {
            ItemKind::Array | ItemKind::Map => Error::TupleSizeMismatch,
            _ => Error::ItemValueOutOfRange,
        });
    }
    Ok(())
}

/// Reads a definite array head and returns its element count.
pub fn parse_array_head<I: Input + ?Sized>(input: &mut I) -> Result<u64> {
    let head = parse_item_head(input)?;
    if head.kind != ItemKind::Array || head.indefinite {
        return Err(Error::ItemTypeMismatch);
    }
    Ok(head.value)
}

/// Reads a definite map head and returns its pair count.
pub fn parse_map_head<I: Input + ?Sized>(input: &mut I) -> Result<u64> {
    let head = parse_item_head(input)?;
    if head.kind != ItemKind::Map || head.indefinite {
        return Err(Error::ItemTypeMismatch);
    }
    Ok(head.value)
}

/// Reads a positive integer of any width.
pub fn parse_u64<I: Input + ?Sized>(input: &mut I) -> Result<u64> {
    let head = parse_item_head(input)?;
    if head.kind != ItemKind::PosInt {
        return Err(Error::ItemTypeMismatch);
    }
    Ok(head.value)
}

/// Reads a positive integer that must fit `u32`.
pub fn parse_u32<I: Input + ?Sized>(input: &mut I) -> Result<u32> {
    let value = parse_u64(input)?;
    u32::try_from(value).map_err(|_| Error::ItemValueOutOfRange)
}

/// Reads a positive integer bounded by `max`.
pub fn parse_u64_max<I: Input + ?Sized>(input: &mut I, max: u64) -> Result<u64> {
    let value = parse_u64(input)?;
    if value > max {
        return Err(Error::ItemValueOutOfRange);
    }
    Ok(value)
}

/// Reads a signed integer from either integer major type.
pub fn parse_i64<I: Input + ?Sized>(input: &mut I) -> Result<i64> {
    let head = parse_item_head(input)?;
    match head.kind {
        ItemKind::PosInt => i64::try_from(head.value).map_err(|_| Error::ItemValueOutOfRange),
        ItemKind::NegInt => {
            if head.value > i64::MAX as u64 {
                return Err(Error::ItemValueOutOfRange);
            }
            Ok(!(head.value as i64))
        }
        _ => Err(Error::ItemTypeMismatch),
    }
}

/// Reads a byte string into a fresh vector.
pub fn parse_binary<I: Input + ?Sized>(input: &mut I) -> Result<Vec<u8>> {
    let head = parse_item_head(input)?;
    if head.kind != ItemKind::Binary || head.indefinite {
        return Err(Error::ItemTypeMismatch);
    }
    let len = usize::try_from(head.value).map_err(|_| Error::ItemValueOutOfRange)?;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Reads a byte string of exactly `dst.len()` bytes into `dst`.
pub fn parse_binary_exact<I: Input + ?Sized>(input: &mut I, dst: &mut [u8]) -> Result<()> {
    expect_item_head(input, ItemKind::Binary, dst.len() as u64)?;
    input.read_exact(dst)
}

/// Reads a UTF-8 text string.
pub fn parse_text<I: Input + ?Sized>(input: &mut I) -> Result<String> {
    let head = parse_item_head(input)?;
    if head.kind != ItemKind::Text || head.indefinite {
        return Err(Error::ItemTypeMismatch);
    }
    let len = usize::try_from(head.value).map_err(|_| Error::ItemValueOutOfRange)?;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::ItemValueOutOfRange)
}

/// Consumes a null item if one is next; returns whether it did.
pub fn try_parse_null<I: Input + ?Sized>(input: &mut I) -> Result<bool> {
    let buf = input.require(1)?;
    if buf[0] == crate::item::NULL_BYTE {
        input.consume(1);
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{emit, input::SliceInput, output::VecOutput};

    fn encode_with(build: impl FnOnce(&mut VecOutput)) -> Vec<u8> {
        let mut out = VecOutput::new();
        build(&mut out);
        out.into_bytes()
    }

    #[test]
    fn uint_widths_are_minimal() {
        for (value, expected) in [
            (0u64, 1usize),
            (23, 1),
            (24, 2),
            (255, 2),
            (256, 3),
            (65535, 3),
            (65536, 5),
            (u64::from(u32::MAX), 5),
            (u64::from(u32::MAX) + 1, 9),
            (u64::MAX, 9),
        ] {
            let bytes = encode_with(|out| emit::emit_uint(out, value).unwrap());
            assert_eq!(bytes.len(), expected, "value {value}");
            assert_eq!(emit::posint_head_size(value), expected);
        }
    }

    #[test]
    fn fixed_width_uint_decodes_like_any_other() {
        let bytes = encode_with(|out| emit::emit_uint_fixed(out, 17).unwrap());
        assert_eq!(bytes.len(), 9);
        let mut input = SliceInput::new(&bytes);
        assert_eq!(parse_u64(&mut input).unwrap(), 17);
    }

    #[test]
    fn reserved_additional_information_is_rejected() {
        for ai in [28u8, 29, 30] {
            let bytes = [ai];
            let mut input = SliceInput::new(&bytes);
            assert!(matches!(
                parse_item_head(&mut input),
                Err(Error::OversizedAdditionalInformationCoding)
            ));
        }
    }

    #[test]
    fn indefinite_integers_are_rejected() {
        let bytes = [0x1f];
        let mut input = SliceInput::new(&bytes);
        assert!(matches!(
            parse_item_head(&mut input),
            Err(Error::ItemTypeMismatch)
        ));
    }

    #[test]
    fn narrowing_out_of_range_fails() {
        let bytes = encode_with(|out| emit::emit_uint(out, u64::from(u32::MAX) + 1).unwrap());
        let mut input = SliceInput::new(&bytes);
        assert!(matches!(
            parse_u32(&mut input),
            Err(Error::ItemValueOutOfRange)
        ));
    }

    #[test]
    fn null_is_optional() {
        let bytes = encode_with(|out| {
            emit::emit_null(out).unwrap();
            emit::emit_uint(out, 7).unwrap();
        });
        let mut input = SliceInput::new(&bytes);
        assert!(try_parse_null(&mut input).unwrap());
        assert!(!try_parse_null(&mut input).unwrap());
        assert_eq!(parse_u64(&mut input).unwrap(), 7);
    }

    proptest! {
        #[test]
        fn uint_round_trip(value in any::<u64>()) {
            let bytes = encode_with(|out| emit::emit_uint(out, value).unwrap());
            let mut input = SliceInput::new(&bytes);
            prop_assert_eq!(parse_u64(&mut input).unwrap(), value);
            prop_assert!(input.is_empty());
        }

        #[test]
        fn int_round_trip(value in any::<i64>()) {
            let bytes = encode_with(|out| emit::emit_int(out, value).unwrap());
            let mut input = SliceInput::new(&bytes);
            prop_assert_eq!(parse_i64(&mut input).unwrap(), value);
            prop_assert!(input.is_empty());
        }

        #[test]
        fn text_round_trip(value in ".{0,64}") {
            let bytes = encode_with(|out| emit::emit_text(out, &value).unwrap());
            let mut input = SliceInput::new(&bytes);
            prop_assert_eq!(parse_text(&mut input).unwrap(), value);
        }

        #[test]
        fn binary_round_trip(value in proptest::collection::vec(any::<u8>(), 0..512)) {
            let bytes = encode_with(|out| emit::emit_binary(out, &value).unwrap());
            let mut input = SliceInput::new(&bytes);
            prop_assert_eq!(parse_binary(&mut input).unwrap(), value);
        }
    }
}
