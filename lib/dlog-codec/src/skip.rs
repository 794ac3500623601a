use crate::{
    error::{Error, Result},
    input::Input,
    item::ItemKind,
    parse::parse_item_head,
};

/// One open container on the skip stack.
#[derive(Clone, Copy)]
enum Pending {
    /// `n` more items to pass over.
    Items(u64),
    /// Items until the break byte.
    UntilBreak,
}

/// Skips over one complete item, including nested container contents.
///
/// A break byte encountered outside an indefinite container is an
/// [`Error::ItemTypeMismatch`], matching the grammar.
pub fn skip_item<I: Input + ?Sized>(input: &mut I) -> Result<()> {
    let mut stack: Vec<Pending> = Vec::new();
    let mut remaining: u64 = 1;

    loop {
        while remaining == 0 {
            match stack.pop() {
                Some(Pending::Items(n)) => remaining = n,
                Some(Pending::UntilBreak) => unreachable!("breaks pop eagerly"),
                None => return Ok(()),
            }
        }

        let head = parse_item_head(input)?;
        match head.kind {
            ItemKind::PosInt | ItemKind::NegInt | ItemKind::Null => {
                remaining -= 1;
            }
            ItemKind::Binary | ItemKind::Text => {
                skip_payload(input, head.value)?;
                remaining -= 1;
            }
            ItemKind::Array | ItemKind::Map => {
                let multiplier = if head.kind == ItemKind::Map { 2 } else { 1 };
                remaining -= 1;
                if head.indefinite {
                    stack.push(Pending::Items(remaining));
                    stack.push(Pending::UntilBreak);
                    remaining = u64::MAX;
                } else if head.value != 0 {
                    let nested = head
                        .value
                        .checked_mul(multiplier)
                        .ok_or(Error::ItemValueOutOfRange)?;
                    stack.push(Pending::Items(remaining));
                    remaining = nested;
                }
            }
            ItemKind::Break => match stack.last() {
                Some(Pending::UntilBreak) => {
                    stack.pop();
                    remaining = 0;
                }
                _ => return Err(Error::ItemTypeMismatch),
            },
        }
    }
}

fn skip_payload<I: Input + ?Sized>(input: &mut I, len: u64) -> Result<()> {
    let mut left = usize::try_from(len).map_err(|_| Error::ItemValueOutOfRange)?;
    while left > 0 {
        let buffered = input.require(1)?;
        let take = buffered.len().min(left);
        input.consume(take);
        left -= take;
    }
    Ok(())
}
