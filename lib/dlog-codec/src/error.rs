use std::io;

use snafu::Snafu;

/// Error raised while encoding or decoding self-describing items.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The decoded item head does not have the expected type.
    #[snafu(display("encountered an item of an unexpected type"))]
    ItemTypeMismatch,

    /// The decoded value does not fit the target type.
    #[snafu(display("the decoded value lies outside the representable range"))]
    ItemValueOutOfRange,

    /// A tuple (fixed-size array) head carried the wrong element count.
    #[snafu(display("the tuple has an unexpected number of elements"))]
    TupleSizeMismatch,

    /// The additional-information bits of an item head are reserved.
    #[snafu(display("reserved additional-information coding"))]
    OversizedAdditionalInformationCoding,

    /// The input ended in the middle of an item.
    #[snafu(display("the input is missing data at its end"))]
    MissingData,

    /// The underlying stream ended before the item was complete.
    #[snafu(display("unexpected end of stream"))]
    EndOfStream,

    /// A buffer allocation failed.
    #[snafu(display("not enough memory to grow the codec buffer"))]
    NotEnoughMemory,

    /// The output buffer cannot hold the encoded item.
    #[snafu(display("not enough space left in the output buffer"))]
    NotEnoughSpace,

    /// The underlying stream failed.
    #[snafu(display("stream I/O error: {source}"))]
    #[snafu(context(false))]
    Io { source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
