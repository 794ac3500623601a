use std::io;

use snafu::Snafu;

/// Error raised by the logging runtime.
///
/// Every fallible operation returns one of these; expected failures never
/// panic. The producer allocation path distinguishes the transient
/// [`NotEnoughSpace`](Error::NotEnoughSpace) (retry on another region, or
/// let the caller drop the message) from genuine allocation failure
/// ([`NotEnoughMemory`](Error::NotEnoughMemory)) and from wire corruption,
/// which the consumer downgrades to a malformed classification instead of
/// propagating.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// An external API did not meet its operation contract.
    #[snafu(display("an external API did not meet its operation contract"))]
    Bad,

    #[snafu(display("invalid argument"))]
    InvalidArgument,

    #[snafu(display("the operation did not succeed due to an allocation failure"))]
    NotEnoughMemory,

    /// The operation failed to allocate a write buffer of sufficient size.
    #[snafu(display("the operation failed to allocate a write buffer of sufficient size"))]
    NotEnoughSpace,

    #[snafu(display("the file or message is missing data at its end"))]
    MissingData,

    /// The catalog file does not start with a valid header.
    #[snafu(display("the catalog file does not start with a valid header"))]
    InvalidFileDatabaseHeader,

    /// The record container file does not start with a valid header.
    #[snafu(display("the record container file does not start with a valid header"))]
    InvalidRecordContainerHeader,

    #[snafu(display("failed to unlink one or more of the referenced record containers"))]
    ContainerUnlinkFailed,

    #[snafu(display("failed to obtain an exclusive lock for the container file in time"))]
    ContainerCouldNotBeLocked,

    #[snafu(display("failed to unlink one or more of the referenced message buses"))]
    MessageBusUnlinkFailed,

    #[snafu(display("could not decode a serialized argument due to an unknown type id"))]
    UnknownArgumentTypeId,

    #[snafu(display("could not decode a serialized attribute due to an unknown type id"))]
    UnknownAttributeTypeId,

    /// The given sink is not attached to this log fabric.
    #[snafu(display("the given sink is not attached to this log fabric"))]
    UnknownSink,

    /// The failure code is latched on the sink itself.
    #[snafu(display("failed to finalize the sink"))]
    SinkFinalizationFailed,

    #[snafu(display("I/O error: {source}"))]
    #[snafu(context(false))]
    Io { source: io::Error },

    #[snafu(display("codec error: {source}"))]
    #[snafu(context(false))]
    Codec { source: dlog_codec::Error },
}

impl Error {
    /// Whether the error is the transient out-of-buffer-space condition.
    pub fn is_not_enough_space(&self) -> bool {
        matches!(self, Error::NotEnoughSpace)
    }

    /// Small stable integer identifying the variant, used when a status
    /// code is reified into a log record argument.
    pub(crate) fn code(&self) -> u64 {
        match self {
            Error::Bad => 1,
            Error::InvalidArgument => 2,
            Error::NotEnoughMemory => 3,
            Error::NotEnoughSpace => 4,
            Error::MissingData => 5,
            Error::InvalidFileDatabaseHeader => 6,
            Error::InvalidRecordContainerHeader => 7,
            Error::ContainerUnlinkFailed => 8,
            Error::ContainerCouldNotBeLocked => 9,
            Error::MessageBusUnlinkFailed => 10,
            Error::UnknownArgumentTypeId => 11,
            Error::UnknownAttributeTypeId => 12,
            Error::UnknownSink => 13,
            Error::SinkFinalizationFailed => 14,
            Error::Io { .. } => 15,
            Error::Codec { .. } => 16,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
