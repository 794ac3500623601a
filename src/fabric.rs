//! The log fabric: owns the message bus and fans drained messages out to
//! the attached sinks.

use std::sync::Arc;

use dlog_codec::{self as codec, Decode, SliceInput};

use crate::{
    bus::MessageBus,
    clock::Timestamp,
    error::{Error, Result},
    sinks::Sink,
    source::LogRecordPort,
    types::Severity,
};

/// A raw bus message classified by peeking at its outer tuple arity.
///
/// `raw` always covers the consumed prefix of the message for well-formed
/// kinds and the whole payload for malformed ones, so concatenating the
/// raw slices of a batch reproduces a valid item stream.
#[derive(Clone, Copy, Debug)]
pub enum SerializedMessage<'a> {
    /// A log record; severity and timestamp are pre-decoded so sinks can
    /// filter without parsing.
    Record {
        raw: &'a [u8],
        severity: Severity,
        timestamp: Timestamp,
    },
    SpanStart { raw: &'a [u8] },
    SpanEnd { raw: &'a [u8] },
    /// Data the preparser could not make sense of; passed through so a
    /// container never silently swallows bytes.
    Malformed { raw: &'a [u8] },
}

impl<'a> SerializedMessage<'a> {
    pub fn raw(&self) -> &'a [u8] {
        match self {
            SerializedMessage::Record { raw, .. }
            | SerializedMessage::SpanStart { raw }
            | SerializedMessage::SpanEnd { raw }
            | SerializedMessage::Malformed { raw } => raw,
        }
    }
}

const RECORD_ARITY: u64 = 6;
const SPAN_START_ARITY: u64 = 7;
const SPAN_END_ARITY: u64 = 2;

fn preparse_record(raw: &[u8]) -> codec::Result<SerializedMessage<'_>> {
    let mut input = SliceInput::new(raw);
    codec::expect_item_head(&mut input, codec::ItemKind::Array, RECORD_ARITY)?;
    let severity = Severity::decode(&mut input)?;
    codec::skip_item(&mut input)?; // owner context
    let timestamp = codec::parse_u64(&mut input)?;
    for _ in 0..3 {
        codec::skip_item(&mut input)?; // message, arguments, attributes
    }
    Ok(SerializedMessage::Record {
        raw: &raw[..input.position()],
        severity,
        timestamp,
    })
}

fn preparse_skipping(raw: &[u8], arity: u64) -> codec::Result<usize> {
    let mut input = SliceInput::new(raw);
    codec::expect_item_head(&mut input, codec::ItemKind::Array, arity)?;
    for _ in 0..arity {
        codec::skip_item(&mut input)?;
    }
    Ok(input.position())
}

/// Classifies a batch of raw messages and sums their consumed sizes.
///
/// Wire corruption never aborts the drain: anything that fails to parse
/// is classified as [`SerializedMessage::Malformed`] and carried along.
pub fn preparse_messages<'a>(messages: &[&'a [u8]]) -> (usize, Vec<SerializedMessage<'a>>) {
    let mut binary_size = 0usize;
    let mut parses = Vec::with_capacity(messages.len());

    for &raw in messages {
        let mut input = SliceInput::new(raw);
        let parsed = match codec::parse_item_head(&mut input) {
            Ok(head) if head.kind == codec::ItemKind::Array && !head.indefinite => {
                match head.value {
                    RECORD_ARITY => preparse_record(raw).ok(),
                    SPAN_START_ARITY => preparse_skipping(raw, SPAN_START_ARITY)
                        .ok()
                        .map(|consumed| SerializedMessage::SpanStart {
                            raw: &raw[..consumed],
                        }),
                    SPAN_END_ARITY => preparse_skipping(raw, SPAN_END_ARITY).ok().map(
                        |consumed| SerializedMessage::SpanEnd {
                            raw: &raw[..consumed],
                        },
                    ),
                    _ => None,
                }
            }
            _ => None,
        };

        let parsed = parsed.unwrap_or(SerializedMessage::Malformed { raw });
        binary_size += parsed.raw().len();
        parses.push(parsed);
    }

    (binary_size, parses)
}

/// Stable handle identifying an attached sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkHandle(u64);

struct SinkEntry {
    handle: SinkHandle,
    sink: Box<dyn Sink>,
}

/// Owns a message bus and a dynamic set of sinks.
///
/// Producers obtain the record port via [`record_port`](Self::record_port)
/// and write into the bus from any thread; one driver thread calls
/// [`retire_log_records`](Self::retire_log_records) to drain the bus into
/// the sinks.
pub struct LogFabric<B: MessageBus> {
    bus: Arc<B>,
    sinks: Vec<SinkEntry>,
    next_handle: u64,
}

impl<B: MessageBus + 'static> LogFabric<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus: Arc::new(bus),
            sinks: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn message_bus(&self) -> &B {
        &self.bus
    }

    /// The port producers log through; cheap to clone per thread.
    pub fn record_port(&self) -> Arc<dyn LogRecordPort> {
        Arc::clone(&self.bus) as Arc<dyn LogRecordPort>
    }

    /// Transfers a sink into the fabric.
    pub fn attach_sink(&mut self, sink: Box<dyn Sink>) -> SinkHandle {
        let handle = SinkHandle(self.next_handle);
        self.next_handle += 1;
        self.sinks.push(SinkEntry { handle, sink });
        handle
    }

    /// Drops a sink in place without finalizing it.
    pub fn remove_sink(&mut self, handle: SinkHandle) {
        self.sinks.retain(|entry| entry.handle != handle);
    }

    /// Hands a sink back to the caller.
    pub fn release_sink(&mut self, handle: SinkHandle) -> Option<Box<dyn Sink>> {
        let index = self
            .sinks
            .iter()
            .position(|entry| entry.handle == handle)?;
        Some(self.sinks.remove(index).sink)
    }

    /// Finalizes a sink and drops it. A failed finalization leaves the
    /// sink attached with its status latched.
    pub fn destroy_sink(&mut self, handle: SinkHandle) -> Result<()> {
        let entry = self
            .sinks
            .iter_mut()
            .find(|entry| entry.handle == handle)
            .ok_or(Error::UnknownSink)?;
        if !entry.sink.try_finalize() {
            return Err(Error::SinkFinalizationFailed);
        }
        self.remove_sink(handle);
        Ok(())
    }

    pub fn clear_sinks(&mut self) {
        self.sinks.clear();
    }

    /// Mutable access to an attached sink, e.g. to inspect its status.
    pub fn sink_mut(&mut self, handle: SinkHandle) -> Option<&mut (dyn Sink + '_)> {
        self.sinks
            .iter_mut()
            .find(|entry| entry.handle == handle)
            .map(move |entry| entry.sink.as_mut() as &mut dyn Sink)
    }

    /// Drains the bus, multicasting each preparsed batch to every active
    /// sink, then gives each sink a chance to push buffered bytes out.
    ///
    /// Sink failures are latched on the sink, never surfaced here; the
    /// fabric cannot log about its own sinks failing.
    pub fn retire_log_records(&mut self) -> Result<()> {
        let bus = Arc::clone(&self.bus);
        let sinks = &mut self.sinks;
        bus.consume_messages(&mut |messages| {
            let (binary_size, parses) = preparse_messages(messages);
            for entry in sinks.iter_mut() {
                let _ = entry.sink.try_consume(binary_size, &parses);
            }
        })?;

        for entry in &mut self.sinks {
            let _ = entry.sink.try_sync();
        }
        Ok(())
    }
}
