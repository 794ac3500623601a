use dlog_codec::{self as codec, Encode, Output};

use crate::{
    clock::{emit_timestamp, LogClock, TIMESTAMP_SIZE},
    error::{Error, Result},
    source::{LogContext, LogRecordPort},
    types::{ReificationTypeId, ResourceId, Severity, SpanContext},
};

/// Call-site location stamped into a record's attribute map.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceLocation {
    pub file: Option<&'static str>,
    pub line: Option<u32>,
}

impl SourceLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file: Some(file),
            line: Some(line),
        }
    }

    pub const fn none() -> Self {
        Self {
            file: None,
            line: None,
        }
    }
}

/// Escape hatch for argument types outside the closed [`LogArg`] set.
///
/// The three operations mirror what the encoder needs: the reification
/// tag, the exact encoded size of the value, and the value emission.
pub trait Loggable {
    fn reification_type_id(&self) -> ReificationTypeId;

    fn encoded_size(&self) -> u64;

    fn encode_value(&self, out: &mut dyn Output) -> codec::Result<()>;
}

/// A borrowed, loggable record argument.
///
/// Closed variant over the core types; anything else rides along through
/// [`LogArg::Other`] with a caller-supplied [`Loggable`].
#[derive(Clone, Copy)]
pub enum LogArg<'a> {
    U64(u64),
    I64(i64),
    Str(&'a str),
    Span(SpanContext),
    Code(&'a Error),
    Other(&'a dyn Loggable),
}

impl LogArg<'_> {
    fn reification_type_id(&self) -> ReificationTypeId {
        match self {
            LogArg::U64(_) => ReificationTypeId::UINT64,
            LogArg::I64(_) => ReificationTypeId::INT64,
            LogArg::Str(_) => ReificationTypeId::STRING,
            LogArg::Span(_) => ReificationTypeId::SPAN_CONTEXT,
            LogArg::Code(_) => ReificationTypeId::STATUS_CODE,
            LogArg::Other(other) => other.reification_type_id(),
        }
    }

    /// Encoded size of the bare value, without the reification wrapper.
    pub(crate) fn encoded_raw_size(&self) -> u64 {
        match self {
            LogArg::U64(value) => value.encoded_size(),
            LogArg::I64(value) => value.encoded_size(),
            LogArg::Str(value) => codec::text_size(value.len()),
            LogArg::Span(value) => value.encoded_size(),
            LogArg::Code(error) => {
                let message = error.to_string();
                1 + error.code().encoded_size()
                    + codec::text_size(STATUS_DOMAIN.len())
                    + codec::text_size(message.len())
            }
            LogArg::Other(other) => other.encoded_size(),
        }
    }

    /// Emits the bare value, without the reification wrapper.
    pub(crate) fn encode_raw<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        match self {
            LogArg::U64(value) => value.encode(out),
            LogArg::I64(value) => value.encode(out),
            LogArg::Str(value) => codec::emit_text(out, value),
            LogArg::Span(value) => value.encode(out),
            LogArg::Code(error) => {
                let message = error.to_string();
                codec::emit_array(out, 3)?;
                codec::emit_uint(out, error.code())?;
                codec::emit_text(out, STATUS_DOMAIN)?;
                codec::emit_text(out, &message)
            }
            LogArg::Other(other) => {
                let mut erased = ErasedOutput { inner: out };
                other.encode_value(&mut erased)
            }
        }
    }

    /// Encoded size of the `[reification_type_id, value]` pair.
    fn encoded_size(&self) -> u64 {
        1 + self.reification_type_id().encoded_size() + self.encoded_raw_size()
    }

    /// Emits the `[reification_type_id, value]` pair.
    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_array(out, 2)?;
        self.reification_type_id().encode(out)?;
        self.encode_raw(out)
    }
}

const STATUS_DOMAIN: &str = "dlog";

/// Adapter so a generic `Output` can cross the `dyn Loggable` boundary.
struct ErasedOutput<'a, O: Output + ?Sized> {
    inner: &'a mut O,
}

impl<O: Output + ?Sized> Output for ErasedOutput<'_, O> {
    fn ensure_capacity(&mut self, n: usize) -> codec::Result<()> {
        self.inner.ensure_capacity(n)
    }

    fn writable(&mut self) -> &mut [u8] {
        self.inner.writable()
    }

    fn commit(&mut self, n: usize) {
        self.inner.commit(n)
    }

    fn write_all(&mut self, src: &[u8]) -> codec::Result<()> {
        self.inner.write_all(src)
    }
}

impl From<u64> for LogArg<'_> {
    fn from(value: u64) -> Self {
        LogArg::U64(value)
    }
}

impl From<u32> for LogArg<'_> {
    fn from(value: u32) -> Self {
        LogArg::U64(u64::from(value))
    }
}

impl From<usize> for LogArg<'_> {
    fn from(value: usize) -> Self {
        LogArg::U64(value as u64)
    }
}

impl From<i64> for LogArg<'_> {
    fn from(value: i64) -> Self {
        LogArg::I64(value)
    }
}

impl From<i32> for LogArg<'_> {
    fn from(value: i32) -> Self {
        LogArg::I64(i64::from(value))
    }
}

impl<'a> From<&'a str> for LogArg<'a> {
    fn from(value: &'a str) -> Self {
        LogArg::Str(value)
    }
}

impl<'a> From<&'a String> for LogArg<'a> {
    fn from(value: &'a String) -> Self {
        LogArg::Str(value)
    }
}

impl From<SpanContext> for LogArg<'_> {
    fn from(value: SpanContext) -> Self {
        LogArg::Span(value)
    }
}

impl<'a> From<&'a Error> for LogArg<'a> {
    fn from(value: &'a Error) -> Self {
        LogArg::Code(value)
    }
}

impl<'a> From<&'a dyn Loggable> for LogArg<'a> {
    fn from(value: &'a dyn Loggable) -> Self {
        LogArg::Other(value)
    }
}

/// Severity values above this cannot be carried by the wire format.
const SEVERITY_MAX: Severity = Severity::from_raw(24);

/// Writes one structured record through `ctx`.
///
/// Returns without touching the bus when the severity does not clear the
/// context's threshold or the context has no port. `Severity::NONE` is a
/// no-op by definition; severities beyond the encodable range are an
/// [`Error::InvalidArgument`].
pub fn log(
    ctx: &LogContext,
    severity: Severity,
    message: &str,
    location: SourceLocation,
    args: &[LogArg<'_>],
) -> Result<()> {
    if severity == Severity::NONE {
        return Ok(());
    }
    if severity > SEVERITY_MAX {
        return Err(Error::InvalidArgument);
    }
    if severity < ctx.threshold() {
        return Ok(());
    }
    let Some(port) = ctx.port() else {
        return Ok(());
    };
    vlog(port.as_ref(), ctx, severity, message, location, args)
}

/// [`log`] against the thread's implicit context.
///
/// The context is snapshotted first, so a [`Loggable`] argument that logs
/// on its own cannot re-enter the thread-local cell.
pub fn log_with_active_context(
    severity: Severity,
    message: &str,
    location: SourceLocation,
    args: &[LogArg<'_>],
) -> Result<()> {
    let ctx = crate::source::thread_context();
    log(&ctx, severity, message, location, args)
}

// Record layout:
//   array 6
//   + ui    severity
//   + arr   owner (scope?, trace+span?)
//   + ui64  timestamp (fixed 9 bytes)
//   + str   message
//   + array format arguments
//   + map   attributes
fn vlog(
    port: &dyn LogRecordPort,
    ctx: &LogContext,
    severity: Severity,
    message: &str,
    location: SourceLocation,
    args: &[LogArg<'_>],
) -> Result<()> {
    let timestamp = LogClock::now();
    let scope = ctx.instrumentation_scope();
    let has_scope = !scope.is_empty();
    let owner = ctx.span();
    let has_span = owner.span_id.is_valid();

    let mut encoded_size: u64 = 1 /* array 6 */ + 1 /* severity */ + TIMESTAMP_SIZE;

    encoded_size += 1; // owner array head, flag bits in the arity
    if has_scope {
        encoded_size += codec::text_size(scope.len());
    }
    if has_span {
        encoded_size += owner.trace_id.encoded_size() + owner.span_id.encoded_size();
    }

    encoded_size += codec::text_size(message.len());

    encoded_size += codec::posint_head_size(args.len() as u64) as u64;
    for arg in args {
        encoded_size += arg.encoded_size();
    }

    encoded_size += 1; // attribute map head, 0-2 entries
    if let Some(line) = location.line {
        encoded_size += ResourceId::LINE.encoded_size() + u64::from(line).encoded_size();
    }
    if let Some(file) = location.file {
        encoded_size += ResourceId::FILE.encoded_size() + codec::text_size(file.len());
    }

    let mut out = port.allocate_record_buffer(encoded_size as usize, owner.span_id)?;

    codec::emit_array(&mut out, 6)?;
    out.write_all(&[severity.as_raw() - 1])?;

    // Owner context: the arity doubles as the presence flags.
    let owner_arity = u64::from(has_scope) + 2 * u64::from(has_span);
    codec::emit_array(&mut out, owner_arity)?;
    if has_scope {
        codec::emit_text(&mut out, scope)?;
    }
    if has_span {
        owner.trace_id.encode(&mut out)?;
        owner.span_id.encode(&mut out)?;
    }

    emit_timestamp(&mut out, timestamp)?;
    codec::emit_text(&mut out, message)?;

    codec::emit_array(&mut out, args.len() as u64)?;
    for arg in args {
        arg.encode(&mut out)?;
    }

    let num_attributes = u64::from(location.line.is_some()) + u64::from(location.file.is_some());
    codec::emit_map(&mut out, num_attributes)?;
    if let Some(line) = location.line {
        ResourceId::LINE.encode(&mut out)?;
        codec::emit_uint(&mut out, u64::from(line))?;
    }
    if let Some(file) = location.file {
        ResourceId::FILE.encode(&mut out)?;
        codec::emit_text(&mut out, file)?;
    }

    debug_assert_eq!(out.written() as u64, encoded_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use dlog_codec::{Decode, SliceInput};

    use super::*;
    use crate::{
        bus::RecordBuffer,
        types::{SpanId, TraceId},
    };

    /// Port capturing every allocated message in memory.
    #[derive(Default)]
    struct CapturePort {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturePort {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.messages.lock().unwrap())
        }
    }

    impl LogRecordPort for CapturePort {
        fn allocate_record_buffer(
            &self,
            message_size: usize,
            _span_id: SpanId,
        ) -> Result<RecordBuffer<'_>> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(vec![0u8; message_size]);
            let slot = messages.last_mut().unwrap();
            // SAFETY: the vector entry lives until `take`; tests drain
            // only after the buffer was dropped.
            Ok(unsafe { RecordBuffer::for_area(slot.as_mut_ptr(), slot.len()) })
        }

        fn create_span_context(
            &self,
            trace_id: TraceId,
            _name: &str,
            _threshold: &mut Severity,
        ) -> SpanContext {
            let trace_id = if trace_id.is_valid() {
                trace_id
            } else {
                TraceId::random()
            };
            SpanContext {
                trace_id,
                span_id: SpanId::from_bytes([9; 8]),
            }
        }
    }

    fn capture_context() -> (Arc<CapturePort>, LogContext) {
        let port = Arc::new(CapturePort::default());
        let mut ctx = LogContext::new(Arc::clone(&port) as Arc<dyn LogRecordPort>);
        ctx.override_threshold(Severity::TRACE);
        (port, ctx)
    }

    #[test]
    fn encoded_record_decodes_field_by_field() {
        let (port, mut ctx) = capture_context();
        let span = SpanContext {
            trace_id: TraceId::from_bytes([3; 16]),
            span_id: SpanId::from_bytes([4; 8]),
        };
        ctx.set_span(span);

        log(
            &ctx,
            Severity::ERROR,
            "boom {}",
            SourceLocation::new("src/widget.rs", 42),
            &[LogArg::from(17u64), LogArg::from("answer")],
        )
        .unwrap();

        let messages = port.take();
        assert_eq!(messages.len(), 1);
        let mut input = SliceInput::new(&messages[0]);

        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 6).unwrap();
        assert_eq!(Severity::decode(&mut input).unwrap(), Severity::ERROR);

        // Owner: no scope, span pair present.
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 2).unwrap();
        assert_eq!(TraceId::decode(&mut input).unwrap(), span.trace_id);
        assert_eq!(SpanId::decode(&mut input).unwrap(), span.span_id);

        let timestamp = dlog_codec::parse_u64(&mut input).unwrap();
        assert!(timestamp > 0);
        assert_eq!(dlog_codec::parse_text(&mut input).unwrap(), "boom {}");

        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 2).unwrap();
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 2).unwrap();
        assert_eq!(
            ReificationTypeId::decode(&mut input).unwrap(),
            ReificationTypeId::UINT64
        );
        assert_eq!(dlog_codec::parse_u64(&mut input).unwrap(), 17);
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 2).unwrap();
        assert_eq!(
            ReificationTypeId::decode(&mut input).unwrap(),
            ReificationTypeId::STRING
        );
        assert_eq!(dlog_codec::parse_text(&mut input).unwrap(), "answer");

        assert_eq!(dlog_codec::parse_map_head(&mut input).unwrap(), 2);
        assert_eq!(ResourceId::decode(&mut input).unwrap(), ResourceId::LINE);
        assert_eq!(dlog_codec::parse_u64(&mut input).unwrap(), 42);
        assert_eq!(ResourceId::decode(&mut input).unwrap(), ResourceId::FILE);
        assert_eq!(dlog_codec::parse_text(&mut input).unwrap(), "src/widget.rs");

        assert!(input.is_empty());
    }

    #[test]
    fn scope_string_lands_in_owner_context() {
        let port = Arc::new(CapturePort::default());
        let mut ctx = LogContext::with_scope(
            Arc::clone(&port) as Arc<dyn LogRecordPort>,
            "test-scope",
        );
        ctx.override_threshold(Severity::TRACE);

        log(&ctx, Severity::INFO, "hi", SourceLocation::none(), &[]).unwrap();
        let messages = port.take();
        let mut input = SliceInput::new(&messages[0]);

        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 6).unwrap();
        Severity::decode(&mut input).unwrap();
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 1).unwrap();
        assert_eq!(dlog_codec::parse_text(&mut input).unwrap(), "test-scope");
    }

    #[test]
    fn threshold_and_none_short_circuit() {
        let (port, mut ctx) = capture_context();
        ctx.override_threshold(Severity::WARN);

        log(&ctx, Severity::DEBUG, "nope", SourceLocation::none(), &[]).unwrap();
        log(&ctx, Severity::NONE, "nope", SourceLocation::none(), &[]).unwrap();
        assert!(port.take().is_empty());

        assert!(matches!(
            log(
                &ctx,
                Severity::from_raw(25),
                "out of range",
                SourceLocation::none(),
                &[]
            ),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn status_code_arguments_reify() {
        let (port, ctx) = capture_context();
        let error = Error::NotEnoughSpace;
        log(
            &ctx,
            Severity::ERROR,
            "failed: {}",
            SourceLocation::none(),
            &[LogArg::from(&error)],
        )
        .unwrap();

        let messages = port.take();
        let mut input = SliceInput::new(&messages[0]);
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 6).unwrap();
        Severity::decode(&mut input).unwrap();
        dlog_codec::skip_item(&mut input).unwrap(); // owner
        dlog_codec::parse_u64(&mut input).unwrap(); // timestamp
        dlog_codec::parse_text(&mut input).unwrap(); // message

        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 1).unwrap();
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 2).unwrap();
        assert_eq!(
            ReificationTypeId::decode(&mut input).unwrap(),
            ReificationTypeId::STATUS_CODE
        );
        dlog_codec::expect_item_head(&mut input, dlog_codec::ItemKind::Array, 3).unwrap();
        assert_eq!(dlog_codec::parse_u64(&mut input).unwrap(), 4);
        assert_eq!(dlog_codec::parse_text(&mut input).unwrap(), "dlog");
        let message = dlog_codec::parse_text(&mut input).unwrap();
        assert!(message.contains("buffer"));
    }
}
