//! The producer-side source layer: logging contexts, span scopes, and the
//! record encoders behind the logging entry points.

use std::{cell::RefCell, sync::Arc};

use dlog_codec::Encode;

use crate::{
    bus::RecordBuffer,
    error::Result,
    types::{Severity, SpanContext, SpanId, TraceId, DEFAULT_THRESHOLD},
};

pub(crate) mod log;
pub(crate) mod span;

pub use self::{
    log::{log, log_with_active_context, LogArg, Loggable, SourceLocation},
    span::{SpanKind, SpanScope},
};

/// Where log records are written to; implemented by the buses and handed
/// out by the fabric.
pub trait LogRecordPort: Send + Sync {
    /// Reserves `message_size` bytes for one message owned by `span_id`.
    fn allocate_record_buffer(
        &self,
        message_size: usize,
        span_id: SpanId,
    ) -> Result<RecordBuffer<'_>>;

    /// Derives a fresh span context below `trace_id` (or a fresh trace if
    /// it is invalid). The threshold may be lowered for the new span.
    fn create_span_context(
        &self,
        trace_id: TraceId,
        name: &str,
        threshold: &mut Severity,
    ) -> SpanContext;

    /// Threshold applied to contexts created against this port.
    fn default_threshold(&self) -> Severity {
        DEFAULT_THRESHOLD
    }
}

/// Encodes `message` into a freshly allocated bus slot.
///
/// Dropping the buffer at the end commits the message to the consumer.
pub fn enqueue_message<M: Encode>(
    port: &dyn LogRecordPort,
    span_id: SpanId,
    message: &M,
) -> Result<()> {
    let size = message.encoded_size() as usize;
    let mut buffer = port.allocate_record_buffer(size, span_id)?;
    message.encode(&mut buffer)?;
    Ok(())
}

/// Per-thread (or per-call-site) logging state.
///
/// Carries the target port, a cached severity threshold, the current span
/// and the instrumentation-scope label stamped into every record.
#[derive(Clone)]
pub struct LogContext {
    port: Option<Arc<dyn LogRecordPort>>,
    threshold: Severity,
    instrumentation_scope: &'static str,
    span: SpanContext,
}

impl LogContext {
    /// A context that swallows everything.
    pub const fn disabled() -> Self {
        Self {
            port: None,
            threshold: Severity::DISABLE,
            instrumentation_scope: "",
            span: SpanContext::invalid(),
        }
    }

    pub fn new(port: Arc<dyn LogRecordPort>) -> Self {
        let threshold = port.default_threshold();
        Self {
            port: Some(port),
            threshold,
            instrumentation_scope: "",
            span: SpanContext::invalid(),
        }
    }

    pub fn with_scope(port: Arc<dyn LogRecordPort>, scope: &'static str) -> Self {
        let mut ctx = Self::new(port);
        ctx.instrumentation_scope = scope;
        ctx
    }

    pub fn port(&self) -> Option<&Arc<dyn LogRecordPort>> {
        self.port.as_ref()
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    pub fn override_threshold(&mut self, threshold: Severity) {
        self.threshold = threshold;
    }

    pub fn span(&self) -> SpanContext {
        self.span
    }

    pub fn set_span(&mut self, span: SpanContext) {
        self.span = span;
    }

    pub fn instrumentation_scope(&self) -> &'static str {
        self.instrumentation_scope
    }
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("has_port", &self.port.is_some())
            .field("threshold", &self.threshold)
            .field("instrumentation_scope", &self.instrumentation_scope)
            .field("span", &self.span)
            .finish()
    }
}

thread_local! {
    static ACTIVE_CONTEXT: RefCell<LogContext> = const { RefCell::new(LogContext::disabled()) };
}

/// Installs `context` as this thread's implicit logging context.
pub fn set_thread_context(context: LogContext) {
    ACTIVE_CONTEXT.with(|cell| *cell.borrow_mut() = context);
}

/// Snapshot of this thread's implicit logging context.
pub fn thread_context() -> LogContext {
    ACTIVE_CONTEXT.with(|cell| cell.borrow().clone())
}

pub(crate) fn with_thread_context<R>(f: impl FnOnce(&mut LogContext) -> R) -> R {
    ACTIVE_CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
}
