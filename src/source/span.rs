use std::sync::Arc;

use dlog_codec::{self as codec, Decode, Encode, Input, Output};

use crate::{
    clock::{LogClock, Timestamp},
    source::{enqueue_message, with_thread_context, LogArg, LogContext, LogRecordPort},
    types::{ResourceId, Severity, SpanContext},
};

/// Role of a span relative to its peers, mirroring the usual tracing
/// taxonomy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpanKind {
    #[default]
    Internal = 0,
    Consumer = 1,
    Producer = 2,
    Client = 3,
    Server = 4,
}

impl Encode for SpanKind {
    fn encoded_size(&self) -> u64 {
        1
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_uint(out, *self as u64)
    }
}

impl Decode for SpanKind {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        Ok(match codec::parse_u64_max(input, 4)? {
            0 => SpanKind::Internal,
            1 => SpanKind::Consumer,
            2 => SpanKind::Producer,
            3 => SpanKind::Client,
            _ => SpanKind::Server,
        })
    }
}

/// Span lifecycle opener: a 7-tuple of context, kind, parent, timestamp,
/// name, links, and attributes.
pub(crate) struct SpanStartMessage<'a> {
    pub id: SpanContext,
    pub kind: SpanKind,
    pub parent: SpanContext,
    pub timestamp: Timestamp,
    pub name: &'a str,
    pub links: &'a [SpanContext],
    pub attributes: &'a [(ResourceId, LogArg<'a>)],
}

impl Encode for SpanStartMessage<'_> {
    fn encoded_size(&self) -> u64 {
        let links: u64 = self.links.iter().map(Encode::encoded_size).sum();
        let attributes: u64 = self
            .attributes
            .iter()
            .map(|(id, value)| id.encoded_size() + value.encoded_raw_size())
            .sum();
        1 + self.id.encoded_size()
            + self.kind.encoded_size()
            + self.parent.encoded_size()
            + self.timestamp.encoded_size()
            + codec::text_size(self.name.len())
            + codec::posint_head_size(self.links.len() as u64) as u64
            + links
            + codec::posint_head_size(self.attributes.len() as u64) as u64
            + attributes
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_array(out, 7)?;
        self.id.encode(out)?;
        self.kind.encode(out)?;
        self.parent.encode(out)?;
        self.timestamp.encode(out)?;
        codec::emit_text(out, self.name)?;
        codec::emit_array(out, self.links.len() as u64)?;
        for link in self.links {
            link.encode(out)?;
        }
        codec::emit_map(out, self.attributes.len() as u64)?;
        for (id, value) in self.attributes {
            id.encode(out)?;
            value.encode_raw(out)?;
        }
        Ok(())
    }
}

/// Span lifecycle closer: the `(context, timestamp)` 2-tuple.
pub(crate) struct SpanEndMessage {
    pub id: SpanContext,
    pub timestamp: Timestamp,
}

impl Encode for SpanEndMessage {
    fn encoded_size(&self) -> u64 {
        1 + self.id.encoded_size() + self.timestamp.encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_array(out, 2)?;
        self.id.encode(out)?;
        self.timestamp.encode(out)
    }
}

struct ScopeInner {
    port: Arc<dyn LogRecordPort>,
    id: SpanContext,
    previous_span: SpanContext,
    previous_threshold: Severity,
    restores_thread_context: bool,
    sends_end: bool,
}

/// Stack-lived bracket around a span.
///
/// Opening emits the span-start message and installs the new span (and
/// its possibly lowered threshold) into the thread's logging context;
/// dropping restores the previous context and emits the span-end
/// message. A scope must be dropped on the thread that opened it.
#[must_use = "a span scope closes its span when dropped"]
pub struct SpanScope {
    inner: Option<ScopeInner>,
}

impl SpanScope {
    fn inactive() -> Self {
        Self { inner: None }
    }

    /// Opens an internal span below the thread's current span.
    pub fn open(name: &str) -> Self {
        Self::open_with(name, SpanKind::Internal, &[])
    }

    /// Opens a span below the thread's current span.
    pub fn open_with(name: &str, kind: SpanKind, attributes: &[(ResourceId, LogArg<'_>)]) -> Self {
        with_thread_context(|ctx| {
            let parent = ctx.span();
            Self::open_in_context(ctx, name, parent, kind, attributes)
        })
    }

    /// Opens a span below an explicit parent, e.g. one received from a
    /// remote caller, still updating the thread's context.
    pub fn open_below(
        name: &str,
        parent: SpanContext,
        kind: SpanKind,
        attributes: &[(ResourceId, LogArg<'_>)],
    ) -> Self {
        with_thread_context(|ctx| Self::open_in_context(ctx, name, parent, kind, attributes))
    }

    /// Opens a span against an explicit context, leaving the thread's
    /// implicit context untouched. Returns the context to log through
    /// inside the span alongside the scope itself.
    pub fn open_in(
        ctx: &LogContext,
        name: &str,
        kind: SpanKind,
        attributes: &[(ResourceId, LogArg<'_>)],
    ) -> (LogContext, Self) {
        let mut span_ctx = ctx.clone();
        let scope = Self::open_in_context_no_restore(&mut span_ctx, name, ctx.span(), kind, attributes);
        (span_ctx, scope)
    }

    /// Suppresses span tracking for the current scope: the thread context
    /// keeps its port but loses its span until the scope drops.
    pub fn none() -> Self {
        with_thread_context(|ctx| {
            let Some(port) = ctx.port().cloned() else {
                return Self::inactive();
            };
            let previous_span = ctx.span();
            let previous_threshold = ctx.threshold();
            ctx.set_span(SpanContext::invalid());
            ctx.override_threshold(port.default_threshold());
            Self {
                inner: Some(ScopeInner {
                    port,
                    id: SpanContext::invalid(),
                    previous_span,
                    previous_threshold,
                    restores_thread_context: true,
                    sends_end: false,
                }),
            }
        })
    }

    fn open_in_context(
        ctx: &mut LogContext,
        name: &str,
        parent: SpanContext,
        kind: SpanKind,
        attributes: &[(ResourceId, LogArg<'_>)],
    ) -> Self {
        let mut scope = Self::open_in_context_no_restore(ctx, name, parent, kind, attributes);
        if let Some(inner) = scope.inner.as_mut() {
            inner.restores_thread_context = true;
        }
        scope
    }

    fn open_in_context_no_restore(
        ctx: &mut LogContext,
        name: &str,
        parent: SpanContext,
        kind: SpanKind,
        attributes: &[(ResourceId, LogArg<'_>)],
    ) -> Self {
        let Some(port) = ctx.port().cloned() else {
            return Self::inactive();
        };

        let mut threshold = ctx.threshold();
        let id = port.create_span_context(parent.trace_id, name, &mut threshold);
        if !id.trace_id.is_valid() {
            return Self::inactive();
        }

        let message = SpanStartMessage {
            id,
            kind,
            parent,
            timestamp: LogClock::now(),
            name,
            links: &[],
            attributes,
        };
        if enqueue_message(port.as_ref(), id.span_id, &message).is_err() {
            return Self::inactive();
        }

        let previous_span = ctx.span();
        let previous_threshold = ctx.threshold();
        ctx.set_span(id);
        ctx.override_threshold(threshold);

        Self {
            inner: Some(ScopeInner {
                port,
                id,
                previous_span,
                previous_threshold,
                restores_thread_context: false,
                sends_end: true,
            }),
        }
    }

    /// The context of the span this scope brackets; invalid when the
    /// scope could not be opened.
    pub fn context(&self) -> SpanContext {
        self.inner
            .as_ref()
            .map(|inner| inner.id)
            .unwrap_or_else(SpanContext::invalid)
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        if inner.restores_thread_context {
            with_thread_context(|ctx| {
                ctx.set_span(inner.previous_span);
                ctx.override_threshold(inner.previous_threshold);
            });
        }

        if inner.sends_end {
            let message = SpanEndMessage {
                id: inner.id,
                timestamp: LogClock::now(),
            };
            let _ = enqueue_message(inner.port.as_ref(), inner.id.span_id, &message);
        }
    }
}
