//! Span hierarchy over the bus: parent links, trace inheritance, and
//! context restoration.

use std::sync::Arc;

use dlog::{
    codec::{self, Decode, SliceInput},
    LogContext, MpscBus, SpanContext, SpanId, SpanKind, SpanScope, TraceId, MIN_REGION_SIZE,
};
use temp_dir::TempDir;

#[derive(Debug)]
enum BusMessage {
    SpanStart {
        id: SpanContext,
        kind: u64,
        parent: SpanContext,
        name: String,
    },
    SpanEnd {
        id: SpanContext,
    },
}

fn drain_span_messages(bus: &MpscBus) -> Vec<BusMessage> {
    let mut messages = Vec::new();
    bus.consume_messages(&mut |msgs| {
        for msg in msgs {
            let mut input = SliceInput::new(msg);
            match codec::parse_array_head(&mut input).unwrap() {
                7 => {
                    let id = SpanContext::decode(&mut input).unwrap();
                    let kind = codec::parse_u64(&mut input).unwrap();
                    let parent = SpanContext::decode(&mut input).unwrap();
                    codec::parse_u64(&mut input).unwrap();
                    let name = codec::parse_text(&mut input).unwrap();
                    messages.push(BusMessage::SpanStart {
                        id,
                        kind,
                        parent,
                        name,
                    });
                }
                2 => {
                    let id = SpanContext::decode(&mut input).unwrap();
                    codec::parse_u64(&mut input).unwrap();
                    messages.push(BusMessage::SpanEnd { id });
                }
                other => panic!("unexpected message arity {other}"),
            }
        }
    })
    .unwrap();
    messages
}

fn find_start<'a>(messages: &'a [BusMessage], name: &str) -> (&'a SpanContext, &'a SpanContext, u64) {
    messages
        .iter()
        .find_map(|message| match message {
            BusMessage::SpanStart {
                id,
                kind,
                parent,
                name: msg_name,
            } if msg_name == name => Some((id, parent, *kind)),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no span-start for {name}"))
}

#[test]
fn child_spans_inherit_the_trace_and_link_their_parent() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(
        MpscBus::create(dir.path().join("spans.dmpscb"), 4, MIN_REGION_SIZE).unwrap(),
    );
    dlog::set_thread_context(LogContext::new(bus.clone()));

    let (root_ctx, child_ctx);
    {
        let root = SpanScope::open("request");
        assert!(root.is_active());
        root_ctx = root.context();
        {
            let child = SpanScope::open_with("lookup", SpanKind::Client, &[]);
            child_ctx = child.context();
            assert_eq!(dlog::thread_context().span(), child_ctx);
        }
        // Dropping the child restores the parent as the active span.
        assert_eq!(dlog::thread_context().span(), root_ctx);
    }
    assert!(!dlog::thread_context().span().is_valid());

    assert_eq!(child_ctx.trace_id, root_ctx.trace_id);
    assert_ne!(child_ctx.span_id, root_ctx.span_id);

    let messages = drain_span_messages(&bus);
    let (root_id, root_parent, root_kind) = find_start(&messages, "request");
    assert_eq!(*root_id, root_ctx);
    assert!(!root_parent.is_valid());
    assert_eq!(root_kind, 0);

    let (child_id, child_parent, child_kind) = find_start(&messages, "lookup");
    assert_eq!(*child_id, child_ctx);
    assert_eq!(*child_parent, root_ctx);
    assert_eq!(child_kind, 3);

    let ends: Vec<&SpanContext> = messages
        .iter()
        .filter_map(|message| match message {
            BusMessage::SpanEnd { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(ends.len(), 2);
    assert!(ends.contains(&&root_ctx));
    assert!(ends.contains(&&child_ctx));
}

#[test]
fn explicit_parent_spans_continue_remote_traces() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(
        MpscBus::create(dir.path().join("remote.dmpscb"), 2, MIN_REGION_SIZE).unwrap(),
    );
    dlog::set_thread_context(LogContext::new(bus.clone()));

    // A context received from elsewhere, e.g. out of a request header.
    let remote = SpanContext {
        trace_id: TraceId::from_bytes([7; 16]),
        span_id: SpanId::from_bytes([8; 8]),
    };

    let ctx;
    {
        let scope = SpanScope::open_below("serve", remote, SpanKind::Server, &[]);
        ctx = scope.context();
    }

    assert_eq!(ctx.trace_id, remote.trace_id);
    assert_ne!(ctx.span_id, remote.span_id);

    let messages = drain_span_messages(&bus);
    let (_, parent, kind) = find_start(&messages, "serve");
    assert_eq!(*parent, remote);
    assert_eq!(kind, 4);
}

#[test]
fn span_scopes_without_a_port_are_inert() {
    dlog::set_thread_context(LogContext::disabled());
    let scope = SpanScope::open("nowhere");
    assert!(!scope.is_active());
    assert!(!scope.context().is_valid());
}

#[test]
fn explicit_context_spans_leave_the_thread_context_alone() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(
        MpscBus::create(dir.path().join("explicit.dmpscb"), 2, MIN_REGION_SIZE).unwrap(),
    );
    dlog::set_thread_context(LogContext::disabled());

    let base = LogContext::new(bus.clone());
    let (span_ctx, scope) = SpanScope::open_in(&base, "detached", SpanKind::Internal, &[]);
    assert!(scope.is_active());
    assert_eq!(span_ctx.span(), scope.context());
    assert!(!dlog::thread_context().span().is_valid());
    drop(scope);

    let messages = drain_span_messages(&bus);
    assert_eq!(messages.len(), 2);
}
