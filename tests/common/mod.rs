//! Shared helpers for the integration scenarios: a minimal reader for
//! record container files, exercising the consumer-facing half of the
//! on-disk format.

// Each integration binary compiles its own copy and uses a subset.
#![allow(dead_code)]

use std::path::Path;

use dlog::{
    codec::{self, Decode, Input, ItemKind, SliceInput},
    EpochInfo, Severity, SpanContext, SpanId, TraceId, CONTAINER_MAGIC,
};

/// Routes the runtime's internal diagnostics to the test output when
/// `RUST_LOG` asks for them.
#[allow(dead_code)]
pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct ParsedContainer {
    pub version: u64,
    pub epoch: EpochInfo,
    pub entries: Vec<ContainerEntry>,
    /// Whether the indefinite record array was closed with a break byte.
    pub finalized: bool,
}

#[derive(Debug)]
pub enum ContainerEntry {
    Record {
        severity: Severity,
        timestamp: u64,
        scope: Option<String>,
        span: Option<SpanContext>,
        message: String,
    },
    SpanStart {
        id: SpanContext,
        parent: SpanContext,
        kind: u64,
        name: String,
    },
    SpanEnd {
        id: SpanContext,
    },
    Other,
}

impl ParsedContainer {
    pub fn records(&self) -> impl Iterator<Item = (&Severity, &String)> {
        self.entries.iter().filter_map(|entry| match entry {
            ContainerEntry::Record {
                severity, message, ..
            } => Some((severity, message)),
            _ => None,
        })
    }

    pub fn span_start(&self, name: &str) -> Option<(&SpanContext, &SpanContext)> {
        self.entries.iter().find_map(|entry| match entry {
            ContainerEntry::SpanStart {
                id,
                parent,
                name: entry_name,
                ..
            } if entry_name == name => Some((id, parent)),
            _ => None,
        })
    }
}

pub fn read_container(path: &Path) -> ParsedContainer {
    let bytes = std::fs::read(path).expect("container file is readable");
    assert!(
        bytes.len() >= CONTAINER_MAGIC.len(),
        "container shorter than its magic"
    );
    assert_eq!(
        &bytes[..CONTAINER_MAGIC.len()],
        &CONTAINER_MAGIC,
        "container magic mismatch"
    );

    let mut input = SliceInput::new(&bytes[CONTAINER_MAGIC.len()..]);

    let mut version = u64::MAX;
    let mut epoch = EpochInfo::default();
    let pairs = codec::parse_map_head(&mut input).expect("container header map");
    for _ in 0..pairs {
        match codec::parse_u64(&mut input).expect("header key") {
            0 => version = codec::parse_u64(&mut input).expect("version"),
            4 => epoch = EpochInfo::decode(&mut input).expect("epoch"),
            _ => codec::skip_item(&mut input).expect("header value"),
        }
    }

    let head = codec::parse_item_head(&mut input).expect("record array opener");
    assert_eq!(head.kind, ItemKind::Array);
    assert!(head.indefinite, "record array must be indefinite");

    let mut entries = Vec::new();
    let mut finalized = false;
    while !input.is_empty() {
        let probe = input.require(1).expect("probe byte")[0];
        if probe == 0xff {
            input.consume(1);
            finalized = true;
            break;
        }
        entries.push(parse_entry(&mut input));
    }

    ParsedContainer {
        version,
        epoch,
        entries,
        finalized,
    }
}

fn parse_entry(input: &mut SliceInput<'_>) -> ContainerEntry {
    let arity = codec::parse_array_head(input).expect("entry tuple head");
    match arity {
        6 => parse_record(input),
        7 => parse_span_start(input),
        2 => parse_span_end(input),
        other => {
            for _ in 0..other {
                codec::skip_item(input).expect("unknown entry field");
            }
            ContainerEntry::Other
        }
    }
}

fn parse_record(input: &mut SliceInput<'_>) -> ContainerEntry {
    let severity = Severity::decode(input).expect("record severity");

    let owner_arity = codec::parse_array_head(input).expect("owner context");
    let mut scope = None;
    let mut span = None;
    if owner_arity & 1 != 0 {
        scope = Some(codec::parse_text(input).expect("instrumentation scope"));
    }
    if owner_arity & 2 != 0 {
        span = Some(SpanContext {
            trace_id: TraceId::decode(input).expect("owner trace id"),
            span_id: SpanId::decode(input).expect("owner span id"),
        });
    }

    let timestamp = codec::parse_u64(input).expect("record timestamp");
    let message = codec::parse_text(input).expect("record message");
    codec::skip_item(input).expect("format arguments");
    codec::skip_item(input).expect("attributes");

    ContainerEntry::Record {
        severity,
        timestamp,
        scope,
        span,
        message,
    }
}

fn parse_span_start(input: &mut SliceInput<'_>) -> ContainerEntry {
    let id = SpanContext::decode(input).expect("span id");
    let kind = codec::parse_u64(input).expect("span kind");
    let parent = SpanContext::decode(input).expect("span parent");
    codec::parse_u64(input).expect("span timestamp");
    let name = codec::parse_text(input).expect("span name");
    codec::skip_item(input).expect("span links");
    codec::skip_item(input).expect("span attributes");
    ContainerEntry::SpanStart {
        id,
        parent,
        kind,
        name,
    }
}

fn parse_span_end(input: &mut SliceInput<'_>) -> ContainerEntry {
    let id = SpanContext::decode(input).expect("span id");
    codec::parse_u64(input).expect("span timestamp");
    ContainerEntry::SpanEnd { id }
}
