//! A structured, binary, trace-aware logging runtime.
//!
//! Producers write self-describing binary records (log records and span
//! lifecycle messages) into a shared-memory ring bus with wait-free
//! allocation; a single consumer, the [`LogFabric`], drains the bus in
//! batches and fans the messages out to sinks. The rotating set of record
//! container files a file sink produces is tracked by a durable
//! [`FileDatabase`], which also remembers live bus files so that the
//! messages of a crashed process can be recovered.
//!
//! ```no_run
//! use dlog::{
//!     dlog_warn, BasicSinkFrontend, DbFileSinkBackend, DbFileSinkConfig, FileDatabase,
//!     FileSinkId, LogContext, LogFabric, MpscBus, Severity, SpanScope,
//! };
//!
//! # fn main() -> dlog::Result<()> {
//! let mut database = FileDatabase::open("app.drot")?;
//! let bus = MpscBus::create("app.dmpscb", 4, 64 * 1024)?;
//! let mut fabric = LogFabric::new(bus);
//!
//! let backend = DbFileSinkBackend::new(DbFileSinkConfig {
//!     database: database.try_clone()?,
//!     file_name_pattern: "app.{ctr}_{now}.dlog".into(),
//!     sink_id: FileSinkId::DEFAULT,
//!     max_file_size: 8 * 1024 * 1024,
//!     target_buffer_size: 0,
//!     attributes: Default::default(),
//! })?;
//! fabric.attach_sink(Box::new(BasicSinkFrontend::new(Severity::TRACE, backend)));
//!
//! dlog::set_thread_context(LogContext::new(fabric.record_port()));
//!
//! let request = SpanScope::open("handle-request");
//! dlog_warn!("queue depth {} exceeds {}", 17u64, 10u64)?;
//! drop(request);
//!
//! fabric.retire_log_records()?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod bus;
pub(crate) mod catalog;
pub(crate) mod clock;
pub(crate) mod error;
pub(crate) mod fabric;
#[macro_use]
mod macros;
pub(crate) mod sinks;
pub(crate) mod source;
pub(crate) mod types;

pub use dlog_codec as codec;

pub use crate::{
    bus::{
        BufferBus, DbMpscBus, DbMpscBusConfig, MessageBus, MpscBus, RecordBuffer,
        CONSUME_BATCH_SIZE, LOCK_DEADLINE, MAX_MESSAGE_SIZE, MIN_REGION_SIZE,
    },
    catalog::{
        CreatedContainer, CreatedMessageBus, FileDatabase, FileSinkId, MessageBusMeta,
        RecordContainerMeta, CATALOG_FILE_EXTENSION, CATALOG_MAGIC,
    },
    clock::{EpochInfo, LogClock, Timestamp},
    error::{Error, Result},
    fabric::{LogFabric, SerializedMessage, SinkHandle},
    sinks::{
        BasicSinkFrontend, CborAttributeMap, DbFileSinkBackend, DbFileSinkConfig,
        FileSinkBackend, FileSinkConfig, Sink, SinkBackend, CONTAINER_FILE_EXTENSION,
        CONTAINER_MAGIC,
    },
    source::{
        enqueue_message, log, log_with_active_context, set_thread_context, thread_context,
        LogArg, LogContext, LogRecordPort, Loggable, SourceLocation, SpanKind, SpanScope,
    },
    types::{
        ReificationTypeId, ResourceId, Severity, SpanContext, SpanId, TraceId,
        DEFAULT_THRESHOLD, USER_DEFINED_ID_FLAG,
    },
};

pub use crate::bus::mpsc::{BUS_FILE_EXTENSION, BUS_MAGIC};
pub use crate::fabric::preparse_messages;
