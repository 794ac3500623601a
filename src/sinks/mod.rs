//! Sink frontends and backends.
//!
//! A frontend is the policy layer: it holds the severity threshold and a
//! latch for the first error, and permanently disables itself once
//! finalized. The backend is the I/O layer that receives the raw message
//! bytes. The fabric owns frontends as boxed [`Sink`] trait objects and
//! never looks past that interface.

use crate::{
    error::Error,
    fabric::SerializedMessage,
    types::Severity,
};

pub(crate) mod file;

pub use self::file::{
    CborAttributeMap, DbFileSinkBackend, DbFileSinkConfig, FileSinkBackend, FileSinkConfig,
    CONTAINER_FILE_EXTENSION, CONTAINER_MAGIC,
};

/// I/O layer of a sink.
///
/// [`bulk_write`](SinkBackend::bulk_write) receives the raw bytes of each
/// message that passed the frontend's filter; [`sync_output`] is called
/// once per drain round; [`finalize`] closes the backing store and
/// returns its final byte size.
pub trait SinkBackend {
    fn bulk_write(&mut self, bytes: &[u8]) -> crate::error::Result<()>;

    fn sync_output(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> crate::error::Result<u64> {
        Ok(0)
    }
}

/// Policy layer of a sink, as seen by the log fabric.
///
/// The `try_*` operations never propagate errors to the fabric; the first
/// failure is latched into the sink's status and deactivates it, and the
/// return value only says whether the sink is still worth feeding.
pub trait Sink {
    fn try_consume(&mut self, binary_size: usize, messages: &[SerializedMessage<'_>]) -> bool;

    fn try_sync(&mut self) -> bool;

    fn try_finalize(&mut self) -> bool;

    fn is_active(&self) -> bool;

    fn last_status(&self) -> Option<&Error>;

    fn clear_last_status(&mut self);
}

/// Standard frontend: filters records below the threshold and streams
/// everything else to the backend byte for byte.
///
/// Non-record message kinds (span lifecycle, even malformed data) pass
/// through unfiltered; a container is only complete if it carries the
/// span bracketing of the records it holds.
pub struct BasicSinkFrontend<B> {
    threshold: Severity,
    last_status: Option<Error>,
    backend: B,
}

impl<B: SinkBackend> BasicSinkFrontend<B> {
    pub fn new(threshold: Severity, backend: B) -> Self {
        Self {
            threshold,
            last_status: None,
            backend,
        }
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn do_consume(&mut self, messages: &[SerializedMessage<'_>]) -> crate::error::Result<()> {
        for message in messages {
            if let SerializedMessage::Record { severity, .. } = message {
                if *severity < self.threshold {
                    continue;
                }
            }
            self.backend.bulk_write(message.raw())?;
        }
        Ok(())
    }
}

impl<B: SinkBackend> Sink for BasicSinkFrontend<B> {
    fn try_consume(&mut self, _binary_size: usize, messages: &[SerializedMessage<'_>]) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.do_consume(messages) {
            Ok(()) => true,
            Err(error) => {
                self.last_status = Some(error);
                false
            }
        }
    }

    fn try_sync(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.backend.sync_output() {
            Ok(()) => true,
            Err(error) => {
                self.last_status = Some(error);
                false
            }
        }
    }

    fn try_finalize(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.backend.finalize() {
            Ok(_) => {
                // Nothing may be consumed past this point.
                self.threshold = Severity::DISABLE;
                true
            }
            Err(error) => {
                self.last_status = Some(error);
                false
            }
        }
    }

    fn is_active(&self) -> bool {
        self.threshold < Severity::DISABLE && self.last_status.is_none()
    }

    fn last_status(&self) -> Option<&Error> {
        self.last_status.as_ref()
    }

    fn clear_last_status(&mut self) {
        self.last_status = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::preparse_messages;

    /// Backend collecting everything it is fed; failure injectable.
    #[derive(Default)]
    struct MemorySinkBackend {
        bytes: Vec<u8>,
        fail_next: bool,
        synced: usize,
        finalized: bool,
    }

    impl SinkBackend for MemorySinkBackend {
        fn bulk_write(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
            if self.fail_next {
                return Err(Error::Bad);
            }
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }

        fn sync_output(&mut self) -> crate::error::Result<()> {
            self.synced += 1;
            Ok(())
        }

        fn finalize(&mut self) -> crate::error::Result<u64> {
            self.finalized = true;
            Ok(self.bytes.len() as u64)
        }
    }

    fn encoded_record(severity: Severity) -> Vec<u8> {
        crate::source::test_support::encode_minimal_record(severity, "msg")
    }

    #[test]
    fn threshold_filters_records_only() {
        let warn = encoded_record(Severity::WARN);
        let debug = encoded_record(Severity::DEBUG);
        let garbage: Vec<u8> = vec![0x9f, 0x00];

        let raws: Vec<&[u8]> = vec![&warn, &debug, &garbage];
        let (binary_size, parses) = preparse_messages(&raws);

        let mut sink = BasicSinkFrontend::new(Severity::WARN, MemorySinkBackend::default());
        assert!(sink.try_consume(binary_size, &parses));

        // The warn record and the malformed bytes pass; debug is dropped.
        let mut expected = warn.clone();
        expected.extend_from_slice(&garbage);
        assert_eq!(sink.backend().bytes, expected);
    }

    #[test]
    fn first_error_latches_and_deactivates() {
        let warn = encoded_record(Severity::WARN);
        let raws: Vec<&[u8]> = vec![&warn];
        let (binary_size, parses) = preparse_messages(&raws);

        let mut sink = BasicSinkFrontend::new(Severity::TRACE, MemorySinkBackend::default());
        sink.backend_mut().fail_next = true;

        assert!(!sink.try_consume(binary_size, &parses));
        assert!(!sink.is_active());
        assert!(matches!(sink.last_status(), Some(Error::Bad)));

        // Still inactive even though the backend would now succeed.
        sink.backend_mut().fail_next = false;
        assert!(!sink.try_consume(binary_size, &parses));

        sink.clear_last_status();
        assert!(sink.try_consume(binary_size, &parses));
    }

    #[test]
    fn finalize_disables_the_frontend() {
        let mut sink = BasicSinkFrontend::new(Severity::TRACE, MemorySinkBackend::default());
        assert!(sink.try_finalize());
        assert!(sink.backend().finalized);
        assert!(!sink.is_active());
        assert_eq!(sink.threshold(), Severity::DISABLE);
        assert!(!sink.try_finalize());
    }
}
