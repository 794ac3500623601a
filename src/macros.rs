/// Logs through the thread's implicit context, stamping the call site.
///
/// ```ignore
/// dlog!(Severity::WARN, "queue depth {} exceeds {}", depth, limit);
/// ```
#[macro_export]
macro_rules! dlog {
    ($severity:expr, $message:expr $(, $arg:expr)* $(,)?) => {
        $crate::log_with_active_context(
            $severity,
            $message,
            $crate::SourceLocation::new(file!(), line!()),
            &[$($crate::LogArg::from($arg)),*],
        )
    };
}

/// Logs through an explicit [`LogContext`](crate::LogContext).
#[macro_export]
macro_rules! dlog_to {
    ($ctx:expr, $severity:expr, $message:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(
            &$ctx,
            $severity,
            $message,
            $crate::SourceLocation::new(file!(), line!()),
            &[$($crate::LogArg::from($arg)),*],
        )
    };
}

/// Logs a trace-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_trace {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::TRACE, $message $(, $arg)*)
    };
}

/// Logs a debug-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_debug {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::DEBUG, $message $(, $arg)*)
    };
}

/// Logs an info-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_info {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::INFO, $message $(, $arg)*)
    };
}

/// Logs a warn-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_warn {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::WARN, $message $(, $arg)*)
    };
}

/// Logs an error-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_error {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::ERROR, $message $(, $arg)*)
    };
}

/// Logs a fatal-severity record through the implicit context.
#[macro_export]
macro_rules! dlog_fatal {
    ($message:expr $(, $arg:expr)* $(,)?) => {
        $crate::dlog!($crate::Severity::FATAL, $message $(, $arg)*)
    };
}
