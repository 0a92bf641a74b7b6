//! The `utils` module provides the pieces shared by every other module:
//! error types, the error-reporting sink and logging initialization.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{ErrorSink, PersistenceError, TracingErrorSink};
    use super::logging;
    use serial_test::serial;
    use tracing::Level;

    #[test]
    fn test_parse_level_names() {
        assert_eq!(logging::parse_level("warning"), Level::WARN);
        assert_eq!(logging::parse_level(" DEBUG "), Level::DEBUG);
        assert_eq!(logging::parse_level("trace"), Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), Level::INFO);
    }

    #[test]
    #[serial]
    fn test_logging_init_is_repeatable() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        temp_env::with_var(logging::LOG_ENV, Some("warn"), logging::init_from_env);
    }

    #[test]
    fn test_tracing_sink_reports_without_panicking() {
        logging::init("error");
        TracingErrorSink.report("PUSH", "queue:orders", &PersistenceError::Closed);
    }
}
