//! Wire protocol for the Instrumental collector.
//!
//! The protocol is line-oriented ASCII. The client only ever writes; nothing sent back by the collector is
//! interpreted. A session is opened with a handshake line followed by an authentication line, and every line after
//! that is a single command:
//!
//! ```text
//! hello version 1.0
//! authenticate <api_key>
//! gauge <metric_name> <value> <unix_epoch_seconds>
//! increment <metric_name> <value> <unix_epoch_seconds>
//! notice <unix_epoch_seconds> <duration> <message>
//! ```
use std::{
    fmt::Write as _,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Handshake line written at the start of every session.
pub const HELLO_LINE: &str = "hello version 1.0";

/// Default collector endpoint.
pub const DEFAULT_ENDPOINT: &str = "collector.instrumentalapp.com:8000";

/// Counter incremented whenever a caller supplies an invalid metric name.
pub const INVALID_METRIC_NAME: &str = "agent.invalid_metric";

// Largest magnitude below which every integral `f64` is exactly representable as an `i64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

static METRIC_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)+$").expect("metric name pattern is valid")
});

/// Errors caused by caller input that cannot be represented in the protocol.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The metric name is not a dot-separated sequence of at least two segments.
    #[error("invalid metric name: {name:?}")]
    InvalidMetricName {
        /// The rejected name.
        name: String,
    },

    /// The notice message contains a line terminator.
    #[error("invalid notice message: {message:?}")]
    InvalidNotice {
        /// The rejected message.
        message: String,
    },

    /// The value is NaN or infinite.
    #[error("metric values must be finite, got {value}")]
    NonFiniteValue {
        /// The rejected value.
        value: f64,
    },
}

/// Errors that occur while rendering an otherwise valid command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The timestamp lies before the UNIX epoch and has no protocol representation.
    #[error("timestamp is before the UNIX epoch")]
    TimestampBeforeEpoch,
}

/// Checks that `name` is a valid metric name.
///
/// A valid name consists of at least two segments separated by dots, where each segment is made of ASCII letters,
/// digits, underscores and dashes.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidMetricName`] if the name does not match.
pub fn validate_metric_name(name: &str) -> Result<(), ValidationError> {
    if METRIC_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidMetricName { name: name.to_string() })
    }
}

/// Checks that a notice message fits on a single protocol line.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidNotice`] if the message contains a carriage return or line feed.
pub fn validate_notice(message: &str) -> Result<(), ValidationError> {
    if message.contains(&['\r', '\n'][..]) {
        Err(ValidationError::InvalidNotice { message: message.to_string() })
    } else {
        Ok(())
    }
}

/// Checks that a metric value is finite.
///
/// # Errors
///
/// Returns [`ValidationError::NonFiniteValue`] for NaN and infinities.
pub fn validate_value(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFiniteValue { value })
    }
}

/// Builds the authentication line for the given API key.
pub fn authenticate_line(api_key: &str) -> String {
    format!("authenticate {api_key}")
}

/// Builds a `gauge` command.
///
/// # Errors
///
/// Returns an error if `time` is before the UNIX epoch.
pub fn gauge_line(name: &str, value: f64, time: SystemTime) -> Result<String, FormatError> {
    metric_line("gauge", name, value, time)
}

/// Builds an `increment` command.
///
/// # Errors
///
/// Returns an error if `time` is before the UNIX epoch.
pub fn increment_line(name: &str, value: f64, time: SystemTime) -> Result<String, FormatError> {
    metric_line("increment", name, value, time)
}

/// Builds a `notice` command.
///
/// # Errors
///
/// Returns an error if `time` is before the UNIX epoch.
pub fn notice_line(time: SystemTime, duration: Duration, message: &str) -> Result<String, FormatError> {
    let timestamp = epoch_seconds(time)?;
    let mut formatter = ValueFormatter::new();

    let mut line = String::with_capacity(24 + message.len());
    line.push_str("notice ");
    line.push_str(formatter.format_u64(timestamp));
    line.push(' ');
    line.push_str(formatter.format_f64(duration.as_secs_f64()));
    line.push(' ');
    line.push_str(message);
    Ok(line)
}

fn metric_line(
    command: &str,
    name: &str,
    value: f64,
    time: SystemTime,
) -> Result<String, FormatError> {
    let timestamp = epoch_seconds(time)?;
    let mut formatter = ValueFormatter::new();

    let mut line = String::with_capacity(command.len() + name.len() + 32);
    // Writing into a `String` cannot fail.
    let _ = write!(
        line,
        "{command} {name} {} {}",
        formatter.format_f64(value),
        itoa::Buffer::new().format(timestamp)
    );
    Ok(line)
}

fn epoch_seconds(time: SystemTime) -> Result<u64, FormatError> {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| FormatError::TimestampBeforeEpoch)
}

/// Renders numbers the way the collector expects them: integral values without a fractional part, everything else
/// in its shortest round-trip form.
struct ValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl ValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format_u64(&mut self, value: u64) -> &str {
        self.int_writer.format(value)
    }

    fn format_f64(&mut self, value: f64) -> &str {
        if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
            self.int_writer.format(value as i64)
        } else {
            self.float_writer.format(value)
        }
    }
}
