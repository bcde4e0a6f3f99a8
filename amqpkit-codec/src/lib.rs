//! Data structures and converter functions for dealing with AMQP 0-9-1 frames.
//!
//! All the data types are in the `frame` module, the `codec` implements
//! the encoding and the decoding, and `content` splits and reassembles
//! message bodies carried by content frames.
pub mod codec;
pub mod content;
pub mod frame;


#[macro_use]
extern crate bitflags;

use std::fmt;

/// Reply code of a frame which could not be parsed.
pub const FRAME_ERROR: u16 = 501;
/// Reply code of a frame with invalid field values.
pub const SYNTAX_ERROR: u16 = 502;
/// Reply code of a frame arriving in the wrong order.
pub const UNEXPECTED_FRAME: u16 = 505;
/// Not an AMQP reply code, it marks errors of the underlying transport.
pub const IO_ERROR: u16 = 0;

/// Error struct used by the crate. The `code` is the AMQP reply code which
/// describes the problem best.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameError {
    pub code: u16,
    pub message: String,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// The error comes from the transport, not from the content of a frame.
    pub fn is_io_error(&self) -> bool {
        self.code == IO_ERROR
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError {
            code: IO_ERROR,
            message: format!("I/O error: {err}"),
        }
    }
}

/// Type alias for a simplified Result with `FrameError`.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Shorthand for making errors with error code and error message.
///
/// ```no_run
/// use amqpkit_codec::frame_error;
/// use amqpkit_codec::FrameError;
/// use amqpkit_codec::frame::AMQPFieldValue;
///
/// fn as_string(val: AMQPFieldValue) -> Result<String, FrameError> {
///     if let AMQPFieldValue::LongString(s) = val {
///         return Ok(s)
///     }
///
///     frame_error!(502, "Value cannot be converted to string")
/// }
/// ```
#[macro_export]
macro_rules! frame_error {
    ($code:expr, $message:expr) => {
        ::std::result::Result::Err($crate::FrameError {
            code: $code,
            message: ::std::string::String::from($message),
        })
    };
}
