//! Error types and TNFS status codes.
//!
//! Two kinds of failure:
//!
//! - [`Error`] is a local fault: the socket failed, the reply never came, the bytes on
//!   the wire did not parse, or the session was used in the wrong state.
//! - [`Status`] is the status byte of a well-formed reply. Nonzero values such as
//!   [`Status::EOF`] or [`Status::ENOENT`] are ordinary outcomes of an exchange and are
//!   returned as values, never as an `Error`.

use std::{fmt, io, time::Duration};

use crate::fcall::{Opcode, Version};

pub use self::status::Status;

/// Description used by the string decoder when no terminator is found.
pub(crate) const UNTERMINATED: &str = "unterminated string";

/// Local failure of an operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport reported an error while sending or receiving.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// No reply arrived before the session timeout elapsed.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The buffer ended before the message was complete.
    #[error("message truncated")]
    Truncated,

    /// A field could not be encoded or decoded.
    #[error("malformed field: {0}")]
    MalformedField(&'static str),

    /// The header names a different command than the one being decoded.
    #[error("opcode mismatch: expected {expected:?}, found 0x{found:02x}")]
    OpcodeMismatch { expected: Opcode, found: u8 },

    /// The header carries an opcode outside the protocol.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// A value does not fit the width the protocol gives it.
    #[error("{field} exceeds {max}")]
    OutOfRange { field: &'static str, max: u64 },

    /// The operation needs a mounted session.
    #[error("session is not mounted")]
    NotMounted,

    /// Mount was requested on a session that already holds a connection id.
    #[error("session is already mounted")]
    AlreadyMounted,

    /// The session has been unmounted or abandoned and cannot be mounted again.
    #[error("session is closed")]
    SessionClosed,

    /// The negotiated protocol version is too old for the operation.
    #[error("server protocol {negotiated} does not support this operation (needs {required})")]
    Unsupported {
        required: Version,
        negotiated: Version,
    },

    /// A chunked transfer stopped part way through.
    #[error("transfer interrupted after {transferred} bytes: {source}")]
    Incomplete {
        transferred: usize,
        #[source]
        source: Box<Error>,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    /// True for socket errors and timeouts, which the caller may retry.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_) | Error::Timeout(_) => true,
            Error::Incomplete { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// True when more bytes could complete the message.
    ///
    /// Used by stream framing to tell a partial reply from a broken one.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Truncated | Error::MalformedField(UNTERMINATED))
    }
}

/// TNFS status codes carried in every reply.
pub mod status {
    use super::fmt;

    /// Status byte of a reply. Zero means success.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Status(pub u8);

    macro_rules! status_codes {
        ($($(#[$meta:meta])* $name:ident = $code:literal, $text:literal;)*) => {
            impl Status {
                $(
                    $(#[$meta])*
                    pub const $name: Status = Status($code);
                )*

                /// Human readable description of the status.
                pub fn description(self) -> &'static str {
                    match self.0 {
                        $($code => $text,)*
                        _ => "Unknown error",
                    }
                }

                /// Symbolic name of the status, if it is a known one.
                pub fn name(self) -> Option<&'static str> {
                    match self.0 {
                        $($code => Some(stringify!($name)),)*
                        _ => None,
                    }
                }
            }
        };
    }

    status_codes! {
        SUCCESS      = 0x00, "Success";
        EPERM        = 0x01, "Operation not permitted";
        ENOENT       = 0x02, "No such file or directory";
        EIO          = 0x03, "I/O error";
        ENXIO        = 0x04, "No such device or address";
        E2BIG        = 0x05, "Argument list too long";
        EBADF        = 0x06, "Bad file number";
        EAGAIN       = 0x07, "Try again";
        ENOMEM       = 0x08, "Out of memory";
        EACCES       = 0x09, "Permission denied";
        EBUSY        = 0x0a, "Device or resource busy";
        EEXIST       = 0x0b, "File exists";
        ENOTDIR      = 0x0c, "Is not a directory";
        EISDIR       = 0x0d, "Is a directory";
        EINVAL       = 0x0e, "Invalid argument";
        ENFILE       = 0x0f, "File table overflow";
        EMFILE       = 0x10, "Too many open files";
        EFBIG        = 0x11, "File too large";
        ENOSPC       = 0x12, "No space left on device";
        ESPIPE       = 0x13, "Attempt to seek on a FIFO or pipe";
        EROFS        = 0x14, "Read only filesystem";
        ENAMETOOLONG = 0x15, "Filename too long";
        ENOSYS       = 0x16, "Function not implemented";
        ENOTEMPTY    = 0x17, "Directory not empty";
        ELOOP        = 0x18, "Too many symbolic links encountered";
        ENODATA      = 0x19, "No data available";
        ENOSTR       = 0x1a, "Out of streams resources";
        EPROTO       = 0x1b, "Protocol error";
        EBADFD       = 0x1c, "File descriptor in bad state";
        EUSERS       = 0x1d, "Too many users";
        ENOBUFS      = 0x1e, "No buffer space available";
        EALREADY     = 0x1f, "Operation already in progress";
        ESTALE       = 0x20, "Stale TNFS handle";
        /// End of file or end of directory.
        EOF          = 0x21, "End of file";
        /// The server does not know the handle or session.
        INVALID_HANDLE = 0xff, "Invalid TNFS handle";
    }

    impl Status {
        pub fn is_success(self) -> bool {
            self == Status::SUCCESS
        }

        pub fn is_eof(self) -> bool {
            self == Status::EOF
        }

        pub fn code(self) -> u8 {
            self.0
        }
    }

    impl From<u8> for Status {
        fn from(code: u8) -> Self {
            Status(code)
        }
    }

    impl fmt::Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.name() {
                Some(name) => write!(f, "{} ({}, 0x{:02x})", self.description(), name, self.0),
                None => write!(f, "{} (0x{:02x})", self.description(), self.0),
            }
        }
    }

    impl std::error::Error for Status {}
}
