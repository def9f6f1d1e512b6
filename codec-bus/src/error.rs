//! Error model shared by codecs and adapters.

use thiserror::Error;

/// Invalid argument (bad index, range outside a buffer, malformed crypto layout).
pub const ERROR_INVALID_ARGUMENT: i32 = -22;
/// Operation not allowed in the codec's current state.
pub const ERROR_INVALID_STATE: i32 = -38;
/// The codec could not find or allocate the resources it needs.
pub const ERROR_INSUFFICIENT_RESOURCE: i32 = 1100;
/// The codec was reclaimed by the platform and must be released.
pub const ERROR_RECLAIMED: i32 = 1101;
/// The decoding engine rejected or failed to process the data.
pub const ERROR_DECODE: i32 = 1200;

pub type CodecResult<T> = std::result::Result<T, CodecError>;
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// Retrying the same call later may succeed.
    Transient,
    /// The session can continue after a stop/configure/start cycle.
    Recoverable,
    /// The session is lost.
    Fatal,
}

/// Failure reported by a [`Codec`](crate::codec::Codec), either synchronously
/// from a call or asynchronously through an error notification.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message} (code {code}, {kind:?})")]
pub struct CodecError {
    code: i32,
    message: String,
    kind: CodecErrorKind,
}

impl CodecError {
    pub fn new(code: i32, kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind,
        }
    }

    pub fn fatal(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, CodecErrorKind::Fatal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_ARGUMENT, CodecErrorKind::Fatal, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_STATE, CodecErrorKind::Fatal, message)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> CodecErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CodecErrorKind::Transient
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == CodecErrorKind::Recoverable
    }
}

/// Errors surfaced by a codec adapter.
///
/// Every variant is terminal for the session: the caller is expected to
/// `release()` the adapter and build a new one.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// `initialize` failed; partially created resources were already released.
    #[error("codec configuration failed: {0}")]
    Configuration(#[source] CodecError),

    /// The codec failed while running. Re-raised on every poll until release.
    #[error("codec runtime error: {0}")]
    CodecRuntime(#[source] CodecError),

    /// Operation called in the wrong lifecycle state or with invalid arguments.
    #[error("illegal adapter usage: {0}")]
    Usage(String),

    /// A blocking wait was cut short because the worker it waited on went away.
    #[error("interrupted while {0}")]
    Interrupted(String),
}

impl AdapterError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// The underlying codec error, for configuration and runtime failures.
    pub fn codec_error(&self) -> Option<&CodecError> {
        match self {
            AdapterError::Configuration(e) | AdapterError::CodecRuntime(e) => Some(e),
            AdapterError::Usage(_) | AdapterError::Interrupted(_) => None,
        }
    }
}
