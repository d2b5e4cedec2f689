use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use comms::Key;
use engine::EngineErr;

use crate::optimization::OptErr;

/// The result type for the key-value store.
pub type Result<T> = std::result::Result<T, KvErr>;

/// The errors raised by the key-value store, its servers and transports.
#[derive(Debug)]
pub enum KvErr {
    /// Push or pull of a key that was never initialized.
    UninitializedKey(Key),
    /// A second initialization of the same key.
    DuplicateKey(Key),
    /// A value whose shape or type differs from the initialized one.
    TypeMismatch(String),
    UnknownOptimizer(String),
    InvalidConfiguration(String),
    Optimizer(OptErr),
    Engine(EngineErr),
    /// An error reported by the other end of a connection.
    Remote(String),
    Io(io::Error),
}

impl Display for KvErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UninitializedKey(key) => write!(f, "key {key} was never initialized"),
            Self::DuplicateKey(key) => write!(f, "key {key} was already initialized"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            Self::UnknownOptimizer(name) => write!(f, "unknown optimizer {name}"),
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Optimizer(e) => write!(f, "optimizer error: {e}"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for KvErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Optimizer(e) => Some(e),
            Self::Engine(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OptErr> for KvErr {
    fn from(value: OptErr) -> Self {
        match value {
            OptErr::UnknownOptimizer(name) => Self::UnknownOptimizer(name),
            other => Self::Optimizer(other),
        }
    }
}

impl From<EngineErr> for KvErr {
    fn from(value: EngineErr) -> Self {
        Self::Engine(value)
    }
}

impl From<io::Error> for KvErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<KvErr> for io::Error {
    fn from(value: KvErr) -> Self {
        match value {
            KvErr::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}
