use std::{error::Error, fmt, io};

use engine::EngineErr;

/// The executor module's result type.
pub type Result<T> = std::result::Result<T, ExecErr>;

/// Failures binding or driving executors.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecErr {
    /// Bad work loads, empty slices or inconsistent inputs.
    InvalidConfiguration(String),
    /// The graph lists an argument or auxiliary state twice.
    DuplicateArgument(String),
    TypeMismatch(String),
    Engine(EngineErr),
}

impl fmt::Display for ExecErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecErr::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            ExecErr::DuplicateArgument(name) => write!(
                f,
                "duplicated argument name \"{name}\", parameter names must be unique"
            ),
            ExecErr::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            ExecErr::Engine(e) => write!(f, "engine error: {e}"),
        }
    }
}

impl Error for ExecErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExecErr::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineErr> for ExecErr {
    fn from(value: EngineErr) -> Self {
        Self::Engine(value)
    }
}

impl From<ExecErr> for io::Error {
    fn from(value: ExecErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
