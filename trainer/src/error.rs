use std::{error::Error, fmt, io};

use engine::EngineErr;
use executor::ExecErr;
use kvstore::{KvErr, optimization::OptErr};

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training session failures.
#[derive(Debug)]
pub enum TrainErr {
    InvalidConfiguration(String),
    Exec(ExecErr),
    Kv(KvErr),
    Optimizer(OptErr),
    Engine(EngineErr),
    Json(serde_json::Error),
    Io(io::Error),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            TrainErr::Exec(e) => write!(f, "executor error: {e}"),
            TrainErr::Kv(e) => write!(f, "kvstore error: {e}"),
            TrainErr::Optimizer(e) => write!(f, "optimizer error: {e}"),
            TrainErr::Engine(e) => write!(f, "engine error: {e}"),
            TrainErr::Json(e) => write!(f, "json error: {e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Exec(e) => Some(e),
            TrainErr::Kv(e) => Some(e),
            TrainErr::Optimizer(e) => Some(e),
            TrainErr::Engine(e) => Some(e),
            TrainErr::Json(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            TrainErr::InvalidConfiguration(_) => None,
        }
    }
}

impl From<ExecErr> for TrainErr {
    fn from(value: ExecErr) -> Self {
        Self::Exec(value)
    }
}

impl From<KvErr> for TrainErr {
    fn from(value: KvErr) -> Self {
        Self::Kv(value)
    }
}

impl From<OptErr> for TrainErr {
    fn from(value: OptErr) -> Self {
        Self::Optimizer(value)
    }
}

impl From<EngineErr> for TrainErr {
    fn from(value: EngineErr) -> Self {
        Self::Engine(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
