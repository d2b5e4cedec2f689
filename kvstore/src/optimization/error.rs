use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type for the optimization module.
pub type Result<T> = std::result::Result<T, OptErr>;

/// The errors raised while creating optimizers or applying updates.
#[derive(Debug, Clone, PartialEq)]
pub enum OptErr {
    UnknownOptimizer(String),
    InvalidParams(String),
    /// The state handed to an update was created by another kind of optimizer.
    StateMismatch(String),
    SizeMismatch { expected: usize, found: usize },
}

impl Display for OptErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOptimizer(name) => write!(f, "unknown optimizer {name}"),
            Self::InvalidParams(msg) => write!(f, "invalid optimizer parameters: {msg}"),
            Self::StateMismatch(msg) => write!(f, "optimizer state mismatch: {msg}"),
            Self::SizeMismatch { expected, found } => {
                write!(f, "expected {expected} elements, found {found}")
            }
        }
    }
}

impl Error for OptErr {}
