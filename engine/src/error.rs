use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::DType;

/// The result type for the engine crate.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// The errors raised while allocating, viewing or computing tensors.
///
/// It's `Clone` because a failed asynchronous operation records its error on every
/// tensor it writes, to be surfaced on each later read.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineErr {
    TypeMismatch { expected: DType, found: DType },
    ShapeMismatch(String),
    AllocationFailure { elements: usize },
    Op(String),
}

impl Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::ShapeMismatch(msg) => write!(f, "shape mismatch: {msg}"),
            Self::AllocationFailure { elements } => {
                write!(f, "failed to allocate a tensor of {elements} elements")
            }
            Self::Op(msg) => write!(f, "operation failed: {msg}"),
        }
    }
}

impl Error for EngineErr {}
