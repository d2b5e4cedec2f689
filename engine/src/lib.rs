//! The execution engine the synchronization layer is written against.
//!
//! Tensors carry a dependency variable so asynchronous operations scheduled
//! through the `Engine` and synchronous readers agree on ordering.

pub mod cpu;
mod engine;
mod error;
mod graph;
mod shape;
mod tensor;
mod var;

pub use engine::{Engine, OpArgs};
pub use error::{EngineErr, Result};
pub use graph::{BoundGraph, Graph, InferredShapes};
pub use shape::{Context, DType, DeviceType, Shape};
pub use tensor::Tensor;
