//! The host reference graphs.

mod dense;

pub use dense::{Dense, DenseOutput};
