//! Replicates a computation graph across devices and drives it's passes.
//!
//! Every device works on a contiguous slice of each batch, the slices follow the
//! devices' relative work loads.

mod binding;
mod data;
mod error;
mod group;
mod manager;
mod metric;
mod pool;
mod slice;

pub use binding::DeviceExecutor;
pub use data::{DataBatch, DataDesc, DataIter};
pub use error::{ExecErr, Result};
pub use group::{ExecutorGroup, check_arguments};
pub use manager::{ExecutorManager, SymGen};
pub use metric::{Accuracy, EvalMetric, Mae, Mse, Rmse, create_metric};
pub use pool::BufferPool;
pub use slice::split_input_slice;
