pub mod optimizer;
pub mod server;

pub use optimizer::{BaseSpec, LrSchedulerSpec, OptimizerSpec};
pub use server::{ConsistencySpec, ServerSpec, StoreKind};
