//! Data parallel training of a graph across devices, synchronized through a `KVStore`.

mod callback;
mod config;
mod error;
pub mod initialization;
mod model;
mod recorder;
pub mod store;

pub use callback::{BatchEndCallback, BatchEndParam, Speedometer};
pub use config::TrainingConfig;
pub use error::{Result, TrainErr};
pub use initialization::Initializer;
pub use model::Trainer;
pub use recorder::{Phase, Record, TrainingMetricsRecorder};
