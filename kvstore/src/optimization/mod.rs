mod adadelta;
mod adagrad;
mod adam;
mod error;
mod hyper;
mod nag;
mod optimizer;
mod rmsprop;
mod scheduler;
mod sgd;
mod state;
mod updater;

pub use adadelta::AdaDelta;
pub use adagrad::AdaGrad;
pub use adam::Adam;
pub use error::{OptErr, Result};
pub use hyper::{Hyper, ParamId};
pub use nag::Nag;
pub use optimizer::{Optimizer, Update};
pub use rmsprop::RmsProp;
pub use scheduler::LrScheduler;
pub use sgd::Sgd;
pub use state::{OptimizerState, StateBuffers};
pub use updater::Updater;
