use std::sync::atomic::{AtomicUsize, Ordering};

use comms::specs::LrSchedulerSpec;
use log::info;

use super::{OptErr, Result};

#[derive(Debug, Clone, PartialEq)]
enum Schedule {
    Factor {
        step: usize,
        factor: f32,
        stop_factor_lr: f32,
    },
    MultiFactor {
        steps: Vec<usize>,
        factor: f32,
    },
}

/// Decays the learning rate as the global update count grows.
#[derive(Debug)]
pub struct LrScheduler {
    schedule: Schedule,
    base_lr: f32,
    decays: AtomicUsize,
}

impl LrScheduler {
    /// Creates a new `LrScheduler` from it's specification.
    ///
    /// # Arguments
    /// * `spec` - The schedule.
    /// * `base_lr` - The learning rate before any decay.
    ///
    /// # Returns
    /// The scheduler or `InvalidParams` if a step is zero, the steps aren't increasing
    /// or the factor would grow the learning rate.
    pub fn new(spec: &LrSchedulerSpec, base_lr: f32) -> Result<Self> {
        let schedule = match spec {
            LrSchedulerSpec::Factor {
                step,
                factor,
                stop_factor_lr,
            } => {
                if *step < 1 {
                    return Err(OptErr::InvalidParams(
                        "schedule step must be at least 1".into(),
                    ));
                }

                Schedule::Factor {
                    step: *step,
                    factor: *factor,
                    stop_factor_lr: *stop_factor_lr,
                }
            }
            LrSchedulerSpec::MultiFactor { steps, factor } => {
                if steps.first().is_some_and(|&s| s < 1) || steps.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(OptErr::InvalidParams(
                        "schedule steps must be increasing and at least 1".into(),
                    ));
                }

                Schedule::MultiFactor {
                    steps: steps.clone(),
                    factor: *factor,
                }
            }
        };

        let factor = match &schedule {
            Schedule::Factor { factor, .. } | Schedule::MultiFactor { factor, .. } => *factor,
        };

        if !(factor > 0. && factor <= 1.) {
            return Err(OptErr::InvalidParams(format!(
                "schedule factor must be in (0, 1], got {factor}"
            )));
        }

        Ok(Self {
            schedule,
            base_lr,
            decays: AtomicUsize::new(0),
        })
    }

    /// Returns the learning rate after `num_update` updates.
    pub fn lr(&self, num_update: usize) -> f32 {
        let (decays, factor) = match &self.schedule {
            Schedule::Factor { step, factor, .. } => (num_update.saturating_sub(1) / step, *factor),
            Schedule::MultiFactor { steps, factor } => {
                (steps.iter().filter(|&&s| num_update > s).count(), *factor)
            }
        };

        let mut lr = self.base_lr * factor.powi(decays as i32);

        if let Schedule::Factor { stop_factor_lr, .. } = self.schedule {
            lr = lr.max(stop_factor_lr);
        }

        let prev = self.decays.fetch_max(decays, Ordering::Relaxed);
        if decays > prev {
            info!(num_update = num_update; "changed learning rate to {lr:e}");
        }

        lr
    }
}
