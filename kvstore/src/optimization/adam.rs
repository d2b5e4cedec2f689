use rayon::prelude::*;

use super::{
    Hyper, Result, StateBuffers,
    optimizer::{Rule, Step, mismatch},
    state::{check_len, zeros},
};

#[derive(Debug)]
pub struct Adam {
    hyper: Hyper,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `hyper` - The shared hyperparameters.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn new(hyper: Hyper, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            hyper,
            beta1,
            beta2,
            epsilon,
        }
    }
}

impl Rule for Adam {
    fn hyper(&self) -> &Hyper {
        &self.hyper
    }

    fn hyper_mut(&mut self) -> &mut Hyper {
        &mut self.hyper
    }

    fn create_buffers(&self, len: usize) -> StateBuffers {
        StateBuffers::Adam {
            mean: zeros(len),
            var: zeros(len),
        }
    }

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()> {
        let StateBuffers::Adam { mean, var } = buffers else {
            return Err(mismatch("adam", buffers));
        };

        check_len(mean, step.weight.len())?;
        check_len(var, step.weight.len())?;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;
        let Step {
            lr,
            wd,
            t,
            weight,
            grad,
        } = step;

        let t = t as i32;
        let coef1 = 1. - b1.powi(t);
        let coef2 = 1. - b2.powi(t);
        let lr_t = lr * coef2.sqrt() / coef1;

        weight
            .par_iter_mut()
            .zip(grad)
            .zip(mean.par_iter_mut())
            .zip(var.par_iter_mut())
            .for_each(|(((w, g), m), v)| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *w -= lr_t * *m / (v.sqrt() + eps);

                if wd > 0. {
                    *w -= lr * wd * *w;
                }
            });

        Ok(())
    }
}
