use rayon::prelude::*;

use super::{
    Hyper, Result, StateBuffers,
    optimizer::{Rule, Step, mismatch},
    state::{check_len, zeros},
};

/// AdaDelta, it ignores the learning rate.
#[derive(Debug)]
pub struct AdaDelta {
    hyper: Hyper,
    rho: f32,
    epsilon: f32,
}

impl AdaDelta {
    pub fn new(hyper: Hyper, rho: f32, epsilon: f32) -> Self {
        Self {
            hyper,
            rho,
            epsilon,
        }
    }
}

impl Rule for AdaDelta {
    fn hyper(&self) -> &Hyper {
        &self.hyper
    }

    fn hyper_mut(&mut self) -> &mut Hyper {
        &mut self.hyper
    }

    fn create_buffers(&self, len: usize) -> StateBuffers {
        StateBuffers::AdaDelta {
            acc_g: zeros(len),
            acc_delta: zeros(len),
        }
    }

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()> {
        let StateBuffers::AdaDelta { acc_g, acc_delta } = buffers else {
            return Err(mismatch("adadelta", buffers));
        };

        check_len(acc_g, step.weight.len())?;
        check_len(acc_delta, step.weight.len())?;

        let Self { rho, epsilon, .. } = *self;
        let Step {
            wd, weight, grad, ..
        } = step;

        weight
            .par_iter_mut()
            .zip(grad)
            .zip(acc_g.par_iter_mut())
            .zip(acc_delta.par_iter_mut())
            .for_each(|(((w, g), ag), ad)| {
                *ag = rho * *ag + (1. - rho) * g * g;
                let delta = (*ad + epsilon).sqrt() / (*ag + epsilon).sqrt() * g;
                *ad = rho * *ad + (1. - rho) * delta * delta;
                *w -= delta + wd * *w;
            });

        Ok(())
    }
}
