use rayon::prelude::*;

use super::{
    Hyper, Result, StateBuffers,
    optimizer::{Rule, Step, mismatch},
    state::{check_len, zeros},
};

/// Stochastic gradient descent with optional momentum.
#[derive(Debug)]
pub struct Sgd {
    hyper: Hyper,
    momentum: f32,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `hyper` - The shared hyperparameters.
    /// * `momentum` - The momentum, `0` keeps no state.
    pub fn new(hyper: Hyper, momentum: f32) -> Self {
        Self { hyper, momentum }
    }
}

impl Rule for Sgd {
    fn hyper(&self) -> &Hyper {
        &self.hyper
    }

    fn hyper_mut(&mut self) -> &mut Hyper {
        &mut self.hyper
    }

    fn create_buffers(&self, len: usize) -> StateBuffers {
        if self.momentum == 0. {
            StateBuffers::Stateless
        } else {
            StateBuffers::Momentum(zeros(len))
        }
    }

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()> {
        let Step {
            lr, wd, weight, grad, ..
        } = step;
        let mu = self.momentum;

        match buffers {
            StateBuffers::Stateless => {
                weight
                    .par_iter_mut()
                    .zip(grad)
                    .for_each(|(w, g)| *w -= lr * (g + wd * *w));
            }
            StateBuffers::Momentum(mom) => {
                check_len(mom, weight.len())?;

                weight
                    .par_iter_mut()
                    .zip(grad)
                    .zip(mom.par_iter_mut())
                    .for_each(|((w, g), m)| {
                        *m = mu * *m - lr * (g + wd * *w);
                        *w += *m;
                    });
            }
            other => return Err(mismatch("sgd", other)),
        }

        Ok(())
    }
}
