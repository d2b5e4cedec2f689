use rayon::prelude::*;

use super::{
    Hyper, Result, StateBuffers,
    optimizer::{Rule, Step, mismatch},
    state::{check_len, zeros},
};

#[derive(Debug)]
pub struct AdaGrad {
    hyper: Hyper,
    eps: f32,
}

impl AdaGrad {
    pub fn new(hyper: Hyper, eps: f32) -> Self {
        Self { hyper, eps }
    }
}

impl Rule for AdaGrad {
    fn hyper(&self) -> &Hyper {
        &self.hyper
    }

    fn hyper_mut(&mut self) -> &mut Hyper {
        &mut self.hyper
    }

    fn create_buffers(&self, len: usize) -> StateBuffers {
        StateBuffers::AdaGrad {
            history: zeros(len),
        }
    }

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()> {
        let StateBuffers::AdaGrad { history } = buffers else {
            return Err(mismatch("adagrad", buffers));
        };

        check_len(history, step.weight.len())?;

        let eps = self.eps;
        let Step {
            lr, wd, weight, grad, ..
        } = step;

        weight
            .par_iter_mut()
            .zip(grad)
            .zip(history.par_iter_mut())
            .for_each(|((w, g), h)| {
                *h += g * g;
                *w -= lr * (g / (*h + eps).sqrt() + wd * *w);
            });

        Ok(())
    }
}
