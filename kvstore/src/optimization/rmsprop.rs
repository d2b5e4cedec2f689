use rayon::prelude::*;

use super::{
    Hyper, Result, StateBuffers,
    optimizer::{Rule, Step, mismatch},
    state::{check_len, zeros},
};

/// RMSProp with a running mean of the gradient and a momentum on the delta.
#[derive(Debug)]
pub struct RmsProp {
    hyper: Hyper,
    gamma1: f32,
    gamma2: f32,
}

impl RmsProp {
    pub fn new(hyper: Hyper, gamma1: f32, gamma2: f32) -> Self {
        Self {
            hyper,
            gamma1,
            gamma2,
        }
    }
}

impl Rule for RmsProp {
    fn hyper(&self) -> &Hyper {
        &self.hyper
    }

    fn hyper_mut(&mut self) -> &mut Hyper {
        &mut self.hyper
    }

    fn create_buffers(&self, len: usize) -> StateBuffers {
        StateBuffers::RmsProp {
            n: zeros(len),
            g: zeros(len),
            delta: zeros(len),
        }
    }

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()> {
        let StateBuffers::RmsProp { n, g, delta } = buffers else {
            return Err(mismatch("rmsprop", buffers));
        };

        for buf in [&*n, &*g, &*delta] {
            check_len(buf, step.weight.len())?;
        }

        let Self { gamma1, gamma2, .. } = *self;
        let Step {
            lr, wd, weight, grad, ..
        } = step;

        weight
            .par_iter_mut()
            .zip(grad)
            .zip(n.par_iter_mut())
            .zip(g.par_iter_mut())
            .zip(delta.par_iter_mut())
            .for_each(|((((w, gr), n), g), d)| {
                *n = (1. - gamma1) * gr * gr + gamma1 * *n;
                *g = (1. - gamma1) * gr + gamma1 * *g;
                *d = gamma2 * *d - lr * (gr / (*n - *g * *g + 1e-4).sqrt() + wd * *w);
                *w += *d;
            });

        Ok(())
    }
}
