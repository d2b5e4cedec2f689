use std::mem;

/// The auxiliary buffers each optimizer keeps per parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum StateBuffers {
    /// Plain SGD or NAG without momentum.
    Stateless,
    Momentum(Box<[f32]>),
    Adam { mean: Box<[f32]>, var: Box<[f32]> },
    AdaGrad { history: Box<[f32]> },
    RmsProp { n: Box<[f32]>, g: Box<[f32]>, delta: Box<[f32]> },
    AdaDelta { acc_g: Box<[f32]>, acc_delta: Box<[f32]> },
}

impl StateBuffers {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stateless => "stateless",
            Self::Momentum(_) => "momentum",
            Self::Adam { .. } => "adam",
            Self::AdaGrad { .. } => "adagrad",
            Self::RmsProp { .. } => "rmsprop",
            Self::AdaDelta { .. } => "adadelta",
        }
    }

    fn buffers(&self) -> Vec<&[f32]> {
        match self {
            Self::Stateless => vec![],
            Self::Momentum(m) => vec![&m[..]],
            Self::Adam { mean, var } => vec![&mean[..], &var[..]],
            Self::AdaGrad { history } => vec![&history[..]],
            Self::RmsProp { n, g, delta } => vec![&n[..], &g[..], &delta[..]],
            Self::AdaDelta { acc_g, acc_delta } => vec![&acc_g[..], &acc_delta[..]],
        }
    }

    /// Checks these buffers are of the same kind as `expected` and cover `len` elements.
    pub(super) fn check_compatible(
        &self,
        expected: &StateBuffers,
        len: usize,
    ) -> super::Result<()> {
        if mem::discriminant(self) != mem::discriminant(expected) {
            return Err(super::OptErr::StateMismatch(format!(
                "{} can't update with {} state",
                expected.name(),
                self.name()
            )));
        }

        self.buffers()
            .into_iter()
            .try_for_each(|buf| check_len(buf, len))
    }
}

/// The per parameter state of an optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    /// How many updates were applied to the parameter, starting at `begin_num_update`.
    pub update_count: usize,
    pub buffers: StateBuffers,
}

pub(super) fn zeros(len: usize) -> Box<[f32]> {
    vec![0.; len].into_boxed_slice()
}

/// Checks a state buffer covers the parameter it was created for.
pub(super) fn check_len(buf: &[f32], len: usize) -> super::Result<()> {
    if buf.len() != len {
        return Err(super::OptErr::StateMismatch(format!(
            "state of {} elements for a parameter of {len}",
            buf.len()
        )));
    }

    Ok(())
}
