use std::collections::HashMap;

use super::{Optimizer, OptimizerState, Result, Update};

/// Applies an optimizer to parameters identified by index, keeping their states.
///
/// This is the local update path, every update counts as a single worker.
#[derive(Debug)]
pub struct Updater {
    optimizer: Optimizer,
    states: HashMap<usize, OptimizerState>,
}

impl Updater {
    /// Creates a new `Updater`.
    ///
    /// # Arguments
    /// * `optimizer` - The update rule.
    pub fn new(optimizer: Optimizer) -> Self {
        Self {
            optimizer,
            states: HashMap::new(),
        }
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    /// Returns the state of parameter `index`, creating it on first use.
    ///
    /// # Arguments
    /// * `index` - The parameter's index.
    /// * `weight` - The parameter's value, only read when the state is created.
    pub fn state_for(&mut self, index: usize, weight: &[f32]) -> &mut OptimizerState {
        let optimizer = &self.optimizer;

        self.states
            .entry(index)
            .or_insert_with(|| optimizer.create_state(index, weight))
    }

    /// Updates `weight` with `grad`.
    ///
    /// # Arguments
    /// * `index` - The parameter's index.
    /// * `grad` - The gradient.
    /// * `weight` - The parameter's value.
    pub fn update(&mut self, index: usize, grad: &[f32], weight: &mut [f32]) -> Result<()> {
        let optimizer = &self.optimizer;
        let state = self
            .states
            .entry(index)
            .or_insert_with(|| optimizer.create_state(index, weight));

        optimizer.update(index, weight, grad, state, 1)
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }
}
