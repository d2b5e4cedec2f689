use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::{Result, TrainErr};

fn invalid(e: impl ToString) -> TrainErr {
    TrainErr::InvalidConfiguration(e.to_string())
}

/// A parameter generator that follows a certain probabilistic distribution.
#[derive(Debug, Clone)]
pub struct RandParamGen<D: Distribution<f32>> {
    distribution: D,
}

impl<D: Distribution<f32>> RandParamGen<D> {
    /// Creates a new `RandParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `distribution` - The distribution to sample the random numbers from.
    pub fn new(distribution: D) -> Self {
        Self { distribution }
    }

    /// Samples `n` parameters.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.distribution.sample(rng)).collect()
    }
}

impl RandParamGen<Uniform<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is empty (low >= high).
    pub fn uniform(low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(Uniform::new(low, high).map_err(invalid)?))
    }
}

impl RandParamGen<Normal<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a normal distribution.
    ///
    /// # Arguments
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(Normal::new(mean, std_dev).map_err(invalid)?))
    }
}
