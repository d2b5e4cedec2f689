//! Initial values of the model's parameters, chosen by the parameter's name.

mod random;

use engine::{Shape, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

pub use random::RandParamGen;

/// The distribution of the random numbers behind `Xavier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandType {
    #[default]
    Uniform,
    Gaussian,
}

/// The fan `Xavier` scales by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    /// The mean of the fan in and the fan out.
    #[default]
    Avg,
    In,
    Out,
}

fn default_scale() -> f32 {
    0.07
}

fn default_sigma() -> f32 {
    0.01
}

fn default_magnitude() -> f32 {
    3.
}

/// Fills the parameters of a model.
///
/// Biases and betas start at 0, gammas at 1 and weights follow the variant's
/// distribution. Moving means and variances of normalization layers start at 0 and 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    Uniform {
        #[serde(default = "default_scale")]
        scale: f32,
    },
    Normal {
        #[serde(default = "default_sigma")]
        sigma: f32,
    },
    Xavier {
        #[serde(default)]
        rnd_type: RandType,
        #[serde(default)]
        factor_type: FactorType,
        #[serde(default = "default_magnitude")]
        magnitude: f32,
    },
    Constant {
        value: f32,
    },
}

impl Default for Initializer {
    fn default() -> Self {
        Self::Uniform {
            scale: default_scale(),
        }
    }
}

impl Initializer {
    /// Writes the initial value of parameter `name` into `tensor`.
    ///
    /// # Arguments
    /// * `name` - The parameter's name, it's suffix picks the value.
    /// * `tensor` - The parameter.
    /// * `rng` - The source of randomness.
    ///
    /// # Returns
    /// `InvalidConfiguration` for a name with an unknown suffix or an invalid distribution.
    pub fn init<R: Rng + ?Sized>(&self, name: &str, tensor: &Tensor, rng: &mut R) -> Result<()> {
        let n = tensor.size();

        let values = if ["_bias", "_beta", "_moving_mean"].iter().any(|s| name.ends_with(s)) {
            vec![0.; n]
        } else if ["_gamma", "_moving_var"].iter().any(|s| name.ends_with(s)) {
            vec![1.; n]
        } else if name.ends_with("_weight") {
            self.weight(tensor.shape(), rng)?
        } else {
            return Err(TrainErr::InvalidConfiguration(format!(
                "unknown initialization pattern for {name}"
            )));
        };

        Ok(tensor.copy_from_slice(&values)?)
    }

    fn weight<R: Rng + ?Sized>(&self, shape: &Shape, rng: &mut R) -> Result<Vec<f32>> {
        let n = shape.size();

        match *self {
            Initializer::Uniform { scale } => Ok(RandParamGen::uniform(-scale, scale)?.sample(rng, n)),
            Initializer::Normal { sigma } => Ok(RandParamGen::normal(0., sigma)?.sample(rng, n)),
            Initializer::Constant { value } => Ok(vec![value; n]),
            Initializer::Xavier {
                rnd_type,
                factor_type,
                magnitude,
            } => {
                if shape.ndim() < 2 {
                    return Err(TrainErr::InvalidConfiguration(format!(
                        "xavier needs at least 2 dimensions, got {shape}"
                    )));
                }

                let fan_out = shape.rows() as f32;
                let fan_in = shape.row_size() as f32;
                let factor = match factor_type {
                    FactorType::Avg => (fan_in + fan_out) / 2.,
                    FactorType::In => fan_in,
                    FactorType::Out => fan_out,
                };

                let scale = (magnitude / factor).sqrt();

                match rnd_type {
                    RandType::Uniform => Ok(RandParamGen::uniform(-scale, scale)?.sample(rng, n)),
                    RandType::Gaussian => Ok(RandParamGen::normal(0., scale)?.sample(rng, n)),
                }
            }
        }
    }
}
