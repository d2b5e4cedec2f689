use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_learning_rate() -> f32 {
    0.01
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_epsilon() -> f32 {
    1e-8
}

fn default_adagrad_eps() -> f32 {
    1e-7
}

fn default_gamma1() -> f32 {
    0.95
}

fn default_gamma2() -> f32 {
    0.9
}

fn default_rho() -> f32 {
    0.9
}

fn default_adadelta_epsilon() -> f32 {
    1e-5
}

/// The specification for the learning rate schedulers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerSpec {
    /// Multiplies the learning rate by `factor` every `step` updates.
    Factor {
        step: usize,
        factor: f32,
        #[serde(default)]
        stop_factor_lr: f32,
    },
    /// Multiplies the learning rate by `factor` each time an update count in `steps` is passed.
    MultiFactor { steps: Vec<usize>, factor: f32 },
}

/// The hyperparameters every optimizer shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseSpec {
    /// Scales every gradient, unset trainers average over the batch and servers use 1.
    #[serde(default)]
    pub rescale_grad: Option<f32>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub wd: f32,
    #[serde(default)]
    pub clip_gradient: Option<f32>,
    #[serde(default)]
    pub lr_scheduler: Option<LrSchedulerSpec>,
    #[serde(default)]
    pub begin_num_update: usize,
    /// Learning rate multipliers by parameter name.
    #[serde(default)]
    pub lr_mult: HashMap<String, f32>,
    /// Weight decay multipliers by parameter name.
    #[serde(default)]
    pub wd_mult: HashMap<String, f32>,
    /// The name of the parameter behind every update index.
    #[serde(default)]
    pub param_names: Vec<String>,
}

impl Default for BaseSpec {
    fn default() -> Self {
        Self {
            rescale_grad: None,
            learning_rate: default_learning_rate(),
            wd: 0.,
            clip_gradient: None,
            lr_scheduler: None,
            begin_num_update: 0,
            lr_mult: HashMap::new(),
            wd_mult: HashMap::new(),
            param_names: Vec::new(),
        }
    }
}

/// The specification for the `Optimizer` enum.
///
/// It's tagged by `name`, so `{"name": "sgd", "learning_rate": 0.1, "momentum": 0.9}`
/// describes a momentum SGD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Sgd {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default)]
        momentum: f32,
    },
    Nag {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default)]
        momentum: f32,
    },
    Adam {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_adam_epsilon")]
        epsilon: f32,
    },
    #[serde(rename = "adagrad")]
    AdaGrad {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default = "default_adagrad_eps")]
        eps: f32,
    },
    #[serde(rename = "rmsprop")]
    RmsProp {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default = "default_gamma1")]
        gamma1: f32,
        #[serde(default = "default_gamma2")]
        gamma2: f32,
    },
    #[serde(rename = "adadelta")]
    AdaDelta {
        #[serde(flatten)]
        base: BaseSpec,
        #[serde(default = "default_rho")]
        rho: f32,
        #[serde(default = "default_adadelta_epsilon")]
        epsilon: f32,
    },
}

impl OptimizerSpec {
    /// The registered names, matched case insensitively by the optimizer factory.
    pub const NAMES: [&'static str; 6] = ["sgd", "nag", "adam", "adagrad", "rmsprop", "adadelta"];

    /// A plain SGD specification.
    ///
    /// # Arguments
    /// * `learning_rate` - The step size.
    /// * `momentum` - The momentum, `0` disables it.
    pub fn sgd(learning_rate: f32, momentum: f32) -> Self {
        Self::Sgd {
            base: BaseSpec {
                learning_rate,
                ..Default::default()
            },
            momentum,
        }
    }

    /// Returns the registered name of this specification.
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerSpec::Sgd { .. } => "sgd",
            OptimizerSpec::Nag { .. } => "nag",
            OptimizerSpec::Adam { .. } => "adam",
            OptimizerSpec::AdaGrad { .. } => "adagrad",
            OptimizerSpec::RmsProp { .. } => "rmsprop",
            OptimizerSpec::AdaDelta { .. } => "adadelta",
        }
    }

    /// Returns the shared hyperparameters.
    pub fn base(&self) -> &BaseSpec {
        match self {
            OptimizerSpec::Sgd { base, .. }
            | OptimizerSpec::Nag { base, .. }
            | OptimizerSpec::Adam { base, .. }
            | OptimizerSpec::AdaGrad { base, .. }
            | OptimizerSpec::RmsProp { base, .. }
            | OptimizerSpec::AdaDelta { base, .. } => base,
        }
    }

    /// Returns the shared hyperparameters mutably.
    pub fn base_mut(&mut self) -> &mut BaseSpec {
        match self {
            OptimizerSpec::Sgd { base, .. }
            | OptimizerSpec::Nag { base, .. }
            | OptimizerSpec::Adam { base, .. }
            | OptimizerSpec::AdaGrad { base, .. }
            | OptimizerSpec::RmsProp { base, .. }
            | OptimizerSpec::AdaDelta { base, .. } => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let spec: OptimizerSpec = serde_json::from_str(r#"{"name": "adam"}"#).unwrap();

        let OptimizerSpec::Adam {
            base,
            beta1,
            beta2,
            epsilon,
        } = spec
        else {
            panic!("expected adam, got {spec:?}");
        };

        assert_eq!(base, BaseSpec::default());
        assert_eq!((beta1, beta2, epsilon), (0.9, 0.999, 1e-8));
    }

    #[test]
    fn flattened_base_fields() {
        let json = r#"{
            "name": "sgd",
            "learning_rate": 0.5,
            "momentum": 0.9,
            "clip_gradient": 2.0,
            "lr_scheduler": {"factor": {"step": 10, "factor": 0.5}},
            "wd_mult": {"fc_bias": 0.0}
        }"#;

        let spec: OptimizerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.name(), "sgd");

        let base = spec.base();
        assert_eq!(base.rescale_grad, None);
        assert_eq!(base.learning_rate, 0.5);
        assert_eq!(base.clip_gradient, Some(2.0));
        assert_eq!(base.wd_mult.get("fc_bias"), Some(&0.0));
        assert_eq!(
            base.lr_scheduler,
            Some(LrSchedulerSpec::Factor {
                step: 10,
                factor: 0.5,
                stop_factor_lr: 0.
            })
        );
    }

    #[test]
    fn every_name_is_registered() {
        for name in OptimizerSpec::NAMES {
            let json = format!(r#"{{"name": "{name}"}}"#);
            let spec: OptimizerSpec = serde_json::from_str(&json).unwrap();
            assert_eq!(spec.name(), name);
        }
    }
}
