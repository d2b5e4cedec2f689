use std::collections::HashMap;

use comms::specs::OptimizerSpec;
use serde_json::Value;

use super::{
    AdaDelta, AdaGrad, Adam, Hyper, Nag, OptErr, OptimizerState, ParamId, Result, RmsProp, Sgd,
    StateBuffers,
};

/// The update capability every optimizer provides.
pub trait Update {
    /// Creates the state for parameter `index`.
    ///
    /// # Arguments
    /// * `index` - The parameter's index.
    /// * `weight` - The parameter's current value.
    fn create_state(&self, index: usize, weight: &[f32]) -> OptimizerState;

    /// Applies one update to `weight` in place.
    ///
    /// # Arguments
    /// * `index` - The parameter's index.
    /// * `weight` - The parameter's value.
    /// * `grad` - The gradient summed over `worker_num` contributions.
    /// * `state` - The state created for `index`.
    /// * `worker_num` - The amount of workers merged into `grad`.
    ///
    /// # Returns
    /// `SizeMismatch` if `weight` and `grad` differ in length or `StateMismatch` if
    /// `state` wasn't created by this optimizer.
    fn update(
        &self,
        index: usize,
        weight: &mut [f32],
        grad: &[f32],
        state: &mut OptimizerState,
        worker_num: usize,
    ) -> Result<()>;
}

/// A single update step, already scaled.
pub(super) struct Step<'a> {
    pub lr: f32,
    pub wd: f32,
    pub t: usize,
    pub weight: &'a mut [f32],
    pub grad: &'a [f32],
}

/// The per algorithm part of an optimizer.
pub(super) trait Rule {
    fn hyper(&self) -> &Hyper;

    fn hyper_mut(&mut self) -> &mut Hyper;

    fn create_buffers(&self, len: usize) -> StateBuffers;

    fn step(&self, step: Step<'_>, buffers: &mut StateBuffers) -> Result<()>;
}

pub(super) fn mismatch(rule: &str, buffers: &StateBuffers) -> OptErr {
    OptErr::StateMismatch(format!(
        "{rule} can't update with {} state",
        buffers.name()
    ))
}

/// The closed set of optimization algorithms.
#[derive(Debug)]
pub enum Optimizer {
    Sgd(Sgd),
    Nag(Nag),
    Adam(Adam),
    AdaGrad(AdaGrad),
    RmsProp(RmsProp),
    AdaDelta(AdaDelta),
}

impl Optimizer {
    /// Creates an optimizer by it's registered name.
    ///
    /// # Arguments
    /// * `name` - The name, matched case insensitively.
    /// * `params` - A JSON object with the hyperparameters, `null` for the defaults.
    ///
    /// # Returns
    /// The optimizer, `UnknownOptimizer` for an unregistered name or `InvalidParams`
    /// if the hyperparameters don't parse.
    pub fn create(name: &str, params: &Value) -> Result<Self> {
        let name = name.to_lowercase();

        if !OptimizerSpec::NAMES.contains(&name.as_str()) {
            return Err(OptErr::UnknownOptimizer(name));
        }

        let mut fields = match params {
            Value::Object(fields) => fields.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(OptErr::InvalidParams(format!(
                    "expected an object of hyperparameters, got {other}"
                )));
            }
        };

        fields.insert("name".to_string(), Value::String(name));

        let spec = serde_json::from_value(Value::Object(fields))
            .map_err(|e| OptErr::InvalidParams(e.to_string()))?;

        Self::from_spec(&spec)
    }

    /// Creates an optimizer from it's specification.
    ///
    /// # Returns
    /// The optimizer or `InvalidParams` if a hyperparameter is out of range.
    pub fn from_spec(spec: &OptimizerSpec) -> Result<Self> {
        let hyper = Hyper::new(spec.base())?;

        let optimizer = match *spec {
            OptimizerSpec::Sgd { momentum, .. } => {
                check_unit("momentum", momentum)?;
                Self::Sgd(Sgd::new(hyper, momentum))
            }
            OptimizerSpec::Nag { momentum, .. } => {
                check_unit("momentum", momentum)?;
                Self::Nag(Nag::new(hyper, momentum))
            }
            OptimizerSpec::Adam {
                beta1,
                beta2,
                epsilon,
                ..
            } => {
                check_unit("beta1", beta1)?;
                check_unit("beta2", beta2)?;
                Self::Adam(Adam::new(hyper, beta1, beta2, epsilon))
            }
            OptimizerSpec::AdaGrad { eps, .. } => Self::AdaGrad(AdaGrad::new(hyper, eps)),
            OptimizerSpec::RmsProp { gamma1, gamma2, .. } => {
                check_unit("gamma1", gamma1)?;
                check_unit("gamma2", gamma2)?;
                Self::RmsProp(RmsProp::new(hyper, gamma1, gamma2))
            }
            OptimizerSpec::AdaDelta { rho, epsilon, .. } => {
                check_unit("rho", rho)?;
                Self::AdaDelta(AdaDelta::new(hyper, rho, epsilon))
            }
        };

        Ok(optimizer)
    }

    /// The registered name of this optimizer.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sgd(_) => "sgd",
            Self::Nag(_) => "nag",
            Self::Adam(_) => "adam",
            Self::AdaGrad(_) => "adagrad",
            Self::RmsProp(_) => "rmsprop",
            Self::AdaDelta(_) => "adadelta",
        }
    }

    fn rule(&self) -> &dyn Rule {
        match self {
            Self::Sgd(rule) => rule,
            Self::Nag(rule) => rule,
            Self::Adam(rule) => rule,
            Self::AdaGrad(rule) => rule,
            Self::RmsProp(rule) => rule,
            Self::AdaDelta(rule) => rule,
        }
    }

    fn rule_mut(&mut self) -> &mut dyn Rule {
        match self {
            Self::Sgd(rule) => rule,
            Self::Nag(rule) => rule,
            Self::Adam(rule) => rule,
            Self::AdaGrad(rule) => rule,
            Self::RmsProp(rule) => rule,
            Self::AdaDelta(rule) => rule,
        }
    }

    pub fn hyper(&self) -> &Hyper {
        self.rule().hyper()
    }

    /// Names the parameters behind the update indices, see `Hyper::set_param_names`.
    pub fn set_param_names(&mut self, idx2name: HashMap<usize, String>) {
        self.rule_mut().hyper_mut().set_param_names(idx2name);
    }

    pub fn set_lr_mult(&mut self, mults: impl IntoIterator<Item = (ParamId, f32)>) {
        self.rule_mut().hyper_mut().set_lr_mult(mults);
    }

    pub fn set_wd_mult(&mut self, mults: impl IntoIterator<Item = (ParamId, f32)>) {
        self.rule_mut().hyper_mut().set_wd_mult(mults);
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0. ..=1.).contains(&value) {
        Ok(())
    } else {
        Err(OptErr::InvalidParams(format!(
            "{name} must be in [0, 1], got {value}"
        )))
    }
}

impl Update for Optimizer {
    fn create_state(&self, _index: usize, weight: &[f32]) -> OptimizerState {
        let rule = self.rule();

        OptimizerState {
            update_count: rule.hyper().begin_num_update(),
            buffers: rule.create_buffers(weight.len()),
        }
    }

    fn update(
        &self,
        index: usize,
        weight: &mut [f32],
        grad: &[f32],
        state: &mut OptimizerState,
        worker_num: usize,
    ) -> Result<()> {
        if weight.len() != grad.len() {
            return Err(OptErr::SizeMismatch {
                expected: weight.len(),
                found: grad.len(),
            });
        }

        let rule = self.rule();
        let hyper = rule.hyper();

        state
            .buffers
            .check_compatible(&rule.create_buffers(0), weight.len())?;

        let t = hyper.count(state);
        let grad = hyper.prepare(grad, worker_num);

        let step = Step {
            lr: hyper.lr(index),
            wd: hyper.wd(index),
            t,
            weight,
            grad: &grad,
        };

        rule.step(step, &mut state.buffers)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sgd(lr: f32, momentum: f32) -> Optimizer {
        Optimizer::from_spec(&OptimizerSpec::sgd(lr, momentum)).unwrap()
    }

    #[test]
    fn create_is_case_insensitive() {
        let opt = Optimizer::create("SGD", &json!({"learning_rate": 0.5})).unwrap();
        assert!(matches!(opt, Optimizer::Sgd(_)));
        assert_eq!(opt.hyper().lr(0), 0.5);

        let opt = Optimizer::create("RMSProp", &Value::Null).unwrap();
        assert!(matches!(opt, Optimizer::RmsProp(_)));
        assert_eq!(opt.name(), "rmsprop");
    }

    #[test]
    fn create_rejects_unknown_name() {
        let err = Optimizer::create("lbfgs", &Value::Null).unwrap_err();
        assert_eq!(err, OptErr::UnknownOptimizer("lbfgs".into()));
    }

    #[test]
    fn create_rejects_bad_params() {
        let err = Optimizer::create("sgd", &json!({"momentum": "fast"})).unwrap_err();
        assert!(matches!(err, OptErr::InvalidParams(_)));

        let err = Optimizer::create("sgd", &json!({"momentum": 1.5})).unwrap_err();
        assert!(matches!(err, OptErr::InvalidParams(_)));
    }

    #[test]
    fn sgd_step() {
        let opt = sgd(0.1, 0.);
        let mut weight = [1., 2.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[10., -10.], &mut state, 1)
            .unwrap();

        assert_eq!(weight, [0., 3.]);
        assert_eq!(state.update_count, 1);
        assert_eq!(opt.hyper().num_update(), 1);
    }

    #[test]
    fn sgd_divides_by_worker_num() {
        let opt = sgd(1., 0.);
        let mut weight = [0.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[8.], &mut state, 4).unwrap();

        assert_eq!(weight, [-2.]);
    }

    #[test]
    fn momentum_accumulates() {
        let opt = sgd(1., 0.5);
        let mut weight = [0.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[1.], &mut state, 1).unwrap();
        opt.update(0, &mut weight, &[1.], &mut state, 1).unwrap();

        // m1 = -1, m2 = 0.5 * -1 - 1
        assert_eq!(weight, [-2.5]);
    }

    #[test]
    fn nag_step() {
        let opt = Optimizer::create("nag", &json!({"learning_rate": 1.0, "momentum": 0.5})).unwrap();
        let mut weight = [0.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[2.], &mut state, 1).unwrap();

        // m = 2, w -= 2 + 0.5 * 2
        assert_eq!(weight, [-3.]);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let opt = Optimizer::create("adam", &json!({"learning_rate": 0.1})).unwrap();
        let mut weight = [1., 1.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[3., -0.5], &mut state, 1)
            .unwrap();

        // The bias corrected first step is lr * sign(g).
        assert!((weight[0] - 0.9).abs() < 1e-4);
        assert!((weight[1] - 1.1).abs() < 1e-4);
    }

    #[test]
    fn adagrad_step() {
        let opt = Optimizer::create("adagrad", &json!({"learning_rate": 1.0, "eps": 0.0})).unwrap();
        let mut weight = [0.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[2.], &mut state, 1).unwrap();

        assert_eq!(weight, [-1.]);
    }

    #[test]
    fn adadelta_ignores_learning_rate() {
        let run = |lr: f32| {
            let opt = Optimizer::create("adadelta", &json!({"learning_rate": lr})).unwrap();
            let mut weight = [1.];
            let mut state = opt.create_state(0, &weight);
            opt.update(0, &mut weight, &[0.5], &mut state, 1).unwrap();
            weight
        };

        assert_eq!(run(0.1), run(10.));
        assert!(run(0.1)[0] < 1.);
    }

    #[test]
    fn rmsprop_moves_against_gradient() {
        let opt = Optimizer::create("rmsprop", &json!({"learning_rate": 0.01})).unwrap();
        let mut weight = [0., 0.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[1., -1.], &mut state, 1)
            .unwrap();

        assert!(weight[0] < 0.);
        assert!(weight[1] > 0.);
    }

    #[test]
    fn state_of_other_optimizer_is_rejected() {
        let adam = Optimizer::create("adam", &Value::Null).unwrap();
        let opt = sgd(0.1, 0.9);

        let mut weight = [0.];
        let mut state = adam.create_state(0, &weight);

        let err = opt
            .update(0, &mut weight, &[1.], &mut state, 1)
            .unwrap_err();
        assert!(matches!(err, OptErr::StateMismatch(_)));

        assert_eq!(state.update_count, 0);
        assert_eq!(opt.hyper().num_update(), 0);
    }

    #[test]
    fn short_state_is_rejected_before_counting() {
        let opt = sgd(0.1, 0.9);
        let mut state = opt.create_state(0, &[0.]);

        let mut weight = [0., 0.];
        let err = opt
            .update(0, &mut weight, &[1., 1.], &mut state, 1)
            .unwrap_err();

        assert!(matches!(err, OptErr::StateMismatch(_)));
        assert_eq!(state.update_count, 0);
        assert_eq!(weight, [0., 0.]);
    }

    #[test]
    fn adam_decays_with_the_plain_learning_rate() {
        let opt = Optimizer::create("adam", &json!({"learning_rate": 0.1, "wd": 0.5})).unwrap();
        let mut weight = [1.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[0.], &mut state, 1).unwrap();

        // No gradient leaves only the decay, w - lr * wd * w.
        assert!((weight[0] - 0.95).abs() < 1e-6, "got {}", weight[0]);

        opt.update(0, &mut weight, &[0.], &mut state, 1).unwrap();
        assert!((weight[0] - 0.9025).abs() < 1e-6, "got {}", weight[0]);
    }

    #[test]
    fn rmsprop_decays_weights() {
        let opt = Optimizer::create("rmsprop", &json!({"learning_rate": 0.1, "wd": 0.5})).unwrap();
        let mut weight = [1.];
        let mut state = opt.create_state(0, &weight);

        opt.update(0, &mut weight, &[0.], &mut state, 1).unwrap();

        // delta = -lr * wd * w with no gradient.
        assert!((weight[0] - 0.95).abs() < 1e-6, "got {}", weight[0]);
    }

    #[test]
    fn size_mismatch() {
        let opt = sgd(0.1, 0.);
        let mut weight = [0., 0.];
        let mut state = opt.create_state(0, &weight);

        let err = opt.update(0, &mut weight, &[1.], &mut state, 1).unwrap_err();
        assert_eq!(
            err,
            OptErr::SizeMismatch {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn same_inputs_same_outputs() {
        let run = || {
            let opt = sgd(0.05, 0.9);
            let mut weight = vec![0.3; 1000];
            let mut state = opt.create_state(3, &weight);
            let grad: Vec<f32> = (0..1000).map(|i| (i as f32).sin()).collect();

            for _ in 0..5 {
                opt.update(3, &mut weight, &grad, &mut state, 2).unwrap();
            }

            weight
        };

        assert_eq!(run(), run());
    }
}
