use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use comms::specs::BaseSpec;
use rayon::prelude::*;

use super::{LrScheduler, OptErr, OptimizerState, Result};

/// Identifies a parameter for the learning rate and weight decay multipliers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamId {
    Index(usize),
    Name(String),
}

/// The hyperparameters and bookkeeping every optimizer shares.
#[derive(Debug)]
pub struct Hyper {
    rescale_grad: f32,
    learning_rate: f32,
    wd: f32,
    clip_gradient: Option<f32>,
    scheduler: Option<LrScheduler>,
    begin_num_update: usize,
    num_update: AtomicUsize,
    lr_mult: HashMap<ParamId, f32>,
    wd_mult: HashMap<ParamId, f32>,
    explicit_wd_mult: HashMap<ParamId, f32>,
    idx2name: HashMap<usize, String>,
}

fn check_finite(name: &str, value: f32) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(OptErr::InvalidParams(format!("{name} must be finite, got {value}")))
    }
}

impl Hyper {
    /// Creates a new `Hyper` from it's specification.
    ///
    /// # Returns
    /// `InvalidParams` if a value isn't finite, the clipping bound isn't positive or
    /// the scheduler is invalid.
    pub fn new(spec: &BaseSpec) -> Result<Self> {
        let rescale_grad = spec.rescale_grad.unwrap_or(1.);
        check_finite("rescale_grad", rescale_grad)?;
        check_finite("learning_rate", spec.learning_rate)?;
        check_finite("wd", spec.wd)?;

        if let Some(clip) = spec.clip_gradient {
            if !(clip > 0.) {
                return Err(OptErr::InvalidParams(format!(
                    "clip_gradient must be positive, got {clip}"
                )));
            }
        }

        let scheduler = spec
            .lr_scheduler
            .as_ref()
            .map(|s| LrScheduler::new(s, spec.learning_rate))
            .transpose()?;

        let by_name = |map: &HashMap<String, f32>| {
            map.iter()
                .map(|(name, &mult)| (ParamId::Name(name.clone()), mult))
                .collect::<HashMap<_, _>>()
        };

        let mut hyper = Self {
            rescale_grad,
            learning_rate: spec.learning_rate,
            wd: spec.wd,
            clip_gradient: spec.clip_gradient,
            scheduler,
            begin_num_update: spec.begin_num_update,
            num_update: AtomicUsize::new(spec.begin_num_update),
            lr_mult: by_name(&spec.lr_mult),
            wd_mult: by_name(&spec.wd_mult),
            explicit_wd_mult: by_name(&spec.wd_mult),
            idx2name: HashMap::new(),
        };

        if !spec.param_names.is_empty() {
            hyper.set_param_names(spec.param_names.iter().cloned().enumerate().collect());
        }

        Ok(hyper)
    }

    /// Names the parameters behind the update indices.
    ///
    /// Parameters whose name doesn't end in `_weight` or `_gamma` get no weight decay
    /// unless a multiplier was given for them.
    pub fn set_param_names(&mut self, idx2name: HashMap<usize, String>) {
        self.idx2name = idx2name;
        self.rebuild_wd_mult();
    }

    pub fn set_lr_mult(&mut self, mults: impl IntoIterator<Item = (ParamId, f32)>) {
        self.lr_mult = mults.into_iter().collect();
    }

    pub fn set_wd_mult(&mut self, mults: impl IntoIterator<Item = (ParamId, f32)>) {
        self.explicit_wd_mult = mults.into_iter().collect();
        self.rebuild_wd_mult();
    }

    fn rebuild_wd_mult(&mut self) {
        self.wd_mult = self
            .idx2name
            .values()
            .filter(|name| !(name.ends_with("_weight") || name.ends_with("_gamma")))
            .map(|name| (ParamId::Name(name.clone()), 0.))
            .collect();

        self.wd_mult.extend(
            self.explicit_wd_mult
                .iter()
                .map(|(id, &mult)| (id.clone(), mult)),
        );
    }

    fn mult(&self, mults: &HashMap<ParamId, f32>, index: usize) -> f32 {
        if let Some(&mult) = mults.get(&ParamId::Index(index)) {
            return mult;
        }

        self.idx2name
            .get(&index)
            .and_then(|name| mults.get(&ParamId::Name(name.clone())))
            .copied()
            .unwrap_or(1.)
    }

    /// The learning rate for parameter `index` at the current update count.
    pub fn lr(&self, index: usize) -> f32 {
        let lr = match &self.scheduler {
            Some(scheduler) => scheduler.lr(self.num_update()),
            None => self.learning_rate,
        };

        lr * self.mult(&self.lr_mult, index)
    }

    /// The weight decay for parameter `index`.
    pub fn wd(&self, index: usize) -> f32 {
        self.wd * self.mult(&self.wd_mult, index)
    }

    /// The largest update count over every parameter.
    pub fn num_update(&self) -> usize {
        self.num_update.load(Ordering::Relaxed)
    }

    pub fn begin_num_update(&self) -> usize {
        self.begin_num_update
    }

    /// Counts one more update of a parameter.
    ///
    /// # Returns
    /// The parameter's update count including this one.
    pub(super) fn count(&self, state: &mut OptimizerState) -> usize {
        state.update_count += 1;
        self.num_update
            .fetch_max(state.update_count, Ordering::Relaxed);

        state.update_count
    }

    /// Rescales and clips a merged gradient.
    ///
    /// # Arguments
    /// * `grad` - The gradient, summed over `worker_num` contributions.
    /// * `worker_num` - The amount of workers merged into `grad`.
    pub(super) fn prepare(&self, grad: &[f32], worker_num: usize) -> Vec<f32> {
        let scale = self.rescale_grad / worker_num.max(1) as f32;
        let clip = self.clip_gradient;

        grad.par_iter()
            .map(|&g| {
                let g = g * scale;
                match clip {
                    Some(c) => g.clamp(-c, c),
                    None => g,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> HashMap<usize, String> {
        HashMap::from([
            (0, "fc_weight".to_string()),
            (1, "fc_bias".to_string()),
            (2, "bn_gamma".to_string()),
        ])
    }

    #[test]
    fn default_wd_mult_by_suffix() {
        let spec = BaseSpec {
            wd: 0.1,
            ..Default::default()
        };
        let mut hyper = Hyper::new(&spec).unwrap();
        hyper.set_param_names(names());

        assert_eq!(hyper.wd(0), 0.1);
        assert_eq!(hyper.wd(1), 0.);
        assert_eq!(hyper.wd(2), 0.1);
    }

    #[test]
    fn names_from_the_spec() {
        let spec = BaseSpec {
            wd: 0.1,
            param_names: vec!["fc_weight".into(), "fc_bias".into()],
            ..Default::default()
        };
        let hyper = Hyper::new(&spec).unwrap();

        assert_eq!(hyper.wd(0), 0.1);
        assert_eq!(hyper.wd(1), 0.);
    }

    #[test]
    fn index_mult_wins_over_name() {
        let spec = BaseSpec {
            learning_rate: 1.,
            lr_mult: HashMap::from([("fc_weight".to_string(), 0.5)]),
            ..Default::default()
        };
        let mut hyper = Hyper::new(&spec).unwrap();
        hyper.set_param_names(names());
        assert_eq!(hyper.lr(0), 0.5);

        hyper.set_lr_mult([
            (ParamId::Index(0), 2.),
            (ParamId::Name("fc_weight".into()), 0.5),
        ]);
        assert_eq!(hyper.lr(0), 2.);
        assert_eq!(hyper.lr(1), 1.);
    }

    #[test]
    fn explicit_wd_mult_survives_renaming() {
        let spec = BaseSpec {
            wd: 1.,
            wd_mult: HashMap::from([("fc_bias".to_string(), 0.3)]),
            ..Default::default()
        };
        let mut hyper = Hyper::new(&spec).unwrap();
        hyper.set_param_names(names());

        assert_eq!(hyper.wd(1), 0.3);
    }

    #[test]
    fn prepare_rescales_and_clips() {
        let spec = BaseSpec {
            rescale_grad: Some(2.),
            clip_gradient: Some(1.5),
            ..Default::default()
        };
        let hyper = Hyper::new(&spec).unwrap();

        assert_eq!(hyper.prepare(&[4., -1., 0.5], 4), vec![1.5, -0.5, 0.25]);
    }

    #[test]
    fn rejects_non_positive_clip() {
        let spec = BaseSpec {
            clip_gradient: Some(0.),
            ..Default::default()
        };

        assert!(Hyper::new(&spec).is_err());
    }
}
