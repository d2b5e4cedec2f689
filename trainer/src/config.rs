use std::path::PathBuf;

use comms::specs::{ConsistencySpec, OptimizerSpec, StoreKind};
use engine::Context;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr, initialization::Initializer};

fn default_devices() -> Vec<usize> {
    vec![0]
}

fn default_kvstore() -> Option<StoreKind> {
    Some(StoreKind::Local)
}

fn default_consistency() -> ConsistencySpec {
    ConsistencySpec::Sync
}

fn default_optimizer() -> OptimizerSpec {
    OptimizerSpec::sgd(0.01, 0.)
}

fn default_num_epoch() -> usize {
    1
}

/// The configuration of a training session.
///
/// ```json
/// {
///     "devices": [0, 1],
///     "work_load": [1, 3],
///     "kvstore": "local",
///     "optimizer": { "name": "sgd", "learning_rate": 0.1, "momentum": 0.9 },
///     "num_epoch": 10
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// The ids of the cpu devices to train on.
    #[serde(default = "default_devices")]
    pub devices: Vec<usize>,
    /// The relative work load of every device, even when missing.
    #[serde(default)]
    pub work_load: Option<Vec<f64>>,
    /// The kind of kvstore to synchronize through, `None` updates every device locally.
    #[serde(default = "default_kvstore")]
    pub kvstore: Option<StoreKind>,
    #[serde(default = "default_consistency")]
    pub consistency: ConsistencySpec,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerSpec,
    #[serde(default)]
    pub initializer: Initializer,
    #[serde(default = "default_num_epoch")]
    pub num_epoch: usize,
    #[serde(default)]
    pub begin_epoch: usize,
    /// The amount of batches per epoch, a whole pass over the data when missing.
    #[serde(default)]
    pub epoch_size: Option<usize>,
    /// Where to record the training metrics.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    /// The seed of the initializer's random numbers.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            work_load: None,
            kvstore: default_kvstore(),
            consistency: default_consistency(),
            optimizer: default_optimizer(),
            initializer: Initializer::default(),
            num_epoch: default_num_epoch(),
            begin_epoch: 0,
            epoch_size: None,
            metrics_path: None,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Parses and validates a configuration.
    ///
    /// # Returns
    /// The configuration, a json error or `InvalidConfiguration`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde can't check on it's own.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(TrainErr::InvalidConfiguration(
                "at least one device is needed".into(),
            ));
        }

        if let Some(work_load) = &self.work_load {
            if work_load.len() != self.devices.len() {
                return Err(TrainErr::InvalidConfiguration(format!(
                    "{} work loads for {} devices",
                    work_load.len(),
                    self.devices.len()
                )));
            }
        }

        if self.begin_epoch > self.num_epoch {
            return Err(TrainErr::InvalidConfiguration(format!(
                "begin epoch {} is after the last epoch {}",
                self.begin_epoch, self.num_epoch
            )));
        }

        if self.epoch_size == Some(0) {
            return Err(TrainErr::InvalidConfiguration(
                "epochs need at least one batch".into(),
            ));
        }

        Ok(())
    }

    /// The devices to train on.
    pub fn contexts(&self) -> Vec<Context> {
        self.devices.iter().map(|&id| Context::cpu(id)).collect()
    }
}
