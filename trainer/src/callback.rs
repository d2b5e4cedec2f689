use std::time::Instant;

use executor::EvalMetric;
use log::info;

/// What a batch end callback gets to see.
pub struct BatchEndParam<'a> {
    pub epoch: usize,
    /// The amount of batches completed in this epoch.
    pub nbatch: usize,
    pub eval_metric: Option<&'a dyn EvalMetric>,
}

/// Called after every training batch.
pub trait BatchEndCallback {
    fn call(&mut self, param: &BatchEndParam<'_>);
}

impl<F> BatchEndCallback for F
where
    F: FnMut(&BatchEndParam<'_>),
{
    fn call(&mut self, param: &BatchEndParam<'_>) {
        self(param)
    }
}

/// Logs the training speed every `frequent` batches.
pub struct Speedometer {
    batch_size: usize,
    frequent: usize,
    init: bool,
    tic: Instant,
    last_count: usize,
    last_speed: Option<f64>,
}

impl Speedometer {
    /// Creates a new `Speedometer`.
    ///
    /// # Arguments
    /// * `batch_size` - The amount of samples per batch.
    /// * `frequent` - The amount of batches between logs.
    pub fn new(batch_size: usize, frequent: usize) -> Self {
        Self {
            batch_size,
            frequent: frequent.max(1),
            init: false,
            tic: Instant::now(),
            last_count: 0,
            last_speed: None,
        }
    }

    /// The last measured speed in samples per second.
    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }
}

impl BatchEndCallback for Speedometer {
    fn call(&mut self, param: &BatchEndParam<'_>) {
        let count = param.nbatch;

        // A new epoch started.
        if self.last_count > count {
            self.init = false;
        }
        self.last_count = count;

        if !self.init {
            self.init = true;
            self.tic = Instant::now();
            return;
        }

        if count % self.frequent != 0 {
            return;
        }

        let elapsed = self.tic.elapsed().as_secs_f64().max(f64::EPSILON);
        let speed = (self.frequent * self.batch_size) as f64 / elapsed;
        self.last_speed = Some(speed);

        match param.eval_metric {
            Some(metric) => {
                let (name, value) = metric.get();
                info!(
                    "Epoch[{}] Batch [{count}]\tSpeed: {speed:.2} samples/sec\tTrain-{name}={value:.6}",
                    param.epoch
                );
            }
            None => info!(
                "Iter[{}] Batch [{count}]\tSpeed: {speed:.2} samples/sec",
                param.epoch
            ),
        }

        self.tic = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(epoch: usize, nbatch: usize) -> BatchEndParam<'static> {
        BatchEndParam {
            epoch,
            nbatch,
            eval_metric: None,
        }
    }

    #[test]
    fn measures_after_the_first_batch() {
        let mut speedometer = Speedometer::new(32, 2);

        speedometer.call(&param(0, 1));
        assert!(speedometer.last_speed().is_none());

        speedometer.call(&param(0, 2));
        assert!(speedometer.last_speed().unwrap() > 0.);
    }

    #[test]
    fn restarts_every_epoch() {
        let mut speedometer = Speedometer::new(8, 1);

        speedometer.call(&param(0, 1));
        speedometer.call(&param(0, 2));
        let first = speedometer.last_speed();

        // The first batch of the next epoch only restarts the clock.
        speedometer.call(&param(1, 1));
        assert_eq!(speedometer.last_speed(), first);
    }

    #[test]
    fn closures_are_callbacks() {
        let mut seen = Vec::new();
        {
            let mut callback = |p: &BatchEndParam<'_>| seen.push(p.nbatch);
            BatchEndCallback::call(&mut callback, &param(0, 3));
        }

        assert_eq!(seen, vec![3]);
    }
}
