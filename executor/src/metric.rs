use engine::Tensor;

use crate::{ExecErr, Result};

/// A metric accumulated over the batches of an epoch.
pub trait EvalMetric: Send {
    fn name(&self) -> &str;

    /// Accumulates the predictions of a batch.
    ///
    /// # Arguments
    /// * `labels` - The labels of every output.
    /// * `preds` - The outputs, one per label.
    ///
    /// # Returns
    /// `InvalidConfiguration` if the labels and predictions don't line up.
    fn update(&mut self, labels: &[Tensor], preds: &[Tensor]) -> Result<()>;

    /// Returns the metric's name and it's value, `NaN` before the first update.
    fn get(&self) -> (String, f64);

    fn reset(&mut self);
}

/// Creates a metric by name.
///
/// # Arguments
/// * `name` - One of `acc`, `accuracy`, `mse`, `rmse` or `mae`, case insensitive.
///
/// # Returns
/// The metric or `InvalidConfiguration` for an unknown name.
pub fn create_metric(name: &str) -> Result<Box<dyn EvalMetric>> {
    let metric: Box<dyn EvalMetric> = match name.to_ascii_lowercase().as_str() {
        "acc" | "accuracy" => Box::new(Accuracy::default()),
        "mse" => Box::new(Mse::default()),
        "rmse" => Box::new(Rmse::default()),
        "mae" => Box::new(Mae::default()),
        _ => {
            return Err(ExecErr::InvalidConfiguration(format!(
                "unknown metric {name}"
            )));
        }
    };

    Ok(metric)
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    sum: f64,
    num: usize,
}

impl Totals {
    fn value(&self) -> f64 {
        match self.num {
            0 => f64::NAN,
            n => self.sum / n as f64,
        }
    }
}

fn check_pairs(labels: &[Tensor], preds: &[Tensor]) -> Result<()> {
    if labels.len() != preds.len() {
        return Err(ExecErr::InvalidConfiguration(format!(
            "{} labels for {} predictions",
            labels.len(),
            preds.len()
        )));
    }

    Ok(())
}

/// Reads a label and a prediction with the same amount of elements.
fn read_same_size(label: &Tensor, pred: &Tensor) -> Result<(Vec<f32>, Vec<f32>)> {
    if label.size() != pred.size() {
        return Err(ExecErr::InvalidConfiguration(format!(
            "label {} and prediction {} differ in size",
            label.shape(),
            pred.shape()
        )));
    }

    Ok((label.to_vec()?, pred.to_vec()?))
}

/// The fraction of samples whose predicted class is the label.
///
/// Predictions of another shape than the label are class scores, the predicted
/// class is the row's argmax.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    totals: Totals,
}

impl EvalMetric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn update(&mut self, labels: &[Tensor], preds: &[Tensor]) -> Result<()> {
        check_pairs(labels, preds)?;

        for (label, pred) in labels.iter().zip(preds) {
            let classes = label.to_vec()?;
            let scores = pred.to_vec()?;

            let predicted: Vec<f32> = if pred.size() == label.size() {
                scores
            } else {
                let row_size = pred.shape().row_size();

                if row_size == 0 || scores.len() / row_size != classes.len() {
                    return Err(ExecErr::InvalidConfiguration(format!(
                        "{} labels for predictions of shape {}",
                        classes.len(),
                        pred.shape()
                    )));
                }

                scores
                    .chunks(row_size)
                    .map(|row| {
                        row.iter()
                            .enumerate()
                            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                                if v > best.1 { (i, v) } else { best }
                            })
                            .0 as f32
                    })
                    .collect()
            };

            let hits = predicted
                .iter()
                .zip(&classes)
                .filter(|(p, c)| p.round() == c.round())
                .count();

            self.totals.sum += hits as f64;
            self.totals.num += classes.len();
        }

        Ok(())
    }

    fn get(&self) -> (String, f64) {
        (self.name().to_string(), self.totals.value())
    }

    fn reset(&mut self) {
        self.totals = Totals::default();
    }
}

/// The mean of `loss` over the element wise differences of every label and prediction pair.
fn batch_means(labels: &[Tensor], preds: &[Tensor], loss: fn(f64) -> f64) -> Result<Vec<f64>> {
    check_pairs(labels, preds)?;

    labels
        .iter()
        .zip(preds)
        .map(|(label, pred)| {
            let (label, pred) = read_same_size(label, pred)?;
            let total: f64 = label
                .iter()
                .zip(&pred)
                .map(|(l, p)| loss(f64::from(l - p)))
                .sum();

            Ok(total / label.len().max(1) as f64)
        })
        .collect()
}

/// The mean squared error, averaged over batches.
#[derive(Debug, Clone, Default)]
pub struct Mse {
    totals: Totals,
}

impl EvalMetric for Mse {
    fn name(&self) -> &str {
        "mse"
    }

    fn update(&mut self, labels: &[Tensor], preds: &[Tensor]) -> Result<()> {
        for mean in batch_means(labels, preds, |d| d * d)? {
            self.totals.sum += mean;
            self.totals.num += 1;
        }

        Ok(())
    }

    fn get(&self) -> (String, f64) {
        (self.name().to_string(), self.totals.value())
    }

    fn reset(&mut self) {
        self.totals = Totals::default();
    }
}

/// The root of each batch's mean squared error, averaged over batches.
#[derive(Debug, Clone, Default)]
pub struct Rmse {
    totals: Totals,
}

impl EvalMetric for Rmse {
    fn name(&self) -> &str {
        "rmse"
    }

    fn update(&mut self, labels: &[Tensor], preds: &[Tensor]) -> Result<()> {
        for mean in batch_means(labels, preds, |d| d * d)? {
            self.totals.sum += mean.sqrt();
            self.totals.num += 1;
        }

        Ok(())
    }

    fn get(&self) -> (String, f64) {
        (self.name().to_string(), self.totals.value())
    }

    fn reset(&mut self) {
        self.totals = Totals::default();
    }
}

/// The mean absolute error, averaged over batches.
#[derive(Debug, Clone, Default)]
pub struct Mae {
    totals: Totals,
}

impl EvalMetric for Mae {
    fn name(&self) -> &str {
        "mae"
    }

    fn update(&mut self, labels: &[Tensor], preds: &[Tensor]) -> Result<()> {
        for mean in batch_means(labels, preds, f64::abs)? {
            self.totals.sum += mean;
            self.totals.num += 1;
        }

        Ok(())
    }

    fn get(&self) -> (String, f64) {
        (self.name().to_string(), self.totals.value())
    }

    fn reset(&mut self) {
        self.totals = Totals::default();
    }
}

#[cfg(test)]
mod tests {
    use engine::Context;

    use super::*;

    fn tensor(shape: &[usize], values: &[f32]) -> Tensor {
        Tensor::from_vec(shape, values.to_vec(), Context::cpu(0)).unwrap()
    }

    #[test]
    fn accuracy_uses_the_argmax_of_scores() {
        let mut acc = Accuracy::default();
        let labels = [tensor(&[3], &[0., 1., 1.])];
        let preds = [tensor(&[3, 2], &[0.9, 0.1, 0.2, 0.8, 0.6, 0.4])];

        acc.update(&labels, &preds).unwrap();

        let (name, value) = acc.get();
        assert_eq!(name, "accuracy");
        assert!((value - 2. / 3.).abs() < 1e-12);
    }

    #[test]
    fn mse_and_rmse_average_over_batches() {
        let mut mse = Mse::default();
        let mut rmse = Rmse::default();

        for (label, pred) in [([1f32, 1.], [3f32, 3.]), ([0., 0.], [0., 0.])] {
            let labels = [tensor(&[2, 1], &label)];
            let preds = [tensor(&[2, 1], &pred)];

            mse.update(&labels, &preds).unwrap();
            rmse.update(&labels, &preds).unwrap();
        }

        assert_eq!(mse.get().1, 2.);
        assert_eq!(rmse.get().1, 1.);
    }

    #[test]
    fn mae() {
        let mut mae = Mae::default();
        mae.update(&[tensor(&[4], &[1., 2., 3., 4.])], &[tensor(&[4], &[2., 2., 2., 2.])])
            .unwrap();

        assert_eq!(mae.get().1, 1.);
    }

    #[test]
    fn reset_forgets_every_batch() {
        let mut metric = create_metric("MSE").unwrap();
        metric.update(&[tensor(&[1], &[1.])], &[tensor(&[1], &[0.])]).unwrap();
        metric.reset();

        assert!(metric.get().1.is_nan());
    }

    #[test]
    fn mismatched_inputs() {
        let mut mse = Mse::default();

        assert!(matches!(
            mse.update(&[tensor(&[2], &[1., 1.])], &[]),
            Err(ExecErr::InvalidConfiguration(_))
        ));
        assert!(matches!(
            mse.update(&[tensor(&[2], &[1., 1.])], &[tensor(&[3], &[1., 1., 1.])]),
            Err(ExecErr::InvalidConfiguration(_))
        ));
        assert!(matches!(
            create_metric("f1"),
            Err(ExecErr::InvalidConfiguration(_))
        ));
    }
}
