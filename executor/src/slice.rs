use std::ops::Range;

use crate::{ExecErr, Result};

/// Splits a batch into one contiguous range of samples per device.
///
/// Each device gets `w * batch_size / sum(w)` samples rounded half to even, the samples
/// lost to rounding go to the last device. Devices rounded down to nothing get a single
/// sample and any excess is taken back from the trailing devices, so every device gets
/// at least one sample. The result is deterministic for equal inputs.
///
/// # Arguments
/// * `batch_size` - The amount of samples in a batch.
/// * `work_load` - The relative work load of every device, all positive.
///
/// # Returns
/// The ranges or `InvalidConfiguration` if the weights are invalid or there are more
/// devices than samples.
pub fn split_input_slice(batch_size: usize, work_load: &[f64]) -> Result<Vec<Range<usize>>> {
    if work_load.is_empty() {
        return Err(ExecErr::InvalidConfiguration(
            "no work loads to split the batch by".into(),
        ));
    }

    if let Some(w) = work_load.iter().find(|w| !w.is_finite() || **w <= 0.) {
        return Err(ExecErr::InvalidConfiguration(format!(
            "work loads must be positive, got {w}"
        )));
    }

    if work_load.len() > batch_size {
        return Err(ExecErr::InvalidConfiguration(format!(
            "{} slices for a batch of {batch_size}, some would be empty",
            work_load.len()
        )));
    }

    let total: f64 = work_load.iter().sum();
    let mut shares: Vec<_> = work_load
        .iter()
        .map(|w| ((w * batch_size as f64 / total).round_ties_even() as usize).max(1))
        .collect();

    let assigned: usize = shares.iter().sum();
    if assigned < batch_size {
        // SAFETY: We checked above that there is at least one work load.
        *shares.last_mut().unwrap() += batch_size - assigned;
    }

    let mut excess = shares.iter().sum::<usize>().saturating_sub(batch_size);
    for share in shares.iter_mut().rev() {
        if excess == 0 {
            break;
        }

        let taken = excess.min(*share - 1);
        *share -= taken;
        excess -= taken;
    }

    let mut begin = 0;
    let slices = shares
        .into_iter()
        .map(|share| {
            let slice = begin..begin + share;
            begin = slice.end;
            slice
        })
        .collect();

    Ok(slices)
}
