use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::{
    KvErr, Result,
    optimization::{Optimizer, OptimizerState, Update},
};

#[derive(Debug)]
struct SlotState {
    value: Box<[f32]>,
    merge: [Box<[f32]>; 2],
    pending: [usize; 2],
    round: u64,
    pushed_by: Vec<u64>,
    opt_state: Option<OptimizerState>,
}

/// The server side storage of a single key.
///
/// It implements a double-buffer strategy for synchronous rounds: pushes for the round
/// being merged land in one buffer while a rank that already pushed to it can push its
/// next contribution to the other one. A rank two rounds ahead waits.
#[derive(Debug)]
pub struct ParameterSlot {
    index: usize,
    len: usize,
    state: Mutex<SlotState>,
    applied: Condvar,
}

impl ParameterSlot {
    /// Creates a new `ParameterSlot`.
    ///
    /// # Arguments
    /// * `index` - The index the optimizer knows this parameter by.
    /// * `value` - The initial value.
    /// * `num_workers` - The amount of workers pushing to this slot.
    pub fn new(index: usize, value: Vec<f32>, num_workers: usize) -> Self {
        let len = value.len();
        let zeros = || vec![0.; len].into_boxed_slice();

        let state = SlotState {
            value: value.into_boxed_slice(),
            merge: [zeros(), zeros()],
            pending: [0; 2],
            round: 0,
            pushed_by: vec![0; num_workers],
            opt_state: None,
        };

        Self {
            index,
            len,
            state: Mutex::new(state),
            applied: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check_len(&self, found: usize) -> Result<()> {
        if found != self.len {
            return Err(KvErr::TypeMismatch(format!(
                "expected {} elements, found {found}",
                self.len
            )));
        }

        Ok(())
    }

    fn check_rank(state: &SlotState, rank: usize) -> Result<()> {
        if rank >= state.pushed_by.len() {
            return Err(KvErr::InvalidConfiguration(format!(
                "rank {rank} out of {} workers",
                state.pushed_by.len()
            )));
        }

        Ok(())
    }

    /// Merges `grad` into the round `rank` is pushing to, applying every round that completes.
    ///
    /// # Arguments
    /// * `rank` - The pushing worker.
    /// * `grad` - The contribution.
    /// * `optimizer` - The update rule, without one the value is replaced by the merged sum.
    ///
    /// # Returns
    /// `TypeMismatch` on a length mismatch or the optimizer's error for a failed update.
    pub fn push_sync(&self, rank: usize, grad: &[f32], optimizer: Option<&Optimizer>) -> Result<()> {
        self.check_len(grad.len())?;

        let mut state = self.state.lock();
        Self::check_rank(&state, rank)?;

        let target = state.pushed_by[rank];
        while target > state.round + 1 {
            self.applied.wait(&mut state);
        }

        let buf = (target % 2) as usize;
        state.merge[buf]
            .par_iter_mut()
            .zip(grad)
            .for_each(|(acc, g)| *acc += g);

        state.pending[buf] += 1;
        state.pushed_by[rank] += 1;

        let num_workers = state.pushed_by.len();
        let mut res = Ok(());

        loop {
            let current = (state.round % 2) as usize;
            if state.pending[current] < num_workers {
                break;
            }

            let applied = self.apply(&mut state, current, num_workers, optimizer);
            res = res.and(applied);

            state.merge[current].fill(0.);
            state.pending[current] = 0;
            state.round += 1;
            self.applied.notify_all();
        }

        res
    }

    /// Applies `grad` right away as a single worker update.
    pub fn push_async(&self, grad: &[f32], optimizer: Option<&Optimizer>) -> Result<()> {
        self.check_len(grad.len())?;

        let mut state = self.state.lock();
        let SlotState {
            value, opt_state, ..
        } = &mut *state;

        match optimizer {
            Some(optimizer) => {
                let opt_state =
                    opt_state.get_or_insert_with(|| optimizer.create_state(self.index, value));
                optimizer.update(self.index, value, grad, opt_state, 1)?;
            }
            None => value.copy_from_slice(grad),
        }

        state.round += 1;
        Ok(())
    }

    fn apply(
        &self,
        state: &mut SlotState,
        buf: usize,
        num_workers: usize,
        optimizer: Option<&Optimizer>,
    ) -> Result<()> {
        let SlotState {
            value,
            merge,
            opt_state,
            ..
        } = state;

        match optimizer {
            Some(optimizer) => {
                let opt_state =
                    opt_state.get_or_insert_with(|| optimizer.create_state(self.index, value));
                optimizer.update(self.index, value, &merge[buf], opt_state, num_workers)?;
            }
            None => value.copy_from_slice(&merge[buf]),
        }

        Ok(())
    }

    /// Copies the newest applied value into `out`.
    ///
    /// # Arguments
    /// * `rank` - The pulling worker.
    /// * `out` - The destination.
    /// * `wait_own_pushes` - Whether to wait until every round `rank` pushed to was applied.
    pub fn pull(&self, rank: usize, out: &mut [f32], wait_own_pushes: bool) -> Result<()> {
        self.check_len(out.len())?;

        let mut state = self.state.lock();
        Self::check_rank(&state, rank)?;

        if wait_own_pushes {
            while state.round < state.pushed_by[rank] {
                self.applied.wait(&mut state);
            }
        }

        out.copy_from_slice(&state.value);
        Ok(())
    }

    /// Drops the optimizer state, the next update creates a fresh one.
    pub fn reset_state(&self) {
        self.state.lock().opt_state = None;
    }

    /// The amount of updates applied so far.
    pub fn round(&self) -> u64 {
        self.state.lock().round
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use comms::specs::OptimizerSpec;

    use super::*;

    #[test]
    fn sync_round_waits_for_every_worker() {
        let slot = ParameterSlot::new(0, vec![0.; 2], 2);

        slot.push_sync(0, &[1., 2.], None).unwrap();
        assert_eq!(slot.round(), 0);

        slot.push_sync(1, &[3., 4.], None).unwrap();
        assert_eq!(slot.round(), 1);

        let mut out = [0.; 2];
        slot.pull(0, &mut out, true).unwrap();
        assert_eq!(out, [4., 6.]);
    }

    #[test]
    fn double_buffering_flow() {
        let slot = ParameterSlot::new(0, vec![0.], 2);

        // Rank 0 runs a round ahead of rank 1.
        slot.push_sync(0, &[10.], None).unwrap();
        slot.push_sync(0, &[1.], None).unwrap();
        slot.push_sync(1, &[5.], None).unwrap();

        let mut out = [0.];
        slot.pull(1, &mut out, true).unwrap();
        assert_eq!(out, [15.]);

        slot.push_sync(1, &[2.], None).unwrap();
        slot.pull(0, &mut out, true).unwrap();
        assert_eq!(out, [3.]);
    }

    #[test]
    fn pull_waits_for_own_round() {
        let slot = Arc::new(ParameterSlot::new(0, vec![0.], 2));
        slot.push_sync(0, &[1.], None).unwrap();

        let other = {
            let slot = slot.clone();
            thread::spawn(move || slot.push_sync(1, &[1.], None).unwrap())
        };

        let mut out = [0.];
        slot.pull(0, &mut out, true).unwrap();
        assert_eq!(out, [2.]);

        other.join().unwrap();
    }

    #[test]
    fn optimizer_sees_worker_num() {
        let opt = Optimizer::from_spec(&OptimizerSpec::sgd(1., 0.)).unwrap();
        let slot = ParameterSlot::new(0, vec![1.], 4);

        for rank in 0..4 {
            slot.push_sync(rank, &[0.5], Some(&opt)).unwrap();
        }

        let mut out = [0.];
        slot.pull(0, &mut out, true).unwrap();
        assert_eq!(out, [0.5]);
    }

    #[test]
    fn async_push_applies_at_once() {
        let opt = Optimizer::from_spec(&OptimizerSpec::sgd(1., 0.)).unwrap();
        let slot = ParameterSlot::new(0, vec![1.], 4);

        slot.push_async(&[0.25], Some(&opt)).unwrap();

        let mut out = [0.];
        slot.pull(3, &mut out, false).unwrap();
        assert_eq!(out, [0.75]);
    }

    #[test]
    fn rejects_size_and_rank() {
        let slot = ParameterSlot::new(0, vec![0.; 3], 1);

        assert!(matches!(
            slot.push_sync(0, &[1.], None),
            Err(KvErr::TypeMismatch(_))
        ));
        assert!(matches!(
            slot.push_sync(1, &[1., 1., 1.], None),
            Err(KvErr::InvalidConfiguration(_))
        ));
    }
}
