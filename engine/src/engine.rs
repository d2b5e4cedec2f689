use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use parking_lot::{Condvar, MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex};

use crate::{EngineErr, Result, Tensor};

type OpFn = Box<dyn FnOnce(&OpArgs) -> Result<()> + Send>;

/// The tensors an asynchronous operation was scheduled with.
///
/// The same storage must not be both read and written by one operation.
pub struct OpArgs {
    reads: Vec<Tensor>,
    writes: Vec<Tensor>,
}

impl OpArgs {
    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn num_writes(&self) -> usize {
        self.writes.len()
    }

    /// Borrows the elements of the `i`th read tensor.
    pub fn read(&self, i: usize) -> MappedRwLockReadGuard<'_, [f32]> {
        self.reads[i].read_guard()
    }

    /// Borrows the elements of the `i`th written tensor mutably.
    pub fn write(&self, i: usize) -> MappedRwLockWriteGuard<'_, [f32]> {
        self.writes[i].write_guard()
    }

    pub fn reads(&self) -> &[Tensor] {
        &self.reads
    }

    pub fn writes(&self) -> &[Tensor] {
        &self.writes
    }
}

struct Access {
    tensor: Tensor,
    ticket: u64,
    write: bool,
}

struct Op {
    seq: u64,
    priority: i32,
    accesses: Vec<Access>,
    args: OpArgs,
    f: OpFn,
}

impl Op {
    fn is_ready(&self) -> bool {
        self.accesses.iter().all(|a| a.tensor.var().is_turn(a.ticket))
    }
}

#[derive(Default)]
struct State {
    lanes: HashMap<u64, VecDeque<Op>>,
    inflight: usize,
    seq: u64,
    shutdown: bool,
}

impl State {
    /// Pops the ready lane head with the highest priority, oldest first on ties.
    fn take_ready(&mut self) -> Option<Op> {
        let lane = self
            .lanes
            .iter()
            .filter_map(|(lane, ops)| ops.front().map(|op| (*lane, op)))
            .filter(|(_, op)| op.is_ready())
            .max_by_key(|(_, op)| (op.priority, std::cmp::Reverse(op.seq)))
            .map(|(lane, _)| lane)?;

        let ops = self.lanes.get_mut(&lane)?;
        let op = ops.pop_front();

        if ops.is_empty() {
            self.lanes.remove(&lane);
        }

        op
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    work: Condvar,
    idle: Condvar,
}

/// An asynchronous operation scheduler.
///
/// Operations pushed to the same lane run in push order. Across lanes, ready heads
/// run by priority, and operations touching the same tensor storage run in push order.
pub struct Engine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Creates a new `Engine` and spawns its worker threads.
    ///
    /// # Arguments
    /// * `threads` - The amount of worker threads, at least one is spawned.
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared::default());

        let workers = (0..threads.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || worker(&shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// Schedules `op` on `lane` and returns immediately.
    ///
    /// The pending reads and writes are registered on the tensors before returning, so
    /// a later `wait_to_read` on any of `writes` waits for `op`.
    ///
    /// # Arguments
    /// * `lane` - The FIFO the operation is queued on, usually a parameter key.
    /// * `priority` - Higher priorities run first among ready lanes.
    /// * `reads` - The tensors `op` reads.
    /// * `writes` - The tensors `op` writes, a failure is recorded on each of them.
    /// * `op` - The operation.
    pub fn push_async<F>(&self, lane: u64, priority: i32, reads: &[Tensor], writes: &[Tensor], op: F)
    where
        F: FnOnce(&OpArgs) -> Result<()> + Send + 'static,
    {
        let mut state = self.shared.state.lock();

        let mut unique: Vec<(Tensor, bool)> = Vec::with_capacity(reads.len() + writes.len());
        for (tensor, write) in reads
            .iter()
            .map(|t| (t, false))
            .chain(writes.iter().map(|t| (t, true)))
        {
            match unique
                .iter_mut()
                .find(|(seen, _)| seen.storage_id() == tensor.storage_id())
            {
                Some((_, seen_write)) => *seen_write |= write,
                None => unique.push((tensor.clone(), write)),
            }
        }

        let accesses = unique
            .into_iter()
            .map(|(tensor, write)| Access {
                ticket: tensor.var().issue(write),
                tensor,
                write,
            })
            .collect();

        let seq = state.seq;
        state.seq += 1;
        state.inflight += 1;

        let op = Op {
            seq,
            priority,
            accesses,
            args: OpArgs {
                reads: reads.to_vec(),
                writes: writes.to_vec(),
            },
            f: Box::new(op),
        };

        state.lanes.entry(lane).or_default().push_back(op);
        self.shared.work.notify_one();
    }

    /// Blocks until every scheduled operation finished.
    pub fn wait_for_all(&self) {
        let mut state = self.shared.state.lock();

        while state.inflight > 0 {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        let threads = thread::available_parallelism().map_or(1, |n| n.get().min(4));
        Self::new(threads)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("an engine worker panicked");
            }
        }
    }
}

fn worker(shared: &Shared) {
    loop {
        let op = {
            let mut state = shared.state.lock();

            loop {
                if let Some(op) = state.take_ready() {
                    break op;
                }

                if state.shutdown && state.inflight == 0 {
                    return;
                }

                shared.work.wait(&mut state);
            }
        };

        let Op {
            seq, accesses, args, f, ..
        } = op;

        // A failed input poisons every output.
        let upstream = args.reads.iter().find_map(Tensor::error);
        let res = match upstream {
            Some(err) => Err(err),
            None => f(&args),
        };

        let err: Option<EngineErr> = res.err();
        if let Some(err) = &err {
            debug!(seq = seq; "operation failed: {err}");
        }

        for access in &accesses {
            access.tensor.var().complete(access.write, err.clone());
        }

        let mut state = shared.state.lock();
        state.inflight -= 1;
        shared.work.notify_all();

        if state.inflight == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Context, DType};

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec([values.len()], values.to_vec(), Context::cpu(0)).unwrap()
    }

    #[test]
    fn lane_runs_in_push_order() {
        let engine = Engine::new(4);
        let out = Tensor::zeros([1], Context::cpu(0), DType::F32).unwrap();

        for i in 0..50 {
            engine.push_async(0, 0, &[], &[out.clone()], move |args| {
                let mut data = args.write(0);
                assert_eq!(data[0], i as f32);
                data[0] += 1.;
                Ok(())
            });
        }

        assert_eq!(out.to_vec().unwrap(), vec![50.]);
    }

    #[test]
    fn shared_tensor_orders_lanes() {
        let engine = Engine::new(4);
        let src = tensor(&[2.]);
        let dst = tensor(&[0.]);

        engine.push_async(1, 0, &[], &[src.clone()], |args| {
            args.write(0)[0] = 7.;
            Ok(())
        });

        engine.push_async(2, 100, &[src.clone()], &[dst.clone()], |args| {
            let v = args.read(0)[0];
            args.write(0)[0] = v;
            Ok(())
        });

        assert_eq!(dst.to_vec().unwrap(), vec![7.]);
    }

    #[test]
    fn failure_is_recorded_on_writes() {
        let _ = env_logger::builder().is_test(true).try_init();

        let engine = Engine::new(2);
        let out = tensor(&[1.]);
        let next = tensor(&[1.]);

        engine.push_async(0, 0, &[], &[out.clone()], |_| {
            Err(EngineErr::Op("unreachable server".into()))
        });
        engine.push_async(1, 0, &[out.clone()], &[next.clone()], |_| Ok(()));

        let err = EngineErr::Op("unreachable server".into());
        assert_eq!(out.wait_to_read(), Err(err.clone()));
        assert_eq!(next.to_vec(), Err(err));
    }

    #[test]
    fn wait_for_all_drains() {
        let engine = Engine::new(3);
        let ran = Arc::new(AtomicUsize::new(0));

        for lane in 0..10 {
            let ran = ran.clone();
            engine.push_async(lane, -(lane as i32), &[], &[], move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        engine.wait_for_all();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn drop_finishes_pending_work() {
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let engine = Engine::new(1);
            for _ in 0..5 {
                let ran = ran.clone();
                engine.push_async(0, 0, &[], &[], move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
        }

        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }
}
