use std::sync::{
    Arc, Barrier,
    atomic::{AtomicBool, Ordering},
};

use comms::{
    Key,
    msg::Command,
    specs::{ConsistencySpec, OptimizerSpec, ServerSpec},
};
use log::{debug, info};
use parking_lot::RwLock;

use crate::{
    KvErr, Result,
    optimization::Optimizer,
    storage::SlotTable,
    synchronization::StalenessClock,
};

type Controller = Box<dyn Fn(i32, &str) + Send + Sync>;

/// The parameter server, it owns every slot and applies the cluster's consistency.
pub struct KVServer {
    num_workers: usize,
    consistency: ConsistencySpec,
    slots: SlotTable,
    optimizer: RwLock<Option<Arc<Optimizer>>>,
    barrier: Barrier,
    clock: StalenessClock,
    controller: RwLock<Option<Controller>>,
    stopped: AtomicBool,
}

impl KVServer {
    /// Creates a new `KVServer`.
    ///
    /// # Arguments
    /// * `num_workers` - The amount of workers in the cluster.
    /// * `consistency` - How pushes of different workers are combined.
    ///
    /// # Returns
    /// The server or `InvalidConfiguration` if there are no workers.
    pub fn new(num_workers: usize, consistency: ConsistencySpec) -> Result<Self> {
        if num_workers == 0 {
            return Err(KvErr::InvalidConfiguration(
                "a server needs at least one worker".into(),
            ));
        }

        Ok(Self {
            num_workers,
            consistency,
            slots: SlotTable::new(num_workers),
            optimizer: RwLock::new(None),
            barrier: Barrier::new(num_workers),
            clock: StalenessClock::new(num_workers),
            controller: RwLock::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Creates a server from it's specification, installing it's optimizer if any.
    pub fn from_spec(spec: &ServerSpec) -> Result<Self> {
        let server = Self::new(spec.workers, spec.consistency)?;

        if let Some(optimizer) = &spec.optimizer {
            server.set_optimizer(optimizer)?;
        }

        Ok(server)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn consistency(&self) -> ConsistencySpec {
        self.consistency
    }

    fn is_sync(&self) -> bool {
        self.consistency == ConsistencySpec::Sync
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.num_workers {
            return Err(KvErr::InvalidConfiguration(format!(
                "rank {rank} out of {} workers",
                self.num_workers
            )));
        }

        Ok(())
    }

    /// Initializes `key` with `value`.
    ///
    /// # Returns
    /// `DuplicateKey` if the key was already initialized.
    pub fn init(&self, key: Key, value: &[f32]) -> Result<()> {
        self.slots.init(key, value.to_vec())?;
        debug!(key = key, len = value.len(); "initialized key");
        Ok(())
    }

    /// Merges or applies a push of `rank` to `key`.
    ///
    /// In sync mode this may block while `rank` is two rounds ahead of the others.
    ///
    /// # Returns
    /// `UninitializedKey`, `TypeMismatch` or the optimizer's error.
    pub fn push(&self, rank: usize, key: Key, grad: &[f32]) -> Result<()> {
        self.check_rank(rank)?;

        let slot = self.slots.get(key)?;
        let optimizer = self.optimizer.read().clone();

        if self.is_sync() {
            slot.push_sync(rank, grad, optimizer.as_deref())
        } else {
            slot.push_async(grad, optimizer.as_deref())
        }
    }

    /// Copies the newest value of `key` into `out`.
    ///
    /// In sync mode this blocks until every round `rank` pushed to was applied.
    pub fn pull(&self, rank: usize, key: Key, out: &mut [f32]) -> Result<()> {
        self.check_rank(rank)?;
        self.slots.get(key)?.pull(rank, out, self.is_sync())
    }

    /// Returns the size of `key`'s value.
    pub fn len_of(&self, key: Key) -> Result<usize> {
        Ok(self.slots.get(key)?.len())
    }

    /// The name of the installed update rule.
    pub fn optimizer_name(&self) -> Option<&'static str> {
        self.optimizer.read().as_ref().map(|optimizer| optimizer.name())
    }

    /// Installs the update rule, every slot starts over with a fresh optimizer state.
    ///
    /// # Returns
    /// `InvalidConfiguration` through the optimizer's error if the spec is invalid.
    pub fn set_optimizer(&self, spec: &OptimizerSpec) -> Result<()> {
        let optimizer = Optimizer::from_spec(spec)?;

        *self.optimizer.write() = Some(Arc::new(optimizer));
        self.slots.reset_states();

        info!("installed the {} optimizer", spec.name());
        Ok(())
    }

    /// Blocks until every worker called this method.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Records that `rank` completed `iteration` iterations.
    pub fn report_progress(&self, rank: usize, iteration: u64) -> Result<()> {
        if !self.clock.report(rank, iteration) {
            return self.check_rank(rank);
        }

        Ok(())
    }

    /// The least amount of iterations completed across workers.
    pub fn min_progress(&self) -> u64 {
        self.clock.min()
    }

    /// Sets the handler of application defined commands.
    pub fn set_controller<F>(&self, controller: F)
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        *self.controller.write() = Some(Box::new(controller));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Dispatches a control command from `rank`.
    ///
    /// # Returns
    /// The answer to send back or `InvalidConfiguration` for a command that isn't a request.
    pub fn handle_command(&self, rank: usize, cmd: Command) -> Result<Command> {
        self.check_rank(rank)?;

        match cmd {
            Command::SetOptimizer(spec) => {
                self.set_optimizer(&spec)?;
                Ok(Command::Ack)
            }
            Command::Barrier => {
                self.barrier();
                Ok(Command::Ack)
            }
            Command::ReportProgress { iteration } => {
                self.report_progress(rank, iteration)?;
                Ok(Command::Ack)
            }
            Command::QueryProgress => Ok(Command::Progress {
                min_iteration: self.min_progress(),
            }),
            Command::QueryKey { key } => Ok(Command::KeyLen {
                key,
                len: self.len_of(key)?,
            }),
            Command::QueryOptimizer => Ok(Command::OptimizerName {
                name: self.optimizer_name().map(str::to_string),
            }),
            Command::Custom { head, body } => {
                match &*self.controller.read() {
                    Some(controller) => controller(head, &body),
                    None => info!(head = head; "no controller for command {body}"),
                }

                Ok(Command::Ack)
            }
            Command::StopServer => {
                self.stopped.store(true, Ordering::Release);
                info!(rank = rank; "stop requested");
                Ok(Command::Ack)
            }
            other => Err(KvErr::InvalidConfiguration(format!(
                "unexpected command {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;

    #[test]
    fn uninitialized_key() {
        let server = KVServer::new(1, ConsistencySpec::Sync).unwrap();

        assert!(matches!(
            server.push(0, 1, &[1.]),
            Err(KvErr::UninitializedKey(1))
        ));
        assert!(matches!(
            server.pull(0, 1, &mut [0.]),
            Err(KvErr::UninitializedKey(1))
        ));
    }

    #[test]
    fn init_then_pull() {
        let server = KVServer::new(2, ConsistencySpec::Sync).unwrap();
        server.init(0, &[1., 2., 3.]).unwrap();

        let mut out = [0.; 3];
        server.pull(1, 0, &mut out).unwrap();
        assert_eq!(out, [1., 2., 3.]);
        assert!(matches!(server.init(0, &[1.]), Err(KvErr::DuplicateKey(0))));
    }

    #[test]
    fn sum_replaces_value_without_optimizer() {
        let server = Arc::new(KVServer::new(3, ConsistencySpec::Sync).unwrap());
        server.init(7, &[100.]).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let server = server.clone();
                thread::spawn(move || {
                    server.push(rank, 7, &[rank as f32 + 1.]).unwrap();
                    let mut out = [0.];
                    server.pull(rank, 7, &mut out).unwrap();
                    out[0]
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 6.);
        }
    }

    #[test]
    fn async_applies_every_push() {
        let server = KVServer::new(2, ConsistencySpec::Async).unwrap();
        server.set_optimizer(&OptimizerSpec::sgd(1., 0.)).unwrap();
        server.init(0, &[0.]).unwrap();

        server.push(0, 0, &[1.]).unwrap();
        server.push(0, 0, &[1.]).unwrap();

        let mut out = [0.];
        server.pull(1, 0, &mut out).unwrap();
        assert_eq!(out, [-2.]);
    }

    #[test]
    fn progress_commands() {
        let server = KVServer::new(2, ConsistencySpec::bounded_staleness(1)).unwrap();

        let ack = server
            .handle_command(0, Command::ReportProgress { iteration: 3 })
            .unwrap();
        assert_eq!(ack, Command::Ack);

        let progress = server.handle_command(1, Command::QueryProgress).unwrap();
        assert_eq!(progress, Command::Progress { min_iteration: 0 });

        server.report_progress(1, 2).unwrap();
        assert_eq!(server.min_progress(), 2);
    }

    #[test]
    fn custom_commands_reach_controller() {
        let server = KVServer::new(1, ConsistencySpec::Sync).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            server.set_controller(move |head, body| seen.lock().unwrap().push((head, body.to_string())));
        }

        server
            .handle_command(
                0,
                Command::Custom {
                    head: 3,
                    body: "lr=0.1".into(),
                },
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(3, "lr=0.1".to_string())]);
    }

    #[test]
    fn rejects_answers_as_requests() {
        let server = KVServer::new(1, ConsistencySpec::Sync).unwrap();

        assert!(server.handle_command(0, Command::Ack).is_err());
        assert!(server.handle_command(1, Command::Barrier).is_err());
    }

    #[test]
    fn key_and_optimizer_queries() {
        let server = KVServer::new(1, ConsistencySpec::Sync).unwrap();

        assert!(matches!(
            server.handle_command(0, Command::QueryKey { key: 4 }),
            Err(KvErr::UninitializedKey(4))
        ));
        assert_eq!(
            server.handle_command(0, Command::QueryOptimizer).unwrap(),
            Command::OptimizerName { name: None }
        );

        server.init(4, &[0.; 3]).unwrap();
        server.set_optimizer(&OptimizerSpec::sgd(0.1, 0.)).unwrap();

        assert_eq!(
            server.handle_command(0, Command::QueryKey { key: 4 }).unwrap(),
            Command::KeyLen { key: 4, len: 3 }
        );
        assert_eq!(
            server.handle_command(0, Command::QueryOptimizer).unwrap(),
            Command::OptimizerName {
                name: Some("sgd".to_string())
            }
        );
    }

    #[test]
    fn stop_server() {
        let server = KVServer::new(1, ConsistencySpec::Sync).unwrap();
        server.handle_command(0, Command::StopServer).unwrap();
        assert!(server.is_stopped());
    }
}
