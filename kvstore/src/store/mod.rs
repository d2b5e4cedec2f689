use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use comms::{
    Key,
    msg::Command,
    specs::{ConsistencySpec, OptimizerSpec, StoreKind},
};
use engine::{Context, DType, Engine, EngineErr, Shape, Tensor};
use log::debug;
use parking_lot::RwLock;

use crate::{
    KvErr, Result,
    optimization::Optimizer,
    synchronization::{NeverStraggler, StaleWait, StalenessGate, StragglerPolicy},
    transport::{LocalCluster, Transport},
};

#[derive(Clone)]
struct KeyInfo {
    shape: Shape,
    dtype: DType,
    /// Written by every push and read by every pull, carries push failures to pulls.
    sentinel: Tensor,
}

/// The worker side of the key-value store.
///
/// `push` and `pull` are scheduled on the engine lane of their key and return right
/// away, readers of the pulled tensors block until the values arrived.
pub struct KVStore {
    kind: StoreKind,
    transport: Arc<dyn Transport>,
    num_workers: usize,
    gate: Option<StalenessGate>,
    straggler: Box<dyn StragglerPolicy>,
    keys: RwLock<HashMap<Key, KeyInfo>>,
    engine: Engine,
}

impl KVStore {
    fn with_transport(
        kind: StoreKind,
        transport: Arc<dyn Transport>,
        num_workers: usize,
        gate: Option<StalenessGate>,
    ) -> Self {
        Self {
            kind,
            transport,
            num_workers,
            gate,
            straggler: Box::new(NeverStraggler),
            keys: RwLock::new(HashMap::new()),
            engine: Engine::default(),
        }
    }

    /// Creates a single machine store backed by an in-process server.
    ///
    /// # Arguments
    /// * `kind` - Either `local` or `device`.
    ///
    /// # Returns
    /// The store or `InvalidConfiguration` for a distributed kind, those need a transport.
    pub fn create(kind: StoreKind) -> Result<Self> {
        if kind.is_dist() {
            return Err(KvErr::InvalidConfiguration(format!(
                "{kind} needs a transport to reach it's servers"
            )));
        }

        let cluster = LocalCluster::new(1, ConsistencySpec::Sync)?;
        let transport = Arc::new(cluster.transport(0));

        Ok(Self::with_transport(kind, transport, 1, None))
    }

    /// Creates a distributed store.
    ///
    /// # Arguments
    /// * `consistency` - The servers' consistency, it determines the store kind.
    /// * `transport` - The connection to the servers, it knows this worker's rank.
    /// * `num_workers` - The amount of workers in the cluster.
    ///
    /// # Returns
    /// The store or `InvalidConfiguration` if the rank is out of range.
    pub fn dist(
        consistency: ConsistencySpec,
        transport: Arc<dyn Transport>,
        num_workers: usize,
    ) -> Result<Self> {
        let rank = transport.rank();

        if rank >= num_workers {
            return Err(KvErr::InvalidConfiguration(format!(
                "rank {rank} out of {num_workers} workers"
            )));
        }

        let kind = match consistency {
            ConsistencySpec::Sync => StoreKind::DistSync,
            ConsistencySpec::Async => StoreKind::DistAsync,
            ConsistencySpec::BoundedStaleness { .. } => StoreKind::DistSsp,
        };

        let gate = StalenessGate::from_spec(&consistency);
        Ok(Self::with_transport(kind, transport, num_workers, gate))
    }

    /// Sets the policy deciding which workers skip the staleness wait.
    pub fn set_straggler_policy<P: StragglerPolicy + 'static>(&mut self, policy: P) {
        self.straggler = Box::new(policy);
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn info(&self, key: Key) -> Result<KeyInfo> {
        self.keys
            .read()
            .get(&key)
            .cloned()
            .ok_or(KvErr::UninitializedKey(key))
    }

    fn check_values(key: Key, info: &KeyInfo, values: &[Tensor]) -> Result<()> {
        if values.is_empty() {
            return Err(KvErr::InvalidConfiguration(format!(
                "no tensors given for key {key}"
            )));
        }

        for value in values {
            if value.dtype() != info.dtype || value.size() != info.shape.size() {
                return Err(KvErr::TypeMismatch(format!(
                    "key {key} holds {} {}, got {} {}",
                    info.dtype,
                    info.shape,
                    value.dtype(),
                    value.shape()
                )));
            }
        }

        Ok(())
    }

    /// Initializes every key with it's value, once per key across the cluster.
    ///
    /// Rank 0 sends the values, then every rank waits on a barrier so the keys are
    /// initialized everywhere once this returns. Rank 0 reaches the barrier even when
    /// sending fails, the other ranks then check every key exists on the servers.
    ///
    /// # Arguments
    /// * `keys` - The keys.
    /// * `values` - One value per key.
    ///
    /// # Returns
    /// `DuplicateKey` if a key was already initialized or is repeated, on ranks other
    /// than 0 `UninitializedKey` or `TypeMismatch` if the servers don't hold the key.
    pub fn init(&self, keys: &[Key], values: &[Tensor]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(KvErr::InvalidConfiguration(format!(
                "{} keys for {} values",
                keys.len(),
                values.len()
            )));
        }

        {
            let known = self.keys.read();
            let mut seen = HashSet::new();

            if let Some(&key) = keys.iter().find(|k| known.contains_key(*k) || !seen.insert(**k)) {
                return Err(KvErr::DuplicateKey(key));
            }
        }

        if self.rank() == 0 {
            let sent = keys
                .iter()
                .zip(values)
                .try_for_each(|(&key, value)| self.transport.init(key, &value.to_vec()?));

            self.barrier()?;
            sent?;
        } else {
            self.barrier()?;

            for (&key, value) in keys.iter().zip(values) {
                let len = self.key_len(key)?;

                if len != value.size() {
                    return Err(KvErr::TypeMismatch(format!(
                        "key {key} holds {len} elements, got {}",
                        value.shape()
                    )));
                }
            }
        }

        {
            let mut known = self.keys.write();

            for (&key, value) in keys.iter().zip(values) {
                let info = KeyInfo {
                    shape: value.shape().clone(),
                    dtype: value.dtype(),
                    sentinel: Tensor::zeros([1], Context::cpu(0), DType::F32)?,
                };

                known.insert(key, info);
            }
        }

        debug!(rank = self.rank(); "initialized {} keys", keys.len());
        Ok(())
    }

    /// The size of `key`'s value on the servers.
    fn key_len(&self, key: Key) -> Result<usize> {
        match self.transport.request(Command::QueryKey { key })? {
            Command::KeyLen { len, .. } => Ok(len),
            other => Err(KvErr::Remote(format!(
                "expected the length of key {key}, got {other:?}"
            ))),
        }
    }

    /// Schedules a push of the sum of `values` to `key`.
    ///
    /// # Arguments
    /// * `key` - The key.
    /// * `values` - One contribution per device, summed before sending.
    /// * `priority` - Higher priorities are sent first.
    ///
    /// # Returns
    /// `UninitializedKey` or `TypeMismatch`, transport failures surface on the next pull.
    pub fn push(&self, key: Key, values: &[Tensor], priority: i32) -> Result<()> {
        let info = self.info(key)?;
        Self::check_values(key, &info, values)?;

        let transport = self.transport.clone();

        self.engine
            .push_async(key, priority, values, &[info.sentinel], move |args| {
                let mut merged = args.read(0).to_vec();

                for i in 1..args.num_reads() {
                    merged
                        .iter_mut()
                        .zip(args.read(i).iter())
                        .for_each(|(m, v)| *m += v);
                }

                transport
                    .push(key, &merged)
                    .map_err(|e| EngineErr::Op(e.to_string()))
            });

        Ok(())
    }

    /// Schedules a pull of `key`'s newest value into every tensor of `outs`.
    ///
    /// # Arguments
    /// * `key` - The key.
    /// * `outs` - The destinations, reading them blocks until the value arrived.
    /// * `priority` - Higher priorities are pulled first.
    ///
    /// # Returns
    /// `UninitializedKey` or `TypeMismatch`, transport failures are recorded on `outs`.
    pub fn pull(&self, key: Key, outs: &[Tensor], priority: i32) -> Result<()> {
        let info = self.info(key)?;
        Self::check_values(key, &info, outs)?;

        let transport = self.transport.clone();
        let len = info.shape.size();

        self.engine
            .push_async(key, priority, &[info.sentinel], outs, move |args| {
                let mut value = vec![0.; len];
                transport
                    .pull(key, &mut value)
                    .map_err(|e| EngineErr::Op(e.to_string()))?;

                for i in 0..args.num_writes() {
                    args.write(i).copy_from_slice(&value);
                }

                Ok(())
            });

        Ok(())
    }

    /// Installs the server side update rule.
    ///
    /// Rank 0 sends the optimizer, then every rank waits on a barrier. The other ranks
    /// check the servers installed it.
    ///
    /// # Returns
    /// The optimizer's error if the spec is invalid, the servers' error on rank 0 and
    /// `Remote` on the other ranks if the servers didn't install it.
    pub fn set_optimizer(&self, spec: &OptimizerSpec) -> Result<()> {
        Optimizer::from_spec(spec)?;

        if self.rank() == 0 {
            let sent = self
                .transport
                .request(Command::SetOptimizer(spec.clone()))
                .and_then(expect_ack);

            self.barrier()?;
            return sent;
        }

        self.barrier()?;

        match self.transport.request(Command::QueryOptimizer)? {
            Command::OptimizerName { name: Some(name) } if name == spec.name() => Ok(()),
            other => Err(KvErr::Remote(format!(
                "the servers didn't install {}, got {other:?}",
                spec.name()
            ))),
        }
    }

    /// Blocks until every worker reached the barrier.
    pub fn barrier(&self) -> Result<()> {
        expect_ack(self.transport.request(Command::Barrier)?)
    }

    /// Blocks until every scheduled push and pull finished.
    pub fn wait_all(&self) {
        self.engine.wait_for_all();
    }

    /// Sends an application defined command to the servers.
    pub fn send_command(&self, head: i32, body: &str) -> Result<()> {
        let cmd = Command::Custom {
            head,
            body: body.to_string(),
        };

        expect_ack(self.transport.request(cmd)?)
    }

    /// Publishes that this worker completed `iteration` iterations.
    pub fn report_progress(&self, iteration: u64) -> Result<()> {
        expect_ack(self.transport.request(Command::ReportProgress { iteration })?)
    }

    /// The least amount of iterations completed across workers.
    pub fn min_progress(&self) -> Result<u64> {
        match self.transport.request(Command::QueryProgress)? {
            Command::Progress { min_iteration } => Ok(min_iteration),
            other => Err(KvErr::Remote(format!(
                "expected the cluster progress, got {other:?}"
            ))),
        }
    }

    /// Holds this worker back before `iteration` while it's too far ahead of the slowest one.
    ///
    /// Stores without bounded staleness proceed right away.
    pub fn wait_for_staleness(&self, iteration: u64) -> Result<StaleWait> {
        let Some(gate) = self.gate else {
            return Ok(StaleWait::Proceeded);
        };

        let rank = self.rank();
        if self.straggler.is_straggler(rank, iteration) {
            debug!(rank = rank, iteration = iteration; "straggler skips the staleness wait");
            return Ok(StaleWait::Bypassed);
        }

        gate.wait(iteration, || self.min_progress())
    }
}

fn expect_ack(answer: Command) -> Result<()> {
    match answer {
        Command::Ack => Ok(()),
        other => Err(KvErr::Remote(format!("expected an ack, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec([values.len()], values.to_vec(), Context::cpu(0)).unwrap()
    }

    #[test]
    fn dist_kinds_need_a_transport() {
        assert!(matches!(
            KVStore::create(StoreKind::DistSync),
            Err(KvErr::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn init_then_pull_round_trip() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        kv.init(&[3], &[tensor(&[1., 2., 3.])]).unwrap();

        let out = tensor(&[0.; 3]);
        kv.pull(3, &[out.clone()], 0).unwrap();

        assert_eq!(out.to_vec().unwrap(), vec![1., 2., 3.]);
    }

    #[test]
    fn init_twice_fails() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        kv.init(&[0], &[tensor(&[1.])]).unwrap();

        assert!(matches!(
            kv.init(&[0], &[tensor(&[1.])]),
            Err(KvErr::DuplicateKey(0))
        ));
        assert!(matches!(
            kv.init(&[1, 1], &[tensor(&[1.]), tensor(&[1.])]),
            Err(KvErr::DuplicateKey(1))
        ));
    }

    #[test]
    fn uninitialized_key_fails_at_call_time() {
        let kv = KVStore::create(StoreKind::Device).unwrap();

        assert!(matches!(
            kv.push(5, &[tensor(&[1.])], 0),
            Err(KvErr::UninitializedKey(5))
        ));
        assert!(matches!(
            kv.pull(5, &[tensor(&[1.])], 0),
            Err(KvErr::UninitializedKey(5))
        ));
    }

    #[test]
    fn shape_mismatch_fails_at_call_time() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        kv.init(&[0], &[tensor(&[1., 2.])]).unwrap();

        let ints = Tensor::zeros([2], Context::cpu(0), DType::I32).unwrap();

        assert!(matches!(
            kv.push(0, &[tensor(&[1.])], 0),
            Err(KvErr::TypeMismatch(_))
        ));
        assert!(matches!(kv.pull(0, &[ints], 0), Err(KvErr::TypeMismatch(_))));
    }

    #[test]
    fn push_sums_devices_then_pull_reads_it() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        kv.init(&[0], &[tensor(&[0., 0.])]).unwrap();

        kv.push(0, &[tensor(&[1., 2.]), tensor(&[3., 4.])], 0)
            .unwrap();

        let outs = [tensor(&[0., 0.]), tensor(&[0., 0.])];
        kv.pull(0, &outs, 0).unwrap();

        for out in &outs {
            assert_eq!(out.to_vec().unwrap(), vec![4., 6.]);
        }
    }

    #[test]
    fn local_optimizer_updates_on_push() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        kv.init(&[0], &[tensor(&[1.])]).unwrap();
        kv.set_optimizer(&OptimizerSpec::sgd(0.5, 0.)).unwrap();

        kv.push(0, &[tensor(&[1.])], 0).unwrap();

        let out = tensor(&[0.]);
        kv.pull(0, &[out.clone()], 0).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![0.5]);
    }

    #[test]
    fn non_bounded_stores_never_wait() {
        let kv = KVStore::create(StoreKind::Local).unwrap();
        assert_eq!(kv.wait_for_staleness(1_000).unwrap(), StaleWait::Proceeded);
    }
}
