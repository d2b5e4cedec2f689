use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use comms::{
    Key,
    msg::Command,
    specs::{ConsistencySpec, OptimizerSpec, StoreKind},
};
use engine::{Context, Tensor};
use kvstore::{
    KVStore, KvErr, Result,
    synchronization::StaleWait,
    transport::{LocalCluster, LocalTransport, Transport},
};

fn tensor(values: &[f32]) -> Tensor {
    Tensor::from_vec([values.len()], values.to_vec(), Context::cpu(0)).unwrap()
}

fn dist_stores(num_workers: usize, consistency: ConsistencySpec) -> Vec<KVStore> {
    let cluster = LocalCluster::new(num_workers, consistency).unwrap();

    cluster
        .transports()
        .into_iter()
        .map(|t| KVStore::dist(consistency, Arc::new(t), num_workers).unwrap())
        .collect()
}

#[test]
fn four_workers_average_like_one_push() {
    const LR: f32 = 0.1;
    let init = [1., -2., 0.5];
    let grad = [0.3, 0.6, -0.9];

    let handles: Vec<_> = dist_stores(4, ConsistencySpec::Sync)
        .into_iter()
        .map(|kv| {
            thread::spawn(move || {
                kv.init(&[0], &[tensor(&init)]).unwrap();
                kv.set_optimizer(&OptimizerSpec::sgd(LR, 0.)).unwrap();

                kv.push(0, &[tensor(&grad)], 0).unwrap();

                let out = tensor(&[0.; 3]);
                kv.pull(0, &[out.clone()], 0).unwrap();
                out.to_vec().unwrap()
            })
        })
        .collect();

    let single = KVStore::create(StoreKind::Local).unwrap();
    single.init(&[0], &[tensor(&init)]).unwrap();
    single.set_optimizer(&OptimizerSpec::sgd(LR, 0.)).unwrap();
    single.push(0, &[tensor(&grad)], 0).unwrap();

    let expected = tensor(&[0.; 3]);
    single.pull(0, &[expected.clone()], 0).unwrap();
    let expected = expected.to_vec().unwrap();

    for handle in handles {
        let got = handle.join().unwrap();
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-6, "{got:?} != {expected:?}");
        }
    }
}

#[test]
fn pull_reads_own_writes() {
    let handles: Vec<_> = dist_stores(2, ConsistencySpec::Sync)
        .into_iter()
        .map(|kv| {
            thread::spawn(move || {
                let rank = kv.rank() as f32;
                kv.init(&[4], &[tensor(&[0.])]).unwrap();

                let out = tensor(&[0.]);
                let mut seen = Vec::new();

                for step in 1..=3 {
                    kv.push(4, &[tensor(&[rank + step as f32])], 0).unwrap();
                    kv.pull(4, &[out.clone()], 0).unwrap();
                    seen.push(out.to_vec().unwrap()[0]);
                }

                seen
            })
        })
        .collect();

    // Without an optimizer each round's merged sum replaces the value.
    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![3., 5., 7.]);
    }
}

#[test]
fn init_is_visible_to_every_rank() {
    let handles: Vec<_> = dist_stores(3, ConsistencySpec::Async)
        .into_iter()
        .map(|kv| {
            thread::spawn(move || {
                let value = match kv.rank() {
                    0 => tensor(&[9., 8.]),
                    _ => tensor(&[0., 0.]),
                };
                kv.init(&[11], &[value]).unwrap();

                let out = tensor(&[0., 0.]);
                kv.pull(11, &[out.clone()], 0).unwrap();
                out.to_vec().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![9., 8.]);
    }
}

#[test]
fn bounded_staleness_gate() {
    let consistency = ConsistencySpec::BoundedStaleness {
        max_stale: 2,
        poll_interval_ms: 1,
        max_wait_ms: 10_000,
    };

    let mut stores = dist_stores(2, consistency).into_iter();
    let (fast, slow) = (stores.next().unwrap(), stores.next().unwrap());
    assert_eq!(fast.kind(), StoreKind::DistSsp);

    fast.report_progress(5).unwrap();
    slow.report_progress(3).unwrap();
    assert_eq!(fast.wait_for_staleness(5).unwrap(), StaleWait::Proceeded);

    fast.report_progress(6).unwrap();

    let slow = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        slow.report_progress(4).unwrap();
    });

    // Gap of 3 blocks until the slow worker completes another iteration.
    let start = Instant::now();
    assert_eq!(fast.wait_for_staleness(6).unwrap(), StaleWait::Proceeded);
    assert!(start.elapsed() >= Duration::from_millis(40));

    slow.join().unwrap();
}

#[test]
fn staleness_wait_times_out() {
    let consistency = ConsistencySpec::BoundedStaleness {
        max_stale: 0,
        poll_interval_ms: 1,
        max_wait_ms: 20,
    };

    let stores = dist_stores(2, consistency);
    stores[0].report_progress(3).unwrap();

    assert_eq!(stores[0].wait_for_staleness(3).unwrap(), StaleWait::TimedOut);
}

#[test]
fn stragglers_skip_the_wait() {
    let consistency = ConsistencySpec::bounded_staleness(0);

    let mut stores = dist_stores(2, consistency);
    stores[1].set_straggler_policy(|rank: usize, _: u64| rank == 1);

    assert_eq!(stores[1].wait_for_staleness(100).unwrap(), StaleWait::Bypassed);
}

/// A transport whose server is unreachable for pushes.
struct BrokenPush(LocalCluster);

impl Transport for BrokenPush {
    fn rank(&self) -> usize {
        0
    }

    fn init(&self, key: Key, values: &[f32]) -> Result<()> {
        self.0.transport(0).init(key, values)
    }

    fn push(&self, _key: Key, _values: &[f32]) -> Result<()> {
        Err(KvErr::Remote("connection reset".into()))
    }

    fn pull(&self, key: Key, out: &mut [f32]) -> Result<()> {
        self.0.transport(0).pull(key, out)
    }

    fn request(&self, cmd: Command) -> Result<Command> {
        self.0.transport(0).request(cmd)
    }
}

#[test]
fn transport_failure_surfaces_on_read() {
    let cluster = LocalCluster::new(1, ConsistencySpec::Async).unwrap();
    let kv = KVStore::dist(ConsistencySpec::Async, Arc::new(BrokenPush(cluster)), 1).unwrap();

    kv.init(&[0], &[tensor(&[1.])]).unwrap();
    kv.push(0, &[tensor(&[1.])], 0).unwrap();

    let out = tensor(&[0.]);
    kv.pull(0, &[out.clone()], 0).unwrap();

    let err = out.to_vec().unwrap_err();
    assert!(err.to_string().contains("connection reset"));
}

#[test]
fn duplicate_init_releases_the_other_ranks() {
    let cluster = LocalCluster::new(2, ConsistencySpec::Sync).unwrap();
    cluster.server().init(0, &[5.]).unwrap();

    let handles: Vec<_> = cluster
        .transports()
        .into_iter()
        .map(|t| {
            thread::spawn(move || {
                let kv = KVStore::dist(ConsistencySpec::Sync, Arc::new(t), 2).unwrap();
                kv.init(&[0], &[tensor(&[1.])])
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(matches!(results[0], Err(KvErr::DuplicateKey(0))));
    assert!(results[1].is_ok());
}

/// A transport whose server refuses the setup of the cluster.
struct RefusedSetup(LocalTransport);

impl Transport for RefusedSetup {
    fn rank(&self) -> usize {
        self.0.rank()
    }

    fn init(&self, _key: Key, _values: &[f32]) -> Result<()> {
        Err(KvErr::Remote("connection reset".into()))
    }

    fn push(&self, key: Key, values: &[f32]) -> Result<()> {
        self.0.push(key, values)
    }

    fn pull(&self, key: Key, out: &mut [f32]) -> Result<()> {
        self.0.pull(key, out)
    }

    fn request(&self, cmd: Command) -> Result<Command> {
        match cmd {
            Command::SetOptimizer(_) => Err(KvErr::Remote("connection reset".into())),
            cmd => self.0.request(cmd),
        }
    }
}

#[test]
fn failed_setup_fails_every_rank() {
    let cluster = LocalCluster::new(2, ConsistencySpec::Sync).unwrap();

    let handles: Vec<_> = cluster
        .transports()
        .into_iter()
        .map(|t| {
            thread::spawn(move || {
                let transport: Arc<dyn Transport> = match t.rank() {
                    0 => Arc::new(RefusedSetup(t)),
                    _ => Arc::new(t),
                };
                let kv = KVStore::dist(ConsistencySpec::Sync, transport, 2).unwrap();

                let init = kv.init(&[3], &[tensor(&[1., 2.])]);
                let optimizer = kv.set_optimizer(&OptimizerSpec::sgd(0.1, 0.));
                (init, optimizer)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(matches!(results[0].0, Err(KvErr::Remote(_))));
    assert!(matches!(results[0].1, Err(KvErr::Remote(_))));
    assert!(matches!(results[1].0, Err(KvErr::UninitializedKey(3))));
    assert!(matches!(results[1].1, Err(KvErr::Remote(_))));
    assert_eq!(cluster.server().optimizer_name(), None);
}

#[test]
fn custom_commands_reach_the_server() {
    let cluster = LocalCluster::new(1, ConsistencySpec::Sync).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);

    cluster.server().set_controller(move |head, body| {
        tx.lock().unwrap().send((head, body.to_string())).unwrap();
    });

    let kv = KVStore::dist(ConsistencySpec::Sync, Arc::new(cluster.transport(0)), 1).unwrap();
    kv.send_command(2, "checkpoint").unwrap();

    assert_eq!(rx.recv().unwrap(), (2, "checkpoint".to_string()));
}
