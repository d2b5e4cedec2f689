use std::sync::Arc;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::{ConsistencySpec, OptimizerSpec, ServerSpec},
};
use kvstore::{
    KVServer,
    service::{KVService, ServerBuilder},
};
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

type Rx = OnoReceiver<ReadHalf<DuplexStream>>;
type Tx = OnoSender<WriteHalf<DuplexStream>>;

fn attach(service: &mut KVService) -> (Rx, Tx) {
    let (one, two) = io::duplex(4096);

    let (rx, tx) = io::split(one);
    let (rx, tx) = comms::channel(rx, tx);
    service.spawn(rx, tx);

    let (rx, tx) = io::split(two);
    comms::channel(rx, tx)
}

async fn request(rx: &mut Rx, tx: &mut Tx, msg: &Msg<'_>) -> Command {
    tx.send(msg).await.unwrap();

    match rx.recv().await.unwrap() {
        Msg::Control(cmd) => cmd,
        other => panic!("expected a command, got {other:?}"),
    }
}

async fn pull(rx: &mut Rx, tx: &mut Tx, key: u64) -> Vec<f32> {
    tx.send(&Msg::Control(Command::Pull { key })).await.unwrap();

    match rx.recv().await.unwrap() {
        Msg::Data(Payload::Value { key: k, values }) => {
            assert_eq!(k, key);
            values.to_vec()
        }
        other => panic!("expected a value, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_session() {
    let spec = ServerSpec {
        workers: 1,
        consistency: ConsistencySpec::Sync,
        optimizer: Some(OptimizerSpec::sgd(0.5, 0.)),
    };

    let mut service = ServerBuilder::new().build(&spec).unwrap();
    assert_eq!(service.server().num_workers(), 1);
    let (mut rx, mut tx) = attach(&mut service);

    let connect = Msg::Control(Command::Connect { rank: 0 });
    assert_eq!(request(&mut rx, &mut tx, &connect).await, Command::Ack);

    let init = Msg::Data(Payload::Init { key: 1, values: &[1., 2.] });
    assert_eq!(request(&mut rx, &mut tx, &init).await, Command::Ack);

    let push = Msg::Data(Payload::Push { key: 1, values: &[2., 2.] });
    assert_eq!(request(&mut rx, &mut tx, &push).await, Command::Ack);

    assert_eq!(pull(&mut rx, &mut tx, 1).await, vec![0., 1.]);

    let progress = Msg::Control(Command::ReportProgress { iteration: 7 });
    assert_eq!(request(&mut rx, &mut tx, &progress).await, Command::Ack);

    let query = Msg::Control(Command::QueryProgress);
    assert_eq!(
        request(&mut rx, &mut tx, &query).await,
        Command::Progress { min_iteration: 7 }
    );

    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();
    service.run().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_requests_keep_the_connection() {
    let server = Arc::new(KVServer::new(1, ConsistencySpec::Async).unwrap());
    let mut service = KVService::new(server);
    let (mut rx, mut tx) = attach(&mut service);

    let connect = Msg::Control(Command::Connect { rank: 0 });
    assert_eq!(request(&mut rx, &mut tx, &connect).await, Command::Ack);

    let push = Msg::Data(Payload::Push { key: 9, values: &[1.] });
    tx.send(&push).await.unwrap();

    match rx.recv().await.unwrap() {
        Msg::Err(e) => assert!(e.contains('9'), "{e}"),
        other => panic!("expected an error, got {other:?}"),
    }

    let init = Msg::Data(Payload::Init { key: 9, values: &[4.] });
    assert_eq!(request(&mut rx, &mut tx, &init).await, Command::Ack);
    assert_eq!(pull(&mut rx, &mut tx, 9).await, vec![4.]);

    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();
    service.run().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rank_out_of_range_is_rejected() {
    let server = Arc::new(KVServer::new(2, ConsistencySpec::Sync).unwrap());
    let mut service = KVService::new(server);
    let (mut rx, mut tx) = attach(&mut service);

    tx.send(&Msg::Control(Command::Connect { rank: 5 }))
        .await
        .unwrap();

    let msg: Msg = rx.recv().await.unwrap();
    assert!(matches!(msg, Msg::Err(_)));

    assert!(service.run().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_workers_merge_their_pushes() {
    let server = Arc::new(KVServer::new(2, ConsistencySpec::Sync).unwrap());
    let mut service = KVService::new(server);

    let mut workers = Vec::new();
    for rank in 0..2 {
        let (mut rx, mut tx) = attach(&mut service);

        workers.push(tokio::spawn(async move {
            let connect = Msg::Control(Command::Connect { rank });
            assert_eq!(request(&mut rx, &mut tx, &connect).await, Command::Ack);

            if rank == 0 {
                let init = Msg::Data(Payload::Init { key: 0, values: &[0., 0.] });
                assert_eq!(request(&mut rx, &mut tx, &init).await, Command::Ack);
            }

            let barrier = Msg::Control(Command::Barrier);
            assert_eq!(request(&mut rx, &mut tx, &barrier).await, Command::Ack);

            let grad = [rank as f32 + 1., 10.];
            let push = Msg::Data(Payload::Push { key: 0, values: &grad });
            assert_eq!(request(&mut rx, &mut tx, &push).await, Command::Ack);

            let value = pull(&mut rx, &mut tx, 0).await;
            tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();
            value
        }));
    }

    for worker in workers {
        assert_eq!(worker.await.unwrap(), vec![3., 20.]);
    }

    service.run().await.unwrap();
}

#[test]
fn builder_rejects_empty_clusters() {
    let spec = ServerSpec {
        workers: 0,
        consistency: ConsistencySpec::Sync,
        optimizer: None,
    };

    assert!(ServerBuilder::new().build(&spec).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_server_ends_the_session() {
    let server = Arc::new(KVServer::new(2, ConsistencySpec::Sync).unwrap());
    let mut service = KVService::new(server.clone());

    let (mut rx, mut tx) = attach(&mut service);
    let _idle = attach(&mut service);

    let connect = Msg::Control(Command::Connect { rank: 0 });
    assert_eq!(request(&mut rx, &mut tx, &connect).await, Command::Ack);

    let stop = Msg::Control(Command::StopServer);
    assert_eq!(request(&mut rx, &mut tx, &stop).await, Command::Ack);

    service.run().await.unwrap();
    assert!(server.is_stopped());
}
