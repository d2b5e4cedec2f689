use std::{env, io};

use comms::msg::{Command, Msg};
use kvstore::service::ServerBuilder;
use log::{error, info, warn};
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> io::Result<()> {
    const ADDR: &str = "127.0.0.1:8765";

    env_logger::init();

    let addr = env::var("KVSTORE_ADDR").unwrap_or_else(|_| ADDR.to_string());
    let list = TcpListener::bind(&addr).await?;
    let builder = ServerBuilder::new();
    info!("listening on {addr}");

    let (stream, _) = list.accept().await?;
    let (rx, tx) = stream.into_split();
    let (mut rx, _) = comms::channel(rx, tx);

    loop {
        let msg = match rx.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                error!("failed to receive the server spec: {e}");
                return Err(e);
            }
        };

        let spec = match msg {
            Msg::Control(Command::CreateServer(spec)) => spec,
            other => {
                warn!("expected a CreateServer command, got {other:?}");
                continue;
            }
        };

        let mut service = match builder.build(&spec) {
            Ok(service) => service,
            Err(e) => {
                warn!("invalid server spec: {e}");
                continue;
            }
        };

        let server = service.server().clone();
        info!(workers = spec.workers; "waiting for workers");

        for _ in 0..spec.workers {
            let (stream, peer) = list.accept().await?;
            info!("accepted {peer}");

            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            service.spawn(rx, tx);
        }

        tokio::select! {
            res = service.run() => {
                if server.is_stopped() {
                    info!("stopped by a worker");
                }

                break res;
            }
            res = signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break res;
            }
        }
    }
}
