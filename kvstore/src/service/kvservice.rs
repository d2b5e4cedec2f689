use std::{borrow::Cow, io, sync::Arc};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Notify,
    task::{self, JoinSet},
};

use crate::{KVServer, Result};

/// Serves a `KVServer` to remote workers, one task per connection.
pub struct KVService {
    server: Arc<KVServer>,
    tasks: JoinSet<io::Result<()>>,
    stop: Arc<Notify>,
}

impl KVService {
    /// Creates a new `KVService`.
    ///
    /// # Arguments
    /// * `server` - The server to expose.
    pub fn new(server: Arc<KVServer>) -> Self {
        Self {
            server,
            tasks: JoinSet::new(),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn server(&self) -> &Arc<KVServer> {
        &self.server
    }

    /// Waits until every connection finished or a worker stopped the server.
    ///
    /// Stopping drops the connections still open.
    ///
    /// # Returns
    /// The first io error of a connection.
    pub async fn run(&mut self) -> io::Result<()> {
        loop {
            tokio::select! {
                res = self.tasks.join_next() => match res {
                    Some(res) => res??,
                    None => break,
                },
                _ = self.stop.notified() => {
                    info!("stopped by a worker");
                    self.tasks.shutdown().await;
                    return Ok(());
                }
            }
        }

        info!("every worker disconnected");
        Ok(())
    }

    /// Binds a new worker connection to this service and spawns it's task.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.server.clone();
        let stop = self.stop.clone();
        self.tasks.spawn(serve(server, stop, rx, tx));
    }
}

/// Creates an error for when an unexpected message kind is received.
fn unexpected_message_kind<U>(msg: &Msg) -> io::Result<U> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Received an unexpected message kind, got: {msg:?}"),
    ))
}

/// Sends the answer of a request, a failed request is answered with an `Err` message.
async fn reply<W>(tx: &mut OnoSender<W>, res: Result<Command>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match res {
        Ok(cmd) => tx.send(&Msg::Control(cmd)).await,
        Err(e) => {
            debug!("request failed: {e}");
            tx.send(&Msg::Err(Cow::Owned(e.to_string()))).await
        }
    }
}

async fn serve<R, W>(
    server: Arc<KVServer>,
    stop: Arc<Notify>,
    mut rx: OnoReceiver<R>,
    mut tx: OnoSender<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg: Msg = rx.recv().await?;
    let rank = match msg {
        Msg::Control(Command::Connect { rank }) => rank,
        other => return unexpected_message_kind(&other),
    };

    if rank >= server.num_workers() {
        let reason = format!("rank {rank} out of {} workers", server.num_workers());
        tx.send(&Msg::Err(Cow::Borrowed(&reason))).await?;
        return Err(io::Error::new(io::ErrorKind::InvalidInput, reason));
    }

    tx.send(&Msg::Control(Command::Ack)).await?;
    debug!(rank = rank; "worker connected");

    let mut value = Vec::new();

    loop {
        let msg: Msg = rx.recv().await?;

        match msg {
            Msg::Data(Payload::Init { key, values }) => {
                let res = task::block_in_place(|| server.init(key, values));
                reply(&mut tx, res.map(|_| Command::Ack)).await?;
            }
            Msg::Data(Payload::Push { key, values }) => {
                let res = task::block_in_place(|| server.push(rank, key, values));
                reply(&mut tx, res.map(|_| Command::Ack)).await?;
            }
            Msg::Control(Command::Pull { key }) => {
                let res = task::block_in_place(|| {
                    value.resize(server.len_of(key)?, 0.);
                    server.pull(rank, key, &mut value)
                });

                match res {
                    Ok(()) => {
                        let msg = Msg::Data(Payload::Value { key, values: &value });
                        tx.send(&msg).await?;
                    }
                    Err(e) => reply(&mut tx, Err(e)).await?,
                }
            }
            Msg::Control(Command::Disconnect) => {
                debug!(rank = rank; "worker disconnected");
                return Ok(());
            }
            Msg::Control(cmd) => {
                let res = task::block_in_place(|| server.handle_command(rank, cmd));
                reply(&mut tx, res).await?;

                if server.is_stopped() {
                    debug!(rank = rank; "closing connection of a stopped server");
                    stop.notify_one();
                    return Ok(());
                }
            }
            other => {
                warn!(rank = rank; "dropping connection");
                return unexpected_message_kind(&other);
            }
        }
    }
}
