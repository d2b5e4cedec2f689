use std::sync::Arc;

use comms::{Key, msg::Command, specs::ConsistencySpec};

use super::Transport;
use crate::{KVServer, Result};

/// A transport that reaches a server living in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    server: Arc<KVServer>,
    rank: usize,
}

impl LocalTransport {
    pub fn new(server: Arc<KVServer>, rank: usize) -> Self {
        Self { server, rank }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn init(&self, key: Key, values: &[f32]) -> Result<()> {
        self.server.init(key, values)
    }

    fn push(&self, key: Key, values: &[f32]) -> Result<()> {
        self.server.push(self.rank, key, values)
    }

    fn pull(&self, key: Key, out: &mut [f32]) -> Result<()> {
        self.server.pull(self.rank, key, out)
    }

    fn request(&self, cmd: Command) -> Result<Command> {
        self.server.handle_command(self.rank, cmd)
    }
}

/// An in-process cluster, one server shared by every worker rank.
pub struct LocalCluster {
    server: Arc<KVServer>,
}

impl LocalCluster {
    /// Creates a new `LocalCluster`.
    ///
    /// # Arguments
    /// * `num_workers` - The amount of worker ranks.
    /// * `consistency` - The server's consistency.
    pub fn new(num_workers: usize, consistency: ConsistencySpec) -> Result<Self> {
        let server = KVServer::new(num_workers, consistency)?;

        Ok(Self {
            server: Arc::new(server),
        })
    }

    pub fn server(&self) -> &Arc<KVServer> {
        &self.server
    }

    pub fn num_workers(&self) -> usize {
        self.server.num_workers()
    }

    /// The transport of worker `rank`.
    pub fn transport(&self, rank: usize) -> LocalTransport {
        LocalTransport::new(self.server.clone(), rank)
    }

    /// One transport per rank, in rank order.
    pub fn transports(&self) -> Vec<LocalTransport> {
        (0..self.num_workers()).map(|rank| self.transport(rank)).collect()
    }
}
