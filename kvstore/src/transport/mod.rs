mod local;

use comms::{Key, msg::Command};

use crate::Result;

pub use local::{LocalCluster, LocalTransport};

/// A worker's connection to the parameter servers.
///
/// Requests of a single key must be delivered reliably and in order. Every method
/// blocks until the server answered.
pub trait Transport: Send + Sync {
    /// The rank of the worker this transport belongs to.
    fn rank(&self) -> usize;

    /// Initializes `key` on the server with `values`.
    fn init(&self, key: Key, values: &[f32]) -> Result<()>;

    /// Sends a contribution to `key`.
    fn push(&self, key: Key, values: &[f32]) -> Result<()>;

    /// Copies the newest value of `key` into `out`.
    fn pull(&self, key: Key, out: &mut [f32]) -> Result<()>;

    /// Sends a control command and returns the server's answer.
    fn request(&self, cmd: Command) -> Result<Command>;
}
