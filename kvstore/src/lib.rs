//! A key-value store synchronizing parameters of data-parallel training workers.

mod error;
pub mod optimization;
mod server;
pub mod service;
mod storage;
mod store;
pub mod synchronization;
pub mod transport;

pub use error::{KvErr, Result};
pub use server::KVServer;
pub use store::KVStore;
