use std::sync::Arc;

use comms::specs::ServerSpec;

use super::KVService;
use crate::{KVServer, Result};

/// Builds `KVService`s given a specification.
#[derive(Debug, Default)]
pub struct ServerBuilder;

impl ServerBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `KVService` following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the server node.
    ///
    /// # Returns
    /// The service or `InvalidConfiguration` if the spec has no workers or an invalid optimizer.
    pub fn build(&self, spec: &ServerSpec) -> Result<KVService> {
        let server = KVServer::from_spec(spec)?;
        Ok(KVService::new(Arc::new(server)))
    }
}
