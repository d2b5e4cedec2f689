use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::OptimizerSpec;

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_wait_ms() -> u64 {
    60_000
}

/// The flavour of a key-value store, mirrors the names users configure it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Single machine, values reduced in host memory.
    Local,
    /// Single machine, values reduced on the first device.
    Device,
    /// Distributed, every step waits for all workers.
    DistSync,
    /// Distributed, pushes are applied as they arrive.
    DistAsync,
    /// Distributed, workers run at most `max_stale` iterations ahead of the slowest one.
    DistSsp,
}

impl StoreKind {
    /// Whether this kind reaches remote servers.
    pub fn is_dist(self) -> bool {
        matches!(self, Self::DistSync | Self::DistAsync | Self::DistSsp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Device => "device",
            Self::DistSync => "dist_sync",
            Self::DistAsync => "dist_async",
            Self::DistSsp => "dist_ssp",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "local_update_cpu" | "local_allreduce_cpu" => Ok(Self::Local),
            "device" | "local_allreduce_device" => Ok(Self::Device),
            "dist_sync" | "dist" => Ok(Self::DistSync),
            "dist_async" => Ok(Self::DistAsync),
            "dist_ssp" => Ok(Self::DistSsp),
            other => Err(format!("unknown kvstore kind {other}")),
        }
    }
}

/// The consistency level a server enforces between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencySpec {
    /// Pushes of a key are merged until every worker contributed.
    Sync,
    /// Pushes are applied as they arrive.
    Async,
    /// Pushes are applied as they arrive, workers gate themselves on the slowest one.
    BoundedStaleness {
        max_stale: u64,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_max_wait_ms")]
        max_wait_ms: u64,
    },
}

impl ConsistencySpec {
    /// A bounded staleness spec with the default polling interval and wait ceiling.
    pub fn bounded_staleness(max_stale: u64) -> Self {
        Self::BoundedStaleness {
            max_stale,
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

/// The specification for a server node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub workers: usize,
    pub consistency: ConsistencySpec,
    #[serde(default)]
    pub optimizer: Option<OptimizerSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            StoreKind::Local,
            StoreKind::Device,
            StoreKind::DistSync,
            StoreKind::DistAsync,
            StoreKind::DistSsp,
        ] {
            assert_eq!(kind.as_str().parse::<StoreKind>(), Ok(kind));
        }

        assert!("nccl".parse::<StoreKind>().is_err());
    }

    #[test]
    fn staleness_defaults() {
        let json = r#"{"bounded_staleness": {"max_stale": 2}}"#;
        let spec: ConsistencySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec, ConsistencySpec::bounded_staleness(2));
        assert_eq!(
            spec,
            ConsistencySpec::BoundedStaleness {
                max_stale: 2,
                poll_interval_ms: 10,
                max_wait_ms: 60_000,
            }
        );
    }
}
