//! Collective drivers: decide what a request contains.

mod alltoallv;

pub use alltoallv::{AlltoallvBuffer, alltoallv, alltoallv_init, alltoallv_with};

use crate::error::RmaCollError;

/// How the all-to-all-variable driver moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlltoallvAlgorithm {
    /// One round of puts into every peer's receive buffer, then a window
    /// release.
    LinearPut,
    /// One round of gets from every peer's send buffer, then a window
    /// release.
    LinearGet,
    /// Trigger graph; receivers read once senders flag their blocks ready.
    TriggerPull,
    /// Trigger graph; senders write once receivers flag their buffers ready.
    TriggerPush,
}

impl AlltoallvAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinearPut => "linear_rput",
            Self::LinearGet => "linear_rget",
            Self::TriggerPull => "trigger_pull",
            Self::TriggerPush => "trigger_push",
        }
    }

    /// Whether peers read from the local send buffer (true) or write into
    /// the local receive buffer (false).
    pub(crate) fn exposes_send_buffer(&self) -> bool {
        matches!(self, Self::LinearGet | Self::TriggerPull)
    }
}

impl std::fmt::Display for AlltoallvAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlltoallvAlgorithm {
    type Err = RmaCollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear_rput" => Ok(Self::LinearPut),
            "linear_rget" => Ok(Self::LinearGet),
            "trigger_pull" | "linear_trigger_pull" => Ok(Self::TriggerPull),
            "trigger_push" | "linear_trigger_push" => Ok(Self::TriggerPush),
            other => Err(RmaCollError::invalid(format!(
                "unknown alltoallv algorithm '{other}'"
            ))),
        }
    }
}
