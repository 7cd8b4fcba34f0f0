//! What to do with a request that arrives while every slot is busy.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvercapacityPolicy {
    /// Queue for a slot. Never rejects, only adds latency.
    Hold,
    /// Reject once more than `max_allowed` requests are counted at once.
    Reject { max_allowed: usize },
}

impl OvercapacityPolicy {
    /// Admission ceiling for the concurrency counter, if any.
    pub fn ceiling(&self) -> Option<usize> {
        match self {
            OvercapacityPolicy::Hold => None,
            OvercapacityPolicy::Reject { max_allowed } => Some(*max_allowed),
        }
    }
}

impl fmt::Display for OvercapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OvercapacityPolicy::Hold => write!(f, "hold"),
            OvercapacityPolicy::Reject { max_allowed } => {
                write!(f, "reject above {max_allowed}")
            }
        }
    }
}

/// Policy selector as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolicyKind {
    #[default]
    Hold,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown overcapacity policy '{0}', expected 'hold' or 'reject'")]
pub struct UnknownPolicy(pub String);

impl FromStr for PolicyKind {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hold" => Ok(PolicyKind::Hold),
            "reject" => Ok(PolicyKind::Reject),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}
