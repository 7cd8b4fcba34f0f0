//! Startup configuration read from the environment.
//!
//! Empty values count as unset. Everything is validated before the listener
//! is bound, so a bad setting never results in a half-started gate.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::admission::{OvercapacityPolicy, PolicyKind, SlotPool, UnknownPolicy};
use crate::transport::ServerConfig;

pub const HOST_VAR: &str = "SLOTGATE_HOST";
pub const PORT_VAR: &str = "SLOTGATE_PORT";
pub const BACKEND_URL_VAR: &str = "SLOTGATE_BACKEND_URL";
pub const MAX_CONCURRENT_VAR: &str = "SLOTGATE_MAX_CONCURRENT";
pub const POLICY_VAR: &str = "SLOTGATE_POLICY";
pub const MAX_ALLOWED_VAR: &str = "SLOTGATE_MAX_ALLOWED";
pub const QUEUE_TIMEOUT_VAR: &str = "SLOTGATE_QUEUE_TIMEOUT_MS";

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8181/";
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_MAX_ALLOWED: usize = 75;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    InvalidPolicy(#[from] UnknownPolicy),
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("SLOTGATE_BACKEND_URL is not a valid URL '{value}': {source}")]
    InvalidBackendUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("SLOTGATE_MAX_CONCURRENT must be at least 1")]
    ZeroCapacity,
    #[error("SLOTGATE_MAX_CONCURRENT ({requested}) must not exceed {limit}")]
    CapacityTooLarge { requested: usize, limit: usize },
    #[error(
        "SLOTGATE_MAX_ALLOWED ({max_allowed}) must not be below SLOTGATE_MAX_CONCURRENT ({capacity}) under the reject policy"
    )]
    ThresholdBelowCapacity { max_allowed: usize, capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub server: ServerConfig,
    pub backend_url: Url,
    pub max_concurrent_requests: NonZeroUsize,
    pub policy: OvercapacityPolicy,
    /// How long a request may wait for a slot. `None` waits indefinitely.
    pub queue_timeout: Option<Duration>,
}

impl GateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let defaults = ServerConfig::default();
        let server = ServerConfig {
            host: get(HOST_VAR).unwrap_or(defaults.host),
            port: parse_number(PORT_VAR, get(PORT_VAR))?.unwrap_or(defaults.port),
        };

        let raw_url = get(BACKEND_URL_VAR).unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let backend_url = Url::parse(&raw_url)
            .map_err(|source| ConfigError::InvalidBackendUrl { value: raw_url, source })?;

        let capacity = parse_number(MAX_CONCURRENT_VAR, get(MAX_CONCURRENT_VAR))?
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        if capacity > SlotPool::MAX_CAPACITY {
            return Err(ConfigError::CapacityTooLarge {
                requested: capacity,
                limit: SlotPool::MAX_CAPACITY,
            });
        }
        let max_concurrent_requests =
            NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroCapacity)?;

        let kind = match get(POLICY_VAR) {
            Some(raw) => PolicyKind::from_str(&raw)?,
            None => PolicyKind::default(),
        };
        let policy = match kind {
            PolicyKind::Hold => OvercapacityPolicy::Hold,
            PolicyKind::Reject => {
                let max_allowed = parse_number(MAX_ALLOWED_VAR, get(MAX_ALLOWED_VAR))?
                    .unwrap_or(DEFAULT_MAX_ALLOWED);
                if max_allowed < capacity {
                    return Err(ConfigError::ThresholdBelowCapacity {
                        max_allowed,
                        capacity,
                    });
                }
                OvercapacityPolicy::Reject { max_allowed }
            }
        };

        let queue_timeout = parse_number::<u64>(QUEUE_TIMEOUT_VAR, get(QUEUE_TIMEOUT_VAR))?
            .map(Duration::from_millis);

        Ok(Self {
            server,
            backend_url,
            max_concurrent_requests,
            policy,
            queue_timeout,
        })
    }
}

fn parse_number<T: FromStr>(
    var: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { var, value: raw })
        })
        .transpose()
}
