//! Bind state machine types and the handshake seam.
//! What "bind" means on the wire belongs to the handshake implementation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StackConfig;

/// Device binding state. One per controller handle.
///
/// Uninitialized → Initializing (init) → WaitingForBind (start) → Bound | Failed.
/// Bound is terminal success; Failed is terminal until re-init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindState {
    Uninitialized,
    Initializing,
    WaitingForBind,
    Bound,
    Failed,
}

impl BindState {
    /// Bound or Failed: nothing left to wait for.
    pub fn is_settled(self) -> bool {
        matches!(self, BindState::Bound | BindState::Failed)
    }
}

impl fmt::Display for BindState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindState::Uninitialized => "uninitialized",
            BindState::Initializing => "initializing",
            BindState::WaitingForBind => "waiting_for_bind",
            BindState::Bound => "bound",
            BindState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identity the device was bound with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindInfo {
    pub device_id: String,
    pub owner_id: Option<String>,
    pub bound_at: DateTime<Utc>,
}

impl BindInfo {
    pub fn new(device_id: impl Into<String>, owner_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            owner_id,
            bound_at: Utc::now(),
        }
    }
}

/// Registration with the binding authority, performed over the network stack.
pub trait BindHandshake: Send + Sync {
    /// One attempt. `Ok(Some(_))` when bound, `Ok(None)` when the authority has not
    /// activated this device yet. May block; it runs on a worker thread.
    fn bind(&self, config: &StackConfig) -> Result<Option<BindInfo>, BindError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),
    #[error("bind rejected: {0}")]
    Rejected(String),
    #[error("bind timed out after {0:?}")]
    Timeout(Duration),
    #[error("network stack unavailable: {0}")]
    Stack(String),
    #[error("bind worker stopped: {0}")]
    Worker(String),
}

impl BindError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BindError::Unreachable(_))
    }
}

/// How the bind worker polls the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPolicy {
    /// Delay between pending attempts; also the base for error backoff.
    pub poll_interval: Duration,
    /// Consecutive retryable errors tolerated before giving up.
    pub max_failures: u32,
    /// Overall limit for the handshake. `None` waits until the authority answers.
    pub timeout: Option<Duration>,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_failures: 10,
            timeout: None,
        }
    }
}

impl BindPolicy {
    /// Delay after `failures` consecutive errors: doubles per failure, capped at 16x.
    pub fn error_backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(4);
        self.poll_interval.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_states() {
        assert!(BindState::Bound.is_settled());
        assert!(BindState::Failed.is_settled());
        assert!(!BindState::WaitingForBind.is_settled());
        assert!(!BindState::Uninitialized.is_settled());
        assert_eq!(BindState::WaitingForBind.to_string(), "waiting_for_bind");
    }

    #[test]
    fn only_unreachable_is_retryable() {
        assert!(BindError::Unreachable("sn down".into()).is_retryable());
        assert!(!BindError::Rejected("bad sign".into()).is_retryable());
        assert!(!BindError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn error_backoff_caps() {
        let policy = BindPolicy {
            poll_interval: Duration::from_millis(10),
            ..BindPolicy::default()
        };
        assert_eq!(policy.error_backoff(1), Duration::from_millis(10));
        assert_eq!(policy.error_backoff(2), Duration::from_millis(20));
        assert_eq!(policy.error_backoff(30), Duration::from_millis(160));
    }
}
