//! Controller configuration
//!
//! Every knob is a CLI flag with an environment fallback so the same binary can
//! be configured from a Deployment manifest or a terminal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::backoff::{FailureBackoff, RetryConfig};
use crate::Error;

/// Settings for the MemberGroup controller
#[derive(Args, Clone, Debug)]
pub struct ControllerConfig {
    /// Requeue interval after a pass that converged (seconds)
    #[arg(long, env = "REGENT_RESYNC_SECONDS", default_value_t = 300)]
    pub resync_seconds: u64,

    /// Requeue interval after a pass that is waiting on a precondition (seconds)
    #[arg(long, env = "REGENT_WAIT_SECONDS", default_value_t = 5)]
    pub wait_seconds: u64,

    /// Requeue interval after a pass that took an action needing follow-up (seconds)
    #[arg(long, env = "REGENT_RETRY_SECONDS", default_value_t = 2)]
    pub retry_seconds: u64,

    /// Deadline for a whole reconciliation pass (seconds)
    #[arg(long, env = "REGENT_PASS_DEADLINE_SECONDS", default_value_t = 60)]
    pub pass_deadline_seconds: u64,

    /// Timeout for a single member control-plane request (seconds)
    #[arg(long, env = "REGENT_CONTROL_PLANE_TIMEOUT_SECONDS", default_value_t = 5)]
    pub control_plane_timeout_seconds: u64,

    /// How long a health snapshot may be served from cache (seconds)
    #[arg(long, env = "REGENT_SNAPSHOT_TTL_SECONDS", default_value_t = 10)]
    pub snapshot_ttl_seconds: u64,

    /// PEM bundle used to verify member certificates when cluster TLS is enabled
    #[arg(long, env = "REGENT_CA_BUNDLE")]
    pub ca_bundle: Option<PathBuf>,

    /// Pod mutation is delegated to an admission webhook; only move the partition
    #[arg(long, env = "REGENT_POD_WEBHOOK", default_value_t = false)]
    pub pod_webhook: bool,

    /// Field manager used for server-side apply
    #[arg(long, env = "REGENT_FIELD_MANAGER", default_value = crate::FIELD_MANAGER)]
    pub field_manager: String,

    /// First requeue delay after a failed pass (seconds)
    #[arg(long, env = "REGENT_BACKOFF_BASE_SECONDS", default_value_t = 5)]
    pub backoff_base_seconds: u64,

    /// Largest requeue delay after repeated failed passes (seconds)
    #[arg(long, env = "REGENT_BACKOFF_MAX_SECONDS", default_value_t = 300)]
    pub backoff_max_seconds: u64,

    /// Only watch MemberGroups in this namespace
    #[arg(long, env = "REGENT_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_seconds: 300,
            wait_seconds: 5,
            retry_seconds: 2,
            pass_deadline_seconds: 60,
            control_plane_timeout_seconds: 5,
            snapshot_ttl_seconds: 10,
            ca_bundle: None,
            pod_webhook: false,
            field_manager: crate::FIELD_MANAGER.to_string(),
            backoff_base_seconds: 5,
            backoff_max_seconds: 300,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("resync-seconds", self.resync_seconds),
            ("wait-seconds", self.wait_seconds),
            ("retry-seconds", self.retry_seconds),
            ("pass-deadline-seconds", self.pass_deadline_seconds),
            ("control-plane-timeout-seconds", self.control_plane_timeout_seconds),
            ("backoff-base-seconds", self.backoff_base_seconds),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        if self.backoff_max_seconds < self.backoff_base_seconds {
            return Err(Error::config(
                "backoff-max-seconds must not be smaller than backoff-base-seconds",
            ));
        }
        if self.control_plane_timeout_seconds >= self.pass_deadline_seconds {
            return Err(Error::config(
                "control-plane-timeout-seconds must be shorter than the pass deadline",
            ));
        }
        if self.field_manager.trim().is_empty() {
            return Err(Error::config("field-manager must not be empty"));
        }
        Ok(())
    }

    /// Requeue interval after a converged pass
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    /// Requeue interval after a `Wait`
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    /// Requeue interval after a `Retry`
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_seconds)
    }

    /// Deadline for one pass
    pub fn pass_deadline(&self) -> Duration {
        Duration::from_secs(self.pass_deadline_seconds)
    }

    /// Per-request control-plane timeout
    pub fn control_plane_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane_timeout_seconds)
    }

    /// Snapshot cache TTL
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_seconds)
    }

    /// Retry policy for control-plane reads; stays well inside one request timeout budget
    pub fn control_plane_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(3)
    }

    /// Failure backoff tracker sized from this config
    pub fn failure_backoff(&self) -> FailureBackoff {
        FailureBackoff::new(
            Duration::from_secs(self.backoff_base_seconds),
            Duration::from_secs(self.backoff_max_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ControllerConfig,
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::parse_from([
            "regent",
            "--wait-seconds",
            "9",
            "--pod-webhook",
            "--watch-namespace",
            "tidb",
        ]);
        assert_eq!(cli.config.wait_interval(), Duration::from_secs(9));
        assert!(cli.config.pod_webhook);
        assert_eq!(cli.config.watch_namespace.as_deref(), Some("tidb"));
        assert_eq!(cli.config.field_manager, crate::FIELD_MANAGER);
    }

    #[test]
    fn validation_rejects_inconsistent_settings() {
        let mut config = ControllerConfig::default();
        config.retry_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.backoff_max_seconds = 1;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.control_plane_timeout_seconds = config.pass_deadline_seconds;
        assert!(config.validate().is_err());
    }
}
