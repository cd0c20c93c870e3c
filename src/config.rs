//! Controller configuration
//!
//! Values come from defaults, then the process environment, then command-line
//! overrides applied by the binary. Environment access goes through
//! [`EnvSource`] so tests never touch global state.

use std::time::Duration;

use crate::queue::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::{Error, Result, CONTROLLER_NAME};

/// Environment variable holding the worker count
pub const ENV_MAX_CONCURRENT_RECONCILES: &str = "MAX_CONCURRENT_RECONCILES";

/// Environment variable holding an optional label selector for import secrets
pub const ENV_IMPORT_SECRET_SELECTOR: &str = "IMPORT_SECRET_LABEL_SELECTOR";

/// Environment variable holding the pod name, reported as the event instance
pub const ENV_POD_NAME: &str = "POD_NAME";

/// Default worker count
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 10;

/// Default server-side watch timeout
///
/// Must stay below the client read timeout or idle watches get cut off
/// client-side and surface as errors.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(25);

/// Longest watch timeout accepted by the API server client
pub const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Default time in-flight reconciles get to finish on shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Read access to environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `name`, `None` when unset
    fn var(&self, name: &str) -> Option<String>;
}

/// [`EnvSource`] backed by the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Runtime settings of the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Name used in logs and as the event reporter
    pub name: String,
    /// Number of reconcile workers
    pub max_concurrent_reconciles: usize,
    /// Retry delays for failed reconciles
    pub backoff: BackoffPolicy,
    /// Server-side timeout of each watch request
    pub watch_timeout: Duration,
    /// Grace period for in-flight reconciles on shutdown
    pub drain_timeout: Duration,
    /// Label selector narrowing the import secret watch
    pub import_secret_selector: Option<String>,
    /// Replica identity attached to published events
    pub pod_name: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: CONTROLLER_NAME.to_string(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            backoff: BackoffPolicy::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY),
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            import_secret_selector: None,
            pod_name: None,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by the environment
    ///
    /// Unset or empty variables keep their default; set but unparsable ones
    /// are an error.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = non_empty(env.var(ENV_MAX_CONCURRENT_RECONCILES)) {
            config.max_concurrent_reconciles = raw.trim().parse().map_err(|e| {
                Error::validation(
                    ENV_MAX_CONCURRENT_RECONCILES,
                    format!("'{}' is not a number: {}", raw, e),
                )
            })?;
        }
        config.import_secret_selector = non_empty(env.var(ENV_IMPORT_SECRET_SELECTOR));
        config.pod_name = non_empty(env.var(ENV_POD_NAME));

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::validation(
                "max_concurrent_reconciles",
                "must be at least 1",
            ));
        }
        if self.backoff.base.is_zero() {
            return Err(Error::validation("backoff.base", "must be greater than zero"));
        }
        if self.watch_timeout.is_zero() || self.watch_timeout > MAX_WATCH_TIMEOUT {
            return Err(Error::validation(
                "watch_timeout",
                format!("must be between 1s and {}s", MAX_WATCH_TIMEOUT.as_secs()),
            ));
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn env_with(max: Option<&'static str>, selector: Option<&'static str>) -> MockEnvSource {
        env_with_pod(max, selector, None)
    }

    fn env_with_pod(
        max: Option<&'static str>,
        selector: Option<&'static str>,
        pod: Option<&'static str>,
    ) -> MockEnvSource {
        let mut env = MockEnvSource::new();
        env.expect_var()
            .with(eq(ENV_POD_NAME))
            .returning(move |_| pod.map(str::to_string));
        env.expect_var()
            .with(eq(ENV_MAX_CONCURRENT_RECONCILES))
            .returning(move |_| max.map(str::to_string));
        env.expect_var()
            .with(eq(ENV_IMPORT_SECRET_SELECTOR))
            .returning(move |_| selector.map(str::to_string));
        env
    }

    #[test]
    fn defaults_match_controller_runtime_conventions() {
        let config = ControllerConfig::default();
        assert_eq!(config.name, "importconfig-controller");
        assert_eq!(config.max_concurrent_reconciles, 10);
        assert_eq!(config.backoff.base, Duration::from_millis(5));
        assert_eq!(config.backoff.max, Duration::from_secs(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unset_env_keeps_defaults() {
        let config = ControllerConfig::from_env(&env_with(None, None)).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn env_overrides_worker_count_and_selector() {
        let env = env_with(Some(" 4 "), Some("cluster.open-cluster-management.io/import=true"));
        let config = ControllerConfig::from_env(&env).unwrap();
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(
            config.import_secret_selector.as_deref(),
            Some("cluster.open-cluster-management.io/import=true")
        );
    }

    #[test]
    fn pod_name_is_read_through_env_source() {
        let env = env_with_pod(None, None, Some("importconfig-controller-7d9f-x2k4q"));
        let config = ControllerConfig::from_env(&env).unwrap();
        assert_eq!(config.pod_name.as_deref(), Some("importconfig-controller-7d9f-x2k4q"));
        assert!(ControllerConfig::default().pod_name.is_none());
    }

    #[test]
    fn empty_env_value_is_treated_as_unset() {
        let config = ControllerConfig::from_env(&env_with(Some(""), Some("  "))).unwrap();
        assert_eq!(config.max_concurrent_reconciles, DEFAULT_MAX_CONCURRENT_RECONCILES);
        assert!(config.import_secret_selector.is_none());
    }

    #[test]
    fn garbage_worker_count_is_rejected() {
        let err = ControllerConfig::from_env(&env_with(Some("many"), None)).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains(ENV_MAX_CONCURRENT_RECONCILES));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = ControllerConfig::from_env(&env_with(Some("0"), None)).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn watch_timeout_must_stay_below_client_timeout() {
        let config = ControllerConfig {
            watch_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            watch_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_backoff_base_is_rejected() {
        let config = ControllerConfig {
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
