//! Engine configuration
//!
//! Every option has a default that works for an embedder which only registers resolvers.
//! Options can be set in code through the builder methods or read from `JITSCOPE_*`
//! environment variables with [`EngineConfig::from_env`].

use std::{str::FromStr, time::Duration};

use crate::{
    host::{HostLayout, HostVersion},
    Error, Result,
};

/// Number of interceptor worker threads
pub const ENV_INTERCEPTOR_THREADS: &str = "JITSCOPE_INTERCEPTOR_THREADS";
/// Default wait for compiled code, in milliseconds
pub const ENV_WAIT_TIMEOUT_MS: &str = "JITSCOPE_WAIT_TIMEOUT_MS";
/// `true`/`false`, removal of caller-identity checks from shims
pub const ENV_PATCH_NATIVE: &str = "JITSCOPE_PATCH_NATIVE";
/// Forced host version, e.g. `8.0.4`
pub const ENV_HOST_VERSION: &str = "JITSCOPE_HOST_VERSION";
/// Log filter, also honored by [`crate::logging::init`]
pub const ENV_LOG: &str = "JITSCOPE_LOG";

/// Configuration of an [`crate::Engine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads of the runtime that runs call interceptors (default: 2)
    pub interceptor_threads: usize,

    /// Wait used by [`crate::Engine::wait_for_compiled`] when the caller passes none
    /// (default: 5 seconds)
    pub wait_timeout: Duration,

    /// Remove caller-identity checks from compiled shims (default: true)
    /// Only has an effect on x86-64 and for functions the host reports check targets for
    pub patch_native_checks: bool,

    /// Host version to assume instead of asking the host
    pub host_version: Option<HostVersion>,

    /// Structure layout to use instead of the built-in table entry for the version
    pub layout: Option<HostLayout>,

    /// Log filter for [`crate::logging::init`], e.g. `debug` or `jitscope::compile=trace`
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interceptor_threads: 2,
            wait_timeout: Duration::from_secs(5),
            patch_native_checks: true,
            host_version: None,
            layout: None,
            log_level: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever `JITSCOPE_*` variables are set.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidConfiguration`] for a variable that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by the values `lookup` returns for the `JITSCOPE_*` names.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidConfiguration`] for a value that does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_INTERCEPTOR_THREADS) {
            config.interceptor_threads = parse(ENV_INTERCEPTOR_THREADS, &value)?;
        }
        if let Some(value) = lookup(ENV_WAIT_TIMEOUT_MS) {
            config.wait_timeout = Duration::from_millis(parse(ENV_WAIT_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_PATCH_NATIVE) {
            config.patch_native_checks = parse_flag(ENV_PATCH_NATIVE, &value)?;
        }
        if let Some(value) = lookup(ENV_HOST_VERSION) {
            config.host_version = Some(
                value
                    .parse::<HostVersion>()
                    .map_err(|_| invalid(ENV_HOST_VERSION, &value))?,
            );
        }
        config.log_level = lookup(ENV_LOG).filter(|value| !value.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Sets the number of interceptor worker threads.
    #[must_use]
    pub fn with_interceptor_threads(mut self, threads: usize) -> Self {
        self.interceptor_threads = threads;
        self
    }

    /// Sets the default wait for compiled code.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Enables or disables native check removal.
    #[must_use]
    pub fn with_native_patching(mut self, enabled: bool) -> Self {
        self.patch_native_checks = enabled;
        self
    }

    /// Forces the host version.
    #[must_use]
    pub fn with_host_version(mut self, version: HostVersion) -> Self {
        self.host_version = Some(version);
        self
    }

    /// Forces the structure layout.
    #[must_use]
    pub fn with_layout(mut self, layout: HostLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Sets the log filter.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidConfiguration`] for zero worker threads or a zero wait.
    pub fn validate(&self) -> Result<()> {
        if self.interceptor_threads == 0 {
            return Err(Error::InvalidConfiguration(
                "interceptor_threads must be at least 1".to_string(),
            ));
        }
        if self.wait_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "wait_timeout must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidConfiguration(format!("{name}={value:?}"))
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}
