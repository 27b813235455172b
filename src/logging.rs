//! Diagnostic output.
//!
//! All components log through `tracing`: `trace!` for per-function decisions, `debug!` for
//! hook lifecycle and `warn!` for callback failures that were swallowed to keep the host
//! running. Embedders with their own subscriber need nothing from this module;
//! [`init`] installs a stderr subscriber for those without one.

use std::{io::IsTerminal, sync::OnceLock};

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ENV_LOG;

static INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Installs a stderr subscriber filtered by `level`, unless `JITSCOPE_LOG` is set.
///
/// Only the first call has an effect. Returns `false` if another global subscriber was
/// already installed by someone else.
pub fn init(level: Option<&str>) -> bool {
    *INITIALIZED.get_or_init(|| {
        let directive = level.unwrap_or("warn");
        let filter = EnvFilter::try_from_env(ENV_LOG)
            .or_else(|_| EnvFilter::try_new(directive))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        let subscriber = fmt::fmt()
            .with_env_filter(filter)
            .with_ansi(std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    })
}
