//! Fail-fast handling for socket errors.
//!
//! A load generator treats any faulted connection as a fault in the system
//! under test: the whole process stops rather than carrying on with skewed
//! numbers. Every fatal path in the engine goes through [`FailFast::fatal`],
//! which is the single place a supervising derivative would swap in
//! per-connection recovery.

use crate::error::ConnectError;
use std::sync::Arc;
use tracing::error;

type FatalHook = dyn Fn(&ConnectError) + Send + Sync;

#[derive(Clone)]
pub struct FailFast {
    hook: Arc<FatalHook>,
}

impl FailFast {
    /// Logs the error and exits the process with status 1.
    pub fn exit_process() -> Self {
        Self {
            hook: Arc::new(|err| {
                error!(error = %err, "Fatal socket error, terminating process");
                std::process::exit(1);
            }),
        }
    }

    /// Routes fatal errors to `hook` instead of exiting. The engine stops the
    /// affected task after calling it.
    pub fn with_hook<F>(hook: F) -> Self
    where
        F: Fn(&ConnectError) + Send + Sync + 'static,
    {
        Self {
            hook: Arc::new(hook),
        }
    }

    pub fn fatal(&self, err: ConnectError) {
        (self.hook)(&err);
    }
}

impl Default for FailFast {
    fn default() -> Self {
        Self::exit_process()
    }
}

impl std::fmt::Debug for FailFast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FailFast")
    }
}
