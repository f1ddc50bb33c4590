//! Runtime configuration.
//!
//! A [`RuntimeConfig`] can be built in code, deserialized from any serde format, or read
//! from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `TANDEM_THREADS` | `thread_pool_size` |
//! | `TANDEM_PROCESSES` | `process_pool_size` |
//! | `TANDEM_WORKER_PATH` | `worker_program` |

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable overriding the thread pool size.
pub const THREADS_ENV: &str = "TANDEM_THREADS";
/// Environment variable overriding the number of worker processes.
pub const PROCESSES_ENV: &str = "TANDEM_PROCESSES";
/// Environment variable naming the program to launch as a worker process.
pub const WORKER_PATH_ENV: &str = "TANDEM_WORKER_PATH";

/// Configuration of a [`crate::Runtime`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads. `None` uses rayon's default (one per core).
    pub thread_pool_size: Option<usize>,
    /// Maximum number of worker processes. `None` uses the available parallelism.
    pub process_pool_size: Option<usize>,
    /// Program launched as a worker process. `None` re-launches the current executable.
    pub worker_program: Option<PathBuf>,
    /// Name of the loop thread.
    pub loop_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: None,
            process_pool_size: None,
            worker_program: None,
            loop_thread_name: "tandem-loop".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from `TANDEM_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are a configuration error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(THREADS_ENV) {
            config.thread_pool_size = Some(parse_size(THREADS_ENV, &value)?);
        }
        if let Some(value) = lookup(PROCESSES_ENV) {
            config.process_pool_size = Some(parse_size(PROCESSES_ENV, &value)?);
        }
        if let Some(value) = lookup(WORKER_PATH_ENV).filter(|value| !value.is_empty()) {
            config.worker_program = Some(PathBuf::from(value));
        }
        Ok(config)
    }

    /// Set the number of worker threads.
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = Some(size);
        self
    }

    /// Set the maximum number of worker processes.
    pub fn with_process_pool_size(mut self, size: usize) -> Self {
        self.process_pool_size = Some(size);
        self
    }

    /// Set the program launched as a worker process.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Set the name of the loop thread.
    pub fn with_loop_thread_name(mut self, name: impl Into<String>) -> Self {
        self.loop_thread_name = name.into();
        self
    }

    /// Effective maximum number of worker processes.
    pub(crate) fn effective_process_pool_size(&self) -> usize {
        self.process_pool_size
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(Error::Configuration(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
        Ok(size) => Ok(size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_defaults_without_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.thread_pool_size, None);
        assert_eq!(config.process_pool_size, None);
        assert_eq!(config.worker_program, None);
        assert_eq!(config.loop_thread_name, "tandem-loop");
        assert!(config.effective_process_pool_size() >= 1);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (THREADS_ENV, "3"),
            (PROCESSES_ENV, " 2 "),
            (WORKER_PATH_ENV, "/opt/bin/worker"),
        ]))
        .unwrap();
        assert_eq!(config.thread_pool_size, Some(3));
        assert_eq!(config.effective_process_pool_size(), 2);
        assert_eq!(config.worker_program, Some(PathBuf::from("/opt/bin/worker")));
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let err = RuntimeConfig::from_lookup(lookup(&[(THREADS_ENV, "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = RuntimeConfig::from_lookup(lookup(&[(PROCESSES_ENV, "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "process_pool_size": 4 }"#).unwrap();
        assert_eq!(config.process_pool_size, Some(4));
        assert_eq!(config.loop_thread_name, "tandem-loop");
    }
}
