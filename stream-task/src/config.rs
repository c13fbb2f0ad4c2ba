use envconfig::Envconfig;

/// Runtime configuration for a `StreamTask`, loaded once at task-pool startup and cloned into
/// each task (spec §6, §3). Mirrors `hook-worker::config::Config`'s envconfig-derived shape,
/// including the millisecond-duration newtype for durations supplied as env vars.
#[derive(Envconfig, Clone, Debug)]
pub struct TaskConfig {
    /// Pause threshold (strict `>`) and resume threshold (equality) for per-partition buffering.
    #[envconfig(from = "BUFFERED_RECORDS_PER_PARTITION", default = "1000")]
    pub buffered_records_per_partition: usize,

    /// Cadence at which the owning thread sets `commit_requested`, honored at the next record
    /// boundary inside `process` (spec §4.7 `needs_commit`).
    #[envconfig(from = "COMMIT_INTERVAL_MS", default = "30000")]
    pub commit_interval_ms: EnvMsDuration,

    /// Number of owning threads in the surrounding task pool. Not consulted by the core itself;
    /// recorded here because the pool reads it from the same config struct (spec §6).
    #[envconfig(from = "NUM_STREAM_THREADS", default = "1")]
    pub num_stream_threads: usize,

    /// Deadline a task's liveness handle is allowed to go unreported before the owning
    /// `HealthRegistry` considers it stalled.
    #[envconfig(from = "TASK_LIVENESS_DEADLINE_MS", default = "60000")]
    pub liveness_deadline_ms: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub std::time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::str::FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(std::time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_env_vars() {
        // envconfig reads process env, which we don't want to touch in a unit test; this just
        // exercises the EnvMsDuration parser the derive macro relies on for the default strings.
        let parsed: EnvMsDuration = "30000".parse().unwrap();
        assert_eq!(parsed.0, std::time::Duration::from_millis(30000));
    }

    #[test]
    fn rejects_non_numeric_duration() {
        assert!("not-a-number".parse::<EnvMsDuration>().is_err());
    }
}
