use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;
use crate::Result;

const ENV_RECORDFLOW_WORKERS: &str = "RECORDFLOW_WORKERS";
const ENV_RECORDFLOW_ERROR_POLICY: &str = "RECORDFLOW_ERROR_POLICY";
const ENV_RECORDFLOW_CHANNEL_SIZE: &str = "RECORDFLOW_CHANNEL_SIZE";
const ENV_RECORDFLOW_SORT_BUFFER_SIZE: &str = "RECORDFLOW_SORT_BUFFER_SIZE";
const ENV_RECORDFLOW_MAX_CLUSTERS: &str = "RECORDFLOW_MAX_CLUSTERS";
const ENV_RECORDFLOW_WRITER_TTL_MS: &str = "RECORDFLOW_WRITER_TTL_MS";
const ENV_RECORDFLOW_WRITER_MAX_ENTRIES: &str = "RECORDFLOW_WRITER_MAX_ENTRIES";

/// ErrorPolicy decides what happens to a record whose transform failed, and to the records after it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ErrorPolicy {
    /// Emit the failed record with its error and keep going.
    #[default]
    Ignore,
    /// Emit the failed record with its error, then cancel the whole run.
    Abort,
    /// Silently discard the failed record and keep going.
    Drop,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Ignore => write!(f, "ignore"),
            ErrorPolicy::Abort => write!(f, "abort"),
            ErrorPolicy::Drop => write!(f, "drop"),
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ignore" => Ok(ErrorPolicy::Ignore),
            "abort" => Ok(ErrorPolicy::Abort),
            "drop" => Ok(ErrorPolicy::Drop),
            other => Err(Error::Config(format!("unknown error policy: {other}"))),
        }
    }
}

pub mod pipeline {
    use super::ErrorPolicy;

    const DEFAULT_WORKERS: usize = 4;
    const DEFAULT_CHANNEL_SIZE: usize = 64;

    #[derive(Debug, Clone, PartialEq)]
    pub struct PipelineConfig {
        /// number of transforms allowed to run concurrently per stage.
        pub workers: usize,
        pub error_policy: ErrorPolicy,
        /// capacity of the ingestion and output channels of every stage.
        pub channel_size: usize,
    }

    impl Default for PipelineConfig {
        fn default() -> Self {
            Self {
                workers: DEFAULT_WORKERS,
                error_policy: ErrorPolicy::default(),
                channel_size: DEFAULT_CHANNEL_SIZE,
            }
        }
    }

    impl PipelineConfig {
        pub fn new(workers: usize, error_policy: ErrorPolicy) -> Self {
            Self {
                workers,
                error_policy,
                ..Default::default()
            }
        }
    }
}

pub mod sorter {
    /// Upper bound of sort buckets kept per partition. Records that fit none of them are forced
    /// into the last one; emitted clusters stay sorted either way.
    pub const DEFAULT_MAX_CLUSTERS: usize = 6;
    const DEFAULT_BUFFER_SIZE: usize = 1000;

    #[derive(Debug, Clone, PartialEq)]
    pub struct SortConfig {
        /// records held per cluster (or by the flat buffer) before anything is emitted.
        pub buffer_size: usize,
        pub max_clusters: usize,
    }

    impl Default for SortConfig {
        fn default() -> Self {
            Self {
                buffer_size: DEFAULT_BUFFER_SIZE,
                max_clusters: DEFAULT_MAX_CLUSTERS,
            }
        }
    }

    impl SortConfig {
        pub fn new(buffer_size: usize) -> Self {
            Self {
                buffer_size,
                ..Default::default()
            }
        }
    }
}

pub mod writercache {
    use std::time::Duration;

    const DEFAULT_TTL: Duration = Duration::from_secs(60);
    const DEFAULT_MAX_ENTRIES: usize = 128;
    const DEFAULT_MAX_WRITE_ATTEMPTS: usize = 3;

    #[derive(Debug, Clone, PartialEq)]
    pub struct WriterCacheConfig {
        /// idle time after which a writer is closed and evicted. Zero disables idle expiry.
        pub ttl: Duration,
        /// maximum number of live writers. Zero means unbounded.
        pub max_entries: usize,
        /// how many times a write racing against a closing writer is retried on a fresh one.
        pub max_write_attempts: usize,
    }

    impl Default for WriterCacheConfig {
        fn default() -> Self {
            Self {
                ttl: DEFAULT_TTL,
                max_entries: DEFAULT_MAX_ENTRIES,
                max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            }
        }
    }

    impl WriterCacheConfig {
        pub fn new(ttl: Duration, max_entries: usize) -> Self {
            Self {
                ttl,
                max_entries,
                ..Default::default()
            }
        }
    }
}

use pipeline::PipelineConfig;
use sorter::SortConfig;
use writercache::WriterCacheConfig;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub sort: SortConfig,
    pub writer_cache: WriterCacheConfig,
}

impl Settings {
    /// Loads the settings from the process environment.
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        vars.try_into()
    }
}

fn parse_env<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Debug,
{
    env_vars
        .get(key)
        .map(|val| {
            val.parse::<T>()
                .map_err(|e| Error::Config(format!("Parsing {key}(set to '{val}'): {e:?}")))
        })
        .transpose()
}

/// This implementation is to load settings from env variables
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let mut settings = Settings::default();

        if let Some(workers) = parse_env::<usize>(&env_vars, ENV_RECORDFLOW_WORKERS)? {
            settings.pipeline.workers = workers;
        }

        if let Some(policy) = env_vars.get(ENV_RECORDFLOW_ERROR_POLICY) {
            settings.pipeline.error_policy = policy.parse()?;
        }

        if let Some(channel_size) = parse_env::<usize>(&env_vars, ENV_RECORDFLOW_CHANNEL_SIZE)? {
            settings.pipeline.channel_size = channel_size;
        }

        if let Some(buffer_size) = parse_env::<usize>(&env_vars, ENV_RECORDFLOW_SORT_BUFFER_SIZE)?
        {
            settings.sort.buffer_size = buffer_size;
        }

        if let Some(max_clusters) = parse_env::<usize>(&env_vars, ENV_RECORDFLOW_MAX_CLUSTERS)? {
            settings.sort.max_clusters = max_clusters;
        }

        if let Some(ttl_ms) = parse_env::<u64>(&env_vars, ENV_RECORDFLOW_WRITER_TTL_MS)? {
            settings.writer_cache.ttl = Duration::from_millis(ttl_ms);
        }

        if let Some(max_entries) =
            parse_env::<usize>(&env_vars, ENV_RECORDFLOW_WRITER_MAX_ENTRIES)?
        {
            settings.writer_cache.max_entries = max_entries;
        }

        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(Error::Config(format!(
                "{ENV_RECORDFLOW_WORKERS} must be at least 1"
            )));
        }
        if self.pipeline.channel_size == 0 {
            return Err(Error::Config(format!(
                "{ENV_RECORDFLOW_CHANNEL_SIZE} must be at least 1"
            )));
        }
        if self.sort.max_clusters == 0 {
            return Err(Error::Config(format!(
                "{ENV_RECORDFLOW_MAX_CLUSTERS} must be at least 1"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_settings_defaults_without_env() {
        let settings: Settings = HashMap::new().try_into().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.sort.max_clusters, sorter::DEFAULT_MAX_CLUSTERS);
        assert_eq!(settings.pipeline.error_policy, ErrorPolicy::Ignore);
    }

    #[test]
    fn test_settings_from_env() {
        let settings: Settings = env(&[
            (ENV_RECORDFLOW_WORKERS, "16"),
            (ENV_RECORDFLOW_ERROR_POLICY, "Abort"),
            (ENV_RECORDFLOW_SORT_BUFFER_SIZE, "50"),
            (ENV_RECORDFLOW_MAX_CLUSTERS, "3"),
            (ENV_RECORDFLOW_WRITER_TTL_MS, "1500"),
            (ENV_RECORDFLOW_WRITER_MAX_ENTRIES, "8"),
        ])
        .try_into()
        .unwrap();

        assert_eq!(settings.pipeline.workers, 16);
        assert_eq!(settings.pipeline.error_policy, ErrorPolicy::Abort);
        assert_eq!(settings.sort.buffer_size, 50);
        assert_eq!(settings.sort.max_clusters, 3);
        assert_eq!(settings.writer_cache.ttl, Duration::from_millis(1500));
        assert_eq!(settings.writer_cache.max_entries, 8);
    }

    #[test]
    fn test_settings_rejects_bad_values() {
        let res: Result<Settings> = env(&[(ENV_RECORDFLOW_WORKERS, "many")]).try_into();
        assert!(matches!(res, Err(Error::Config(_))));

        let res: Result<Settings> = env(&[(ENV_RECORDFLOW_WORKERS, "0")]).try_into();
        assert!(matches!(res, Err(Error::Config(_))));

        let res: Result<Settings> = env(&[(ENV_RECORDFLOW_ERROR_POLICY, "retry")]).try_into();
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_error_policy_display_round_trips() {
        for policy in [ErrorPolicy::Ignore, ErrorPolicy::Abort, ErrorPolicy::Drop] {
            assert_eq!(policy.to_string().parse::<ErrorPolicy>().unwrap(), policy);
        }
    }
}
