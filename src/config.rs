use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service settings, read from `SEATWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Optional JSON seed for the in-memory directory.
    pub directory_file: Option<PathBuf>,
    pub compact_threshold: u64,
    pub expire_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            directory_file: None,
            compact_threshold: 1000,
            expire_interval: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(900),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("SEATWISE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parse_or(&lookup, "SEATWISE_METRICS_PORT", None, Some),
            directory_file: lookup("SEATWISE_DIRECTORY_FILE").map(PathBuf::from),
            compact_threshold: parse_or(
                &lookup,
                "SEATWISE_COMPACT_THRESHOLD",
                defaults.compact_threshold,
                std::convert::identity,
            ),
            expire_interval: parse_or(
                &lookup,
                "SEATWISE_EXPIRE_INTERVAL_SECS",
                defaults.expire_interval,
                Duration::from_secs,
            ),
            reconcile_interval: parse_or(
                &lookup,
                "SEATWISE_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
                Duration::from_secs,
            ),
        }
    }
}

fn parse_or<V: FromStr, T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    wrap: impl Fn(V) -> T,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<V>() {
        Ok(v) => wrap(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key}={raw:?}, using default");
            default
        }
    }
}
