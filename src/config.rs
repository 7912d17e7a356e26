//! Server configuration: a TOML file of `key = value` pairs with `#`
//! comments. Sizes accept `k`/`m`/`g` suffixes. All keys are optional and
//! default as documented below.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use hoardd_wire::memcache::Verbosity;

pub const DEFAULT_MEMCACHE_PORT: u16 = 11211;
pub const DEFAULT_REPL_PORT: u16 = 11213;
pub const DEFAULT_COUNTER_PORT: u16 = 11215;
pub const DEFAULT_BUCKETS: u32 = 1_000_000;
pub const DEFAULT_COUNTER_BUCKETS: u32 = 10_000;
pub const DEFAULT_MAX_DATA_SIZE: usize = 1 << 20;
pub const DEFAULT_HEAP_DATA_LIMIT: usize = 256 << 10;
pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;
pub const DEFAULT_REPL_BUFFER_MB: usize = 30;
pub const DEFAULT_WORKERS: u32 = 8;
pub const DEFAULT_GC_INTERVAL: u64 = 10;
pub const DEFAULT_SLAVE_TIMEOUT: i64 = 10;
pub const DEFAULT_STAT_INTERVAL: u64 = 86_400;
pub const DEFAULT_TEMP_DIR: &str = "/var/tmp";
pub const MAX_WORKERS: u32 = 64;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("cannot read {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("{what} must be > 0"))]
    MustBePositive { what: &'static str },

    #[snafu(display("workers must be <= {MAX_WORKERS}"))]
    TooManyWorkers,

    #[snafu(display("too small heap_data_limit"))]
    HeapLimitTooSmall,

    #[snafu(display("not a directory: {}", path.display()))]
    NotADirectory { path: PathBuf },

    #[snafu(display("invalid log file: {}", path.display()))]
    BadLogFile { path: PathBuf },
}

/// A byte count, optionally written with a `k`/`m`/`g` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub usize);

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl<'de> Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive integer, optionally suffixed with k, m, or g")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                if v < 1 {
                    return Err(E::custom("size must be > 0"));
                }
                Ok(ByteSize(v as usize))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                let v = v.trim();
                let (digits, base) = match v.as_bytes().last() {
                    Some(b'k' | b'K') => (&v[..v.len() - 1], 1usize << 10),
                    Some(b'm' | b'M') => (&v[..v.len() - 1], 1 << 20),
                    Some(b'g' | b'G') => (&v[..v.len() - 1], 1 << 30),
                    _ => (v, 1),
                };
                let n: usize = digits
                    .parse()
                    .map_err(|_| E::custom(format!("bad size: {v}")))?;
                if n < 1 {
                    return Err(E::custom("size must be > 0"));
                }
                Ok(ByteSize(n * base))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

fn deserialize_verbosity<'de, D>(deserializer: D) -> Result<Verbosity, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.as_str() {
        "error" => Ok(Verbosity::Error),
        "warning" => Ok(Verbosity::Warning),
        "info" => Ok(Verbosity::Info),
        "debug" => Ok(Verbosity::Debug),
        other => Err(de::Error::custom(format!("invalid threshold: {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(deserialize_with = "deserialize_verbosity")]
    pub threshold: Verbosity,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            threshold: Verbosity::Info,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub enable: bool,
    pub port: u16,
    pub buckets: u32,
    pub max_connections: u32,
    /// Counter GC runs on boundaries of this many seconds.
    pub stat_interval: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            port: DEFAULT_COUNTER_PORT,
            buckets: DEFAULT_COUNTER_BUCKETS,
            max_connections: 0,
            stat_interval: DEFAULT_STAT_INTERVAL,
        }
    }
}

/// Server configuration; immutable after startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub virtual_ip: IpAddr,
    pub port: u16,
    pub repl_port: u16,
    /// 0 means unlimited.
    pub max_connections: u32,
    pub temp_dir: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
    pub log: LogConfig,
    pub buckets: u32,
    pub max_data_size: ByteSize,
    pub heap_data_limit: ByteSize,
    pub memory_limit: ByteSize,
    /// Extra listen addresses besides the virtual IP.
    pub bind_ip: Vec<IpAddr>,
    /// Outbound replication staging cap, in MiB.
    pub repl_buffer_size: usize,
    /// Seconds without a heartbeat before a replica is dropped.
    pub slave_timeout: i64,
    pub workers: u32,
    pub gc_interval: u64,
    pub counter: CounterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            virtual_ip: IpAddr::from([127, 0, 0, 1]),
            port: DEFAULT_MEMCACHE_PORT,
            repl_port: DEFAULT_REPL_PORT,
            max_connections: 0,
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            user: None,
            group: None,
            log: LogConfig::default(),
            buckets: DEFAULT_BUCKETS,
            max_data_size: ByteSize(DEFAULT_MAX_DATA_SIZE),
            heap_data_limit: ByteSize(DEFAULT_HEAP_DATA_LIMIT),
            memory_limit: ByteSize(DEFAULT_MEMORY_LIMIT),
            bind_ip: Vec::new(),
            repl_buffer_size: DEFAULT_REPL_BUFFER_MB,
            slave_timeout: DEFAULT_SLAVE_TIMEOUT,
            workers: DEFAULT_WORKERS,
            gc_interval: DEFAULT_GC_INTERVAL,
            counter: CounterConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&text).context(ParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        snafu::ensure!(self.buckets >= 1, MustBePositiveSnafu { what: "buckets" });
        if self.buckets < 10_000 {
            tracing::warn!("too small bucket count!");
        }
        snafu::ensure!(
            self.workers >= 1,
            MustBePositiveSnafu { what: "workers" }
        );
        snafu::ensure!(self.workers <= MAX_WORKERS, TooManyWorkersSnafu);
        snafu::ensure!(
            self.gc_interval >= 1,
            MustBePositiveSnafu {
                what: "gc_interval"
            }
        );
        snafu::ensure!(self.heap_data_limit.0 >= 4096, HeapLimitTooSmallSnafu);
        snafu::ensure!(
            self.counter.stat_interval >= 1,
            MustBePositiveSnafu {
                what: "counter.stat_interval"
            }
        );
        snafu::ensure!(
            self.temp_dir.is_dir(),
            NotADirectorySnafu {
                path: self.temp_dir.clone()
            }
        );
        if let Some(file) = &self.log.file {
            snafu::ensure!(file.is_absolute(), BadLogFileSnafu { path: file.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Config {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = parse("");
        assert_eq!(config.port, 11211);
        assert_eq!(config.repl_port, 11213);
        assert_eq!(config.counter.port, 11215);
        assert_eq!(config.buckets, 1_000_000);
        assert_eq!(config.max_data_size.0, 1 << 20);
        assert_eq!(config.heap_data_limit.0, 256 << 10);
        assert_eq!(config.memory_limit.0, 1 << 30);
        assert_eq!(config.workers, 8);
        assert_eq!(config.gc_interval, 10);
        assert!(config.counter.enable);
        config.validate().unwrap();
    }

    #[test]
    fn sizes_accept_suffixes() {
        let config = parse(
            r#"
            # sizes in several spellings
            max_data_size = "4M"
            heap_data_limit = "64k"
            memory_limit = "2g"
            "#,
        );
        assert_eq!(config.max_data_size.0, 4 << 20);
        assert_eq!(config.heap_data_limit.0, 64 << 10);
        assert_eq!(config.memory_limit.0, 2 << 30);

        let config = parse("memory_limit = 1048576\n");
        assert_eq!(config.memory_limit.0, 1 << 20);
    }

    #[test]
    fn log_and_counter_tables() {
        let config = parse(
            "log.threshold = \"debug\"\nlog.file = \"/var/log/hoardd.log\"\n\
             counter.enable = false\ncounter.port = 11315\n",
        );
        assert_eq!(config.log.threshold, Verbosity::Debug);
        assert!(!config.counter.enable);
        assert_eq!(config.counter.port, 11315);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(toml::from_str::<Config>("log.threshold = \"loud\"\n").is_err());
        assert!(toml::from_str::<Config>("memory_limit = \"1x\"\n").is_err());

        let mut config = parse("");
        config.workers = 65;
        assert!(config.validate().is_err());
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = parse("");
        config.heap_data_limit = ByteSize(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn virtual_ip_and_bind_ip() {
        let config = parse("virtual_ip = \"10.0.0.5\"\nbind_ip = [\"127.0.0.1\"]\n");
        assert_eq!(config.virtual_ip, IpAddr::from([10, 0, 0, 5]));
        assert_eq!(config.bind_ip, vec![IpAddr::from([127, 0, 0, 1])]);
    }
}
