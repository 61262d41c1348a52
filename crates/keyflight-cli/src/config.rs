use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use core::time::Duration;
use keyflight::{DEFAULT_EPOCH, StoreScope, SystemClock, TimeSource};

/// Runtime configuration for the `keyflight` binary.
///
/// Global settings pick the backing store, the id epoch, and the
/// single-flight domain used by `lookup`. Each one can also come from the
/// environment (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keyflight",
    version,
    about = "Issue store-backed ids and run stampede-safe cache reads"
)]
pub struct CliArgs {
    /// Backing store for counters and cache entries.
    ///
    /// `memory` lives and dies with this process. `redis` talks to the
    /// server at `REDIS_URL`.
    ///
    /// Environment variable: `STORE`
    #[arg(long, env = "STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// Redis connection URL, used when `STORE=redis`.
    ///
    /// Environment variable: `REDIS_URL`
    #[arg(long, env = "REDIS_URL", default_value_t = String::from("redis://127.0.0.1:6379"))]
    pub redis_url: String,

    /// Custom epoch, in seconds since the Unix epoch, subtracted from the
    /// wall clock to form the high half of every id.
    ///
    /// Environment variable: `EPOCH_SECS`
    #[arg(long, env = "EPOCH_SECS", default_value_t = DEFAULT_EPOCH)]
    pub epoch_secs: u64,

    /// Domain across which concurrent loads of one key are collapsed.
    ///
    /// `process` collapses callers inside this process. `store` additionally
    /// takes an expiring lock in the store so one process in the fleet loads.
    ///
    /// Environment variable: `FLIGHT_SCOPE`
    #[arg(long, env = "FLIGHT_SCOPE", value_enum, default_value_t = ScopeKind::Process)]
    pub flight_scope: ScopeKind,

    /// Expiry of the store flight lock in milliseconds. Should exceed the
    /// slowest expected load.
    ///
    /// Environment variable: `FLIGHT_LOCK_TTL_MS`
    #[arg(long, env = "FLIGHT_LOCK_TTL_MS", default_value_t = 30_000)]
    pub flight_lock_ttl_ms: u64,

    /// Delay between attempts to take a busy store flight lock, in
    /// milliseconds.
    ///
    /// Environment variable: `FLIGHT_POLL_MS`
    #[arg(long, env = "FLIGHT_POLL_MS", default_value_t = 25)]
    pub flight_poll_ms: u64,

    /// Emit logs as JSON lines instead of human-readable text.
    ///
    /// Environment variable: `LOG_JSON`
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Redis,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Process,
    Store,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Issue ids for a business type from concurrent callers and print them.
    Ids {
        /// Counter namespace.
        #[arg(long, default_value_t = String::from("order"))]
        business_type: String,

        /// Total number of ids to issue.
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: usize,

        /// Number of concurrent callers sharing the work.
        #[arg(short = 'c', long, default_value_t = num_cpus::get())]
        concurrency: usize,

        /// Only print the summary.
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },

    /// Read one key from many concurrent callers against a slow load and
    /// report how many loads ran.
    Lookup {
        /// Cache key to read.
        #[arg(long, default_value_t = String::from("test"))]
        key: String,

        /// Number of concurrent readers.
        #[arg(short = 'c', long, default_value_t = 50)]
        concurrency: usize,

        /// How long the simulated load takes, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        load_delay_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone, Copy)]
pub enum FlightConfig {
    Process,
    Store(StoreScope),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub epoch: u64,
    pub flight: FlightConfig,
    pub log_json: bool,
    pub command: Command,
}

impl TryFrom<CliArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let store = match args.store {
            StoreKind::Memory => StoreConfig::Memory,
            StoreKind::Redis => {
                if !(args.redis_url.starts_with("redis://")
                    || args.redis_url.starts_with("rediss://")
                    || args.redis_url.starts_with("redis+unix://"))
                {
                    bail!(
                        "REDIS_URL ({}) must use the redis://, rediss:// or redis+unix:// scheme",
                        args.redis_url
                    );
                }
                StoreConfig::Redis {
                    url: args.redis_url,
                }
            }
        };

        let now = SystemClock.current_secs();
        if args.epoch_secs > now {
            bail!(
                "EPOCH_SECS ({}) is ahead of the system clock ({})",
                args.epoch_secs,
                now
            );
        }

        let flight = match args.flight_scope {
            ScopeKind::Process => FlightConfig::Process,
            ScopeKind::Store => {
                if args.flight_lock_ttl_ms == 0 {
                    bail!("FLIGHT_LOCK_TTL_MS must be greater than 0");
                }
                if args.flight_poll_ms == 0 {
                    bail!("FLIGHT_POLL_MS must be greater than 0");
                }
                FlightConfig::Store(StoreScope::new(
                    Duration::from_millis(args.flight_lock_ttl_ms),
                    Duration::from_millis(args.flight_poll_ms),
                ))
            }
        };

        match &args.command {
            Command::Ids {
                business_type,
                concurrency,
                ..
            } => {
                if business_type.is_empty() {
                    bail!("--business-type must not be empty");
                }
                if *concurrency == 0 {
                    bail!("--concurrency must be greater than 0");
                }
            }
            Command::Lookup {
                key, concurrency, ..
            } => {
                if key.is_empty() {
                    bail!("--key must not be empty");
                }
                if *concurrency == 0 {
                    bail!("--concurrency must be greater than 0");
                }
            }
        }

        Ok(Self {
            store,
            epoch: args.epoch_secs,
            flight,
            log_json: args.log_json,
            command: args.command,
        })
    }
}
