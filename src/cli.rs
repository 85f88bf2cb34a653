use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use crate::collector::{DEFAULT_LISTEN_ADDR, DEFAULT_QUEUE_CAPACITY};
use crate::db::{DatabaseConfig, Driver};
use crate::delivery::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
use crate::message::LogLevel;
use crate::tail::{DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL};

/// Immutable configuration used by the application runtime
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Collect(CollectorConfig),
    Send(AgentConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConsumerMode {
    Cli,
    Database,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub listen: String,
    pub queue_capacity: usize,
    pub consumer: ConsumerMode,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub dir: PathBuf,
    pub suffix: String,
    pub poll_interval: Duration,
}

/// A message built from the command line and sent once.
#[derive(Debug, Clone)]
pub struct OneShot {
    pub messages: Vec<String>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub collector: String,
    pub server: String,
    pub level: LogLevel,
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub one_shot: Option<OneShot>,
    pub watch: Option<WatchConfig>,
}

/// User-facing CLI arguments (kept private to the CLI layer)
#[derive(Parser, Debug)]
#[command(name = "logrelay", version, about = "Ship log lines to a central collector")]
struct Args {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept messages from agents and write them to a sink
    Collect(CollectArgs),
    /// Tail files in a directory (or send one message) to a collector
    Send(SendArgs),
}

#[derive(ClapArgs, Debug)]
struct CollectArgs {
    /// Address to listen on
    #[arg(long = "listen", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Messages buffered between the network and the sink
    #[arg(long = "queue-capacity", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Where received messages go
    #[arg(long = "consumer", value_enum, default_value_t = ConsumerMode::Cli)]
    consumer: ConsumerMode,

    /// Database connection string, e.g. sqlite://logs.db?mode=rwc
    #[arg(long = "connection-string", default_value = "")]
    connection_string: String,

    /// Database driver
    #[arg(long = "driver", value_enum, default_value_t = Driver::Sqlite)]
    driver: Driver,

    /// Database schema (defaults to the driver's default schema)
    #[arg(long = "schema")]
    schema: Option<String>,

    /// Database table
    #[arg(long = "table", default_value = "logs")]
    table: String,

    /// Create the table and its index if they do not exist
    #[arg(long = "db-create")]
    db_create: bool,
}

#[derive(ClapArgs, Debug)]
struct SendArgs {
    /// Address of the collector
    #[arg(long = "collector", default_value = "localhost:9494")]
    collector: String,

    /// Directory to watch; every line appended to a matching file is sent
    #[arg(long = "watch")]
    watch: Option<PathBuf>,

    /// File name suffix of watched files
    #[arg(long = "ext", default_value = ".txt")]
    ext: String,

    /// Send --message immediately instead of watching
    #[arg(long = "send")]
    send: bool,

    /// Message text for --send (repeat to send a batch)
    #[arg(long = "message")]
    messages: Vec<String>,

    /// Time for --send in RFC 3339 format (defaults to local time)
    #[arg(long = "time", value_parser = parse_time)]
    time: Option<DateTime<Utc>>,

    /// Log level attached to sent lines
    #[arg(long = "loglevel", default_value = "DEBUG")]
    level: LogLevel,

    /// Origin server attached to sent lines
    #[arg(long = "server", env = "HOSTNAME", default_value = "unknown")]
    server: String,

    /// Attempts per message before giving up
    #[arg(long = "tries", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    tries: u32,

    /// Pause between attempts
    #[arg(long = "retry-interval-ms", default_value_t = DEFAULT_RETRY_INTERVAL.as_millis() as u64)]
    retry_interval_ms: u64,

    /// How often tailed files are polled for new data (at least 10 ms)
    #[arg(long = "poll-interval-ms", default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    poll_interval_ms: u64,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 time: {e}"))
}

/// Parse CLI options into an application Config
pub fn parse() -> Config {
    from_args(Args::parse())
}

fn from_args(args: Args) -> Config {
    let mode = match args.command {
        Command::Collect(c) => Mode::Collect(CollectorConfig {
            listen: c.listen,
            queue_capacity: c.queue_capacity,
            consumer: c.consumer,
            database: DatabaseConfig {
                driver: c.driver,
                connection_string: c.connection_string,
                schema: c.schema,
                table: c.table,
                auto_create: c.db_create,
            },
        }),
        Command::Send(s) => {
            let one_shot = s.send.then(|| OneShot {
                messages: s.messages,
                time: s.time.unwrap_or_else(|| Local::now().with_timezone(&Utc)),
            });
            let watch = s.watch.map(|dir| WatchConfig {
                dir,
                suffix: s.ext,
                poll_interval: Duration::from_millis(s.poll_interval_ms).max(MIN_POLL_INTERVAL),
            });
            Mode::Send(AgentConfig {
                collector: s.collector,
                server: s.server,
                level: s.level,
                max_attempts: s.tries,
                retry_interval: Duration::from_millis(s.retry_interval_ms),
                one_shot,
                watch,
            })
        }
    };
    Config {
        verbose: args.verbose,
        mode,
    }
}
