use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use conf::{Conf, Subcommands, anstyle::AnsiColor};
use listenfd::ListenFd;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteJournalMode, SqliteSynchronous};

#[derive(Debug, Clone, Copy, Default)]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Truncate,
    Persist,
    Memory,
    Off,
}

impl FromStr for JournalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_bytes() {
            b"wal" => Ok(JournalMode::Wal),
            b"delete" => Ok(JournalMode::Delete),
            b"truncate" => Ok(JournalMode::Truncate),
            b"persist" => Ok(JournalMode::Persist),
            b"memory" => Ok(JournalMode::Memory),
            b"off" => Ok(JournalMode::Off),
            _ => Err(format!("{s} is not a journal mode")),
        }
    }
}

impl From<JournalMode> for SqliteJournalMode {
    fn from(value: JournalMode) -> Self {
        match value {
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Delete => SqliteJournalMode::Delete,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
            JournalMode::Persist => SqliteJournalMode::Persist,
            JournalMode::Memory => SqliteJournalMode::Memory,
            JournalMode::Off => SqliteJournalMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Synchronous {
    Off,
    #[default]
    Normal,
    Full,
    Extra,
}

impl FromStr for Synchronous {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_bytes() {
            b"off" => Ok(Synchronous::Off),
            b"normal" => Ok(Synchronous::Normal),
            b"full" => Ok(Synchronous::Full),
            b"extra" => Ok(Synchronous::Extra),
            _ => Err(format!("{s} is not a synchronous mode")),
        }
    }
}

impl From<Synchronous> for SqliteSynchronous {
    fn from(value: Synchronous) -> Self {
        match value {
            Synchronous::Off => SqliteSynchronous::Off,
            Synchronous::Normal => SqliteSynchronous::Normal,
            Synchronous::Full => SqliteSynchronous::Full,
            Synchronous::Extra => SqliteSynchronous::Extra,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum AutoVacuum {
    #[default]
    None,
    Full,
    Incremental,
}

impl FromStr for AutoVacuum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_bytes() {
            b"none" => Ok(AutoVacuum::None),
            b"full" => Ok(AutoVacuum::Full),
            b"incremental" => Ok(AutoVacuum::Incremental),
            _ => Err(format!("{s} is not an auto-vacuum mode")),
        }
    }
}

impl From<AutoVacuum> for SqliteAutoVacuum {
    fn from(value: AutoVacuum) -> Self {
        match value {
            AutoVacuum::None => SqliteAutoVacuum::None,
            AutoVacuum::Full => SqliteAutoVacuum::Full,
            AutoVacuum::Incremental => SqliteAutoVacuum::Incremental,
        }
    }
}

#[derive(Debug, Clone, Conf)]
pub struct SqliteConfig {
    /// SQLite journal mode (wal, delete, truncate, persist, memory, off)
    #[conf(long, env)]
    pub journal_mode: Option<JournalMode>,

    /// SQLite synchronous mode (off, normal, full, extra)
    #[conf(long, env)]
    pub synchronous: Option<Synchronous>,

    /// SQLite auto-vacuum mode (none, full, incremental)
    #[conf(long, env)]
    pub auto_vacuum: Option<AutoVacuum>,
}

#[derive(Clone, Conf)]
pub struct RootCredentials {
    #[conf(long, env)]
    pub access_key: String,
    #[conf(long, env)]
    pub secret_key: String,
}

impl std::fmt::Debug for RootCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"REDACTED")
            .finish()
    }
}

#[derive(Debug, Conf, Clone)]
pub struct RunConfig {
    #[conf(long, env, default_value = "::")]
    /// Address to expose the service
    pub bind: String,

    #[conf(long, env, default(9000))]
    /// Port to expose the service
    pub port: u16,

    #[conf(long, env, default_value = "sqlite:data/metadata.db")]
    /// SQLx connection URL for the metadata store
    pub database_url: String,

    #[conf(long, env, default_value = "data/blobs")]
    /// Directory holding the content-addressed blob files
    pub blob_path: std::path::PathBuf,

    #[conf(long, env, default_value = "us-east-1")]
    /// Region reported by GetBucketLocation
    pub region: String,

    #[conf(long, env)]
    /// 64 hex characters (32 bytes). Objects uploaded with
    /// x-amz-server-side-encryption are sealed with this key; without it,
    /// SSE requests are rejected.
    pub sse_master_key: Option<String>,

    #[conf(long, env)]
    /// Secret signing the login bearer tokens. A random per-process secret
    /// is used when unset, which invalidates tokens across restarts.
    pub session_secret: Option<String>,

    #[conf(long, env)]
    /// Password for the built-in admin account, hashed on startup
    pub admin_password: Option<String>,

    #[conf(flatten, prefix)]
    /// Root access key pair mapped to the admin account
    pub root: Option<RootCredentials>,

    #[conf(long, env)]
    /// Domain for virtual-host addressing (bucket.<domain>/key). Path-style
    /// requests always work.
    pub virtual_host_domain: Option<String>,

    #[conf(long, env, default(604_800))]
    /// Seconds before an unfinished multipart upload is aborted
    pub multipart_max_age_secs: u64,

    #[conf(long, env, default(60))]
    /// Seconds between blob GC / stale-upload sweeps
    pub gc_interval_secs: u64,

    #[conf(flatten, prefix)]
    pub sqlite: SqliteConfig,
}

impl RunConfig {
    /// Resolves the TCP listener to serve on. An inherited socket (systemd
    /// socket activation, or `systemfd` during development) wins over the
    /// configured `bind`/`port` pair.
    pub async fn listener(&self) -> std::io::Result<tokio::net::TcpListener> {
        if let Some(inherited) = ListenFd::from_env().take_tcp_listener(0)? {
            tracing::info!(addr = ?inherited.local_addr().ok(), "Using inherited listener");
            inherited.set_nonblocking(true)?;
            return tokio::net::TcpListener::from_std(inherited);
        }

        let ip: IpAddr = self.bind.parse().map_err(|error| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("BIND address {:?}: {error}", self.bind),
            )
        })?;
        let addr = SocketAddr::new(ip, self.port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Listening");
        Ok(listener)
    }
}

#[derive(Debug, Subcommands)]
pub enum CliOperations {
    /// Start the server. [Default]
    Run(RunConfig),
    /// Dump parsed configuration
    Config(RunConfig),
    /// Generate credentials to use with config
    Credentials,
}

const HELP_STYLES: conf::Styles = conf::Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Conf, Debug)]
#[conf(
    name = "penha",
    about = "S3-compatible object storage backed by SQLite metadata and a local blob store.",
    styles = HELP_STYLES
)]
pub struct Cli {
    #[conf(subcommands)]
    pub command: Option<CliOperations>,

    #[conf(flatten)]
    pub config: RunConfig,
}
