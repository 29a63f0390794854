use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::blob::{BlobConfig, BlobKind};
use crate::logging::LogFormat;
use crate::storage::{BackendOptions, Driver, SwapPolicy};

// ============================================
// Environment variable name constants
// ============================================
pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const DB_DRIVER: &str = "DB_DRIVER";
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const MONGO_DATABASE: &str = "MONGO_DATABASE";
    pub const MAX_CONNECTIONS: &str = "MAX_CONNECTIONS";
    pub const ACQUIRE_TIMEOUT_SECS: &str = "ACQUIRE_TIMEOUT_SECS";
    pub const QUERY_TIMEOUT_SECS: &str = "QUERY_TIMEOUT_SECS";
    pub const SWAP_INTERVAL_MS: &str = "SWAP_INTERVAL_MS";
    pub const SWAP_CEILING_SECS: &str = "SWAP_CEILING_SECS";
    pub const HEALTH_CHECK_INTERVAL_SECS: &str = "HEALTH_CHECK_INTERVAL_SECS";
    pub const BLOB_STORE: &str = "BLOB_STORE";
    pub const BLOB_ROOT: &str = "BLOB_ROOT";
    pub const S3_BUCKET: &str = "S3_BUCKET";
    pub const S3_PREFIX: &str = "S3_PREFIX";
    pub const RETENTION_DAYS: &str = "RETENTION_DAYS";
    pub const PURGE_HOUR: &str = "PURGE_HOUR";
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run health checks and scheduled retention until interrupted (default)
    Serve,
    /// Purge once and exit (0 = no-op, negative = purge everything)
    Purge {
        #[arg(long, allow_negative_numbers = true)]
        days: i64,
    },
    /// Show version information
    Version,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "run-summary",
    version,
    about = "Persistence core for configuration-management run reports",
    long_about = "Stores run reports in SQLite, MySQL or MongoDB, archives raw payloads on disk or S3, rotates leased database credentials without downtime and purges expired history."
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log format: json or compact
    #[arg(long, env = env::LOG_FORMAT, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    // ============================================
    // Storage backend
    // ============================================
    /// Storage engine
    #[arg(long, env = env::DB_DRIVER, value_enum, default_value = "sqlite")]
    pub db_driver: Driver,

    /// Connection URL for the storage engine
    #[arg(long, env = env::DATABASE_URL, default_value = "sqlite://run-summary.db?mode=rwc")]
    pub database_url: String,

    /// Database name (mongo only)
    #[arg(long, env = env::MONGO_DATABASE, default_value = "run-summary")]
    pub mongo_database: String,

    /// Maximum pooled connections
    #[arg(long, env = env::MAX_CONNECTIONS, default_value = "10")]
    pub max_connections: u32,

    /// Seconds to wait for a pooled connection
    #[arg(long, env = env::ACQUIRE_TIMEOUT_SECS, default_value = "5")]
    pub acquire_timeout_secs: u64,

    /// Upper bound in seconds on a single storage call
    #[arg(long, env = env::QUERY_TIMEOUT_SECS, default_value = "30")]
    pub query_timeout_secs: u64,

    /// Milliseconds between reachability checks of a replacement connection
    #[arg(long, env = env::SWAP_INTERVAL_MS, default_value = "500")]
    pub swap_interval_ms: u64,

    /// Seconds a replacement connection may take to become reachable
    #[arg(long, env = env::SWAP_CEILING_SECS, default_value = "7")]
    pub swap_ceiling_secs: u64,

    /// Database health check interval in seconds (0 to disable)
    #[arg(long, env = env::HEALTH_CHECK_INTERVAL_SECS, default_value = "30")]
    pub health_check_interval_secs: u64,

    // ============================================
    // Blob archive
    // ============================================
    /// Where raw payloads are archived
    #[arg(long, env = env::BLOB_STORE, value_enum, default_value = "local")]
    pub blob_store: BlobKind,

    /// Root directory of the local archive
    #[arg(long, env = env::BLOB_ROOT, default_value = "reports")]
    pub blob_root: PathBuf,

    /// Bucket of the S3 archive
    #[arg(long, env = env::S3_BUCKET)]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the S3 bucket
    #[arg(long, env = env::S3_PREFIX, default_value = "")]
    pub s3_prefix: String,

    // ============================================
    // Retention
    // ============================================
    /// Days of history to keep (0 = keep forever, negative = purge everything)
    #[arg(long, env = env::RETENTION_DAYS, default_value = "0", allow_negative_numbers = true)]
    pub retention_days: i64,

    /// Local hour (0-23) of the daily purge
    #[arg(long, env = env::PURGE_HOUR, default_value = "3")]
    pub purge_hour: u32,
}

impl Config {
    pub fn from_args() -> Self {
        Config::parse()
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        let scheme = self
            .database_url
            .split("://")
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let accepted: &[&str] = match self.db_driver {
            Driver::Sqlite => &["sqlite"],
            Driver::Mysql => &["mysql", "mariadb"],
            Driver::Mongo => &["mongodb", "mongodb+srv"],
        };
        if !accepted.contains(&scheme.as_str()) {
            return Err(format!(
                "DATABASE_URL scheme '{}' does not match DB_DRIVER '{}'",
                scheme, self.db_driver
            ));
        }

        if self.db_driver == Driver::Mongo && self.mongo_database.trim().is_empty() {
            return Err("MONGO_DATABASE is required for the mongo driver".to_string());
        }

        if self.blob_store == BlobKind::S3
            && self.s3_bucket.as_deref().is_none_or(|b| b.trim().is_empty())
        {
            return Err("S3_BUCKET is required when BLOB_STORE is s3".to_string());
        }

        if self.max_connections == 0 {
            return Err("MAX_CONNECTIONS must be at least 1".to_string());
        }

        if self.query_timeout_secs == 0 {
            return Err("QUERY_TIMEOUT_SECS must be at least 1".to_string());
        }

        if self.swap_interval_ms == 0 {
            return Err("SWAP_INTERVAL_MS must be at least 1".to_string());
        }

        if self.swap_ceiling() < self.swap_interval() {
            return Err("SWAP_CEILING_SECS must not be shorter than SWAP_INTERVAL_MS".to_string());
        }

        if self.purge_hour > 23 {
            return Err(format!("PURGE_HOUR must be 0-23, got {}", self.purge_hour));
        }

        Ok(())
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    fn swap_interval(&self) -> Duration {
        Duration::from_millis(self.swap_interval_ms)
    }

    fn swap_ceiling(&self) -> Duration {
        Duration::from_secs(self.swap_ceiling_secs)
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            swap: SwapPolicy {
                interval: self.swap_interval(),
                ceiling: self.swap_ceiling(),
            },
            mongo_database: self.mongo_database.clone(),
        }
    }

    pub fn blob_config(&self) -> BlobConfig {
        BlobConfig {
            kind: self.blob_store,
            root: self.blob_root.clone(),
            bucket: self.s3_bucket.clone(),
            prefix: self.s3_prefix.clone(),
        }
    }

    /// Database URL with any password replaced, for logging
    pub fn redacted_database_url(&self) -> String {
        redact_url(&self.database_url)
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    // A raw '@' may appear in the password, the host follows the last one
    let Some((userinfo, host)) = authority.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:****@{}{}", scheme, user, host, tail),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config {
            command: None,
            log_format: LogFormat::Json,
            log_level: "info".to_string(),
            db_driver: Driver::Sqlite,
            database_url: "sqlite://run-summary.db?mode=rwc".to_string(),
            mongo_database: "run-summary".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            query_timeout_secs: 30,
            swap_interval_ms: 500,
            swap_ceiling_secs: 7,
            health_check_interval_secs: 30,
            blob_store: BlobKind::Local,
            blob_root: PathBuf::from("reports"),
            s3_bucket: None,
            s3_prefix: String::new(),
            retention_days: 0,
            purge_hour: 3,
        }
    }

    #[test]
    fn test_validate_defaults() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn test_validate_driver_url_mismatch() {
        let mut config = default_config();
        config.db_driver = Driver::Mysql;
        assert_eq!(
            config.validate().unwrap_err(),
            "DATABASE_URL scheme 'sqlite' does not match DB_DRIVER 'mysql'"
        );

        config.database_url = "mysql://app:secret@db:3306/reports".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_mongo_urls() {
        let mut config = default_config();
        config.db_driver = Driver::Mongo;
        config.database_url = "mongodb+srv://cluster.example.com".to_string();
        assert!(config.validate().is_ok());

        config.mongo_database = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_s3_requires_bucket() {
        let mut config = default_config();
        config.blob_store = BlobKind::S3;
        assert_eq!(
            config.validate().unwrap_err(),
            "S3_BUCKET is required when BLOB_STORE is s3"
        );

        config.s3_bucket = Some("reports-archive".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_swap_bounds() {
        let mut config = default_config();
        config.swap_interval_ms = 10_000;
        assert!(config.validate().is_err());

        config.swap_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_purge_hour() {
        let mut config = default_config();
        config.purge_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_options() {
        let options = default_config().backend_options();
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.swap, SwapPolicy::default());
        assert_eq!(options.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_default_command_is_serve() {
        assert_eq!(default_config().command(), Command::Serve);
    }

    #[test]
    fn test_parse_purge_negative_days() {
        let config = Config::try_parse_from(["run-summary", "purge", "--days", "-1"]).unwrap();
        assert_eq!(config.command(), Command::Purge { days: -1 });
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("mysql://app:s3cret@db:3306/reports"),
            "mysql://app:****@db:3306/reports"
        );
        assert_eq!(
            redact_url("mysql://app:p@ss@db:3306/reports"),
            "mysql://app:****@db:3306/reports"
        );
        assert_eq!(
            redact_url("mongodb://app:pw@m1:27017,m2:27017/?replyTo=ops@example.com"),
            "mongodb://app:****@m1:27017,m2:27017/?replyTo=ops@example.com"
        );
        assert_eq!(
            redact_url("sqlite://run-summary.db?mode=rwc"),
            "sqlite://run-summary.db?mode=rwc"
        );
    }

    #[test]
    fn test_log_format_values() {
        let config = Config::try_parse_from(["run-summary", "--log-format", "compact"]).unwrap();
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(Config::try_parse_from(["run-summary", "--log-format", "pretty"]).is_err());
    }
}
