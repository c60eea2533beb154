//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    BackoffPolicy, CoordinatorConfig, HttpCollector, HubConfig, LineageCollector,
    LoggingCollector, NoopCollector, WorkerConfig,
};
use clap::{Parser, ValueEnum};
use db::DbConfig;
use lineage_core::QueueConfig;

/// Errors while turning flags into component configs.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid database settings: {0}")]
    Database(#[from] db::DbError),

    #[error("--collector-url is required for the http collector")]
    MissingCollectorUrl,

    #[error("collector setup failed: {0}")]
    Collector(#[from] actors::CollectorError),

    #[error("--{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Interval in whole seconds; timers cannot tick at a zero period.
fn interval_secs(flag: &'static str, secs: u64) -> Result<Duration, ServerError> {
    if secs == 0 {
        return Err(ServerError::ZeroInterval(flag));
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CollectorKind {
    None,
    Log,
    Http,
}

/// Lineage coordinator: durable run events, lineage forwarding and
/// live event streams.
#[derive(Parser, Debug)]
#[command(name = "lineage-coordinator", version, about)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "LINEAGE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Database endpoint.
    #[arg(long, env = "LINEAGE_DATABASE_URL", default_value = "mem://")]
    pub database_url: String,

    #[arg(long, env = "LINEAGE_DATABASE_NAMESPACE", default_value = "lineage")]
    pub database_namespace: String,

    #[arg(long, env = "LINEAGE_DATABASE_NAME", default_value = "main")]
    pub database_name: String,

    #[arg(long, env = "LINEAGE_DATABASE_USER")]
    pub database_user: Option<String>,

    #[arg(long, env = "LINEAGE_DATABASE_PASSWORD", hide_env_values = true)]
    pub database_password: Option<String>,

    /// Name of the durable event queue.
    #[arg(long, env = "LINEAGE_QUEUE_NAME", default_value = "lineage_events")]
    pub queue_name: String,

    /// Deliveries before a message is dead-lettered.
    #[arg(long, env = "LINEAGE_MAX_DELIVERY_ATTEMPTS", default_value_t = 3)]
    pub max_delivery_attempts: u32,

    /// Lease length in seconds.
    #[arg(long, env = "LINEAGE_VISIBILITY_TIMEOUT", default_value_t = 30)]
    pub visibility_timeout_secs: u64,

    /// Number of queue pollers.
    #[arg(long, env = "LINEAGE_WORKER_CONCURRENCY", default_value_t = 2)]
    pub worker_concurrency: usize,

    #[arg(long, env = "LINEAGE_WORKER_BATCH_SIZE", default_value_t = 10)]
    pub worker_batch_size: usize,

    /// Poll interval in milliseconds.
    #[arg(long, env = "LINEAGE_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Queue status sample interval in seconds.
    #[arg(long, env = "LINEAGE_METRICS_INTERVAL", default_value_t = 30)]
    pub metrics_interval_secs: u64,

    /// Per-observer queue size.
    #[arg(long, env = "LINEAGE_CLIENT_QUEUE_CAPACITY", default_value_t = 100)]
    pub client_queue_capacity: usize,

    /// Observer ping interval in seconds.
    #[arg(long, env = "LINEAGE_PING_INTERVAL", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Zombie sweep interval in seconds.
    #[arg(long, env = "LINEAGE_ZOMBIE_CHECK_INTERVAL", default_value_t = 60)]
    pub zombie_check_interval_secs: u64,

    #[arg(long, env = "LINEAGE_COLLECTOR", value_enum, default_value_t = CollectorKind::Log)]
    pub collector: CollectorKind,

    /// Base URL of an OpenLineage-compatible collector.
    #[arg(long, env = "LINEAGE_COLLECTOR_URL")]
    pub collector_url: Option<String>,

    #[arg(long, env = "LINEAGE_COLLECTOR_API_KEY", hide_env_values = true)]
    pub collector_api_key: Option<String>,

    /// Collector request timeout in seconds.
    #[arg(long, env = "LINEAGE_COLLECTOR_TIMEOUT", default_value_t = 10)]
    pub collector_timeout_secs: u64,

    /// OpenLineage namespace for jobs.
    #[arg(long, env = "LINEAGE_NAMESPACE", default_value = "default")]
    pub namespace: String,
}

impl Cli {
    pub fn db_config(&self) -> Result<DbConfig, ServerError> {
        let config = DbConfig::from_endpoint(&self.database_url)?
            .with_namespace(&self.database_namespace)
            .with_database(&self.database_name);

        Ok(match (&self.database_user, &self.database_password) {
            (Some(user), Some(password)) => config.with_credentials(user, password),
            _ => config,
        })
    }

    fn collector(&self) -> Result<Arc<dyn LineageCollector>, ServerError> {
        Ok(match self.collector {
            CollectorKind::None => Arc::new(NoopCollector),
            CollectorKind::Log => Arc::new(LoggingCollector),
            CollectorKind::Http => {
                let url = self
                    .collector_url
                    .as_deref()
                    .ok_or(ServerError::MissingCollectorUrl)?;
                Arc::new(HttpCollector::new(
                    url,
                    self.collector_api_key.clone(),
                    Duration::from_secs(self.collector_timeout_secs),
                )?)
            }
        })
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, ServerError> {
        let queue = QueueConfig::new(&self.queue_name)
            .with_max_delivery_attempts(self.max_delivery_attempts)
            .with_visibility_timeout(interval_secs(
                "visibility-timeout-secs",
                self.visibility_timeout_secs,
            )?);

        let hub = HubConfig {
            ping_interval: interval_secs("ping-interval-secs", self.ping_interval_secs)?,
            zombie_check_interval: interval_secs(
                "zombie-check-interval-secs",
                self.zombie_check_interval_secs,
            )?,
            ..HubConfig::default()
        }
        .with_capacity(self.client_queue_capacity);

        let worker = WorkerConfig {
            concurrency: self.worker_concurrency,
            batch_size: self.worker_batch_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            metrics_interval: interval_secs("metrics-interval-secs", self.metrics_interval_secs)?,
            backoff: BackoffPolicy::default(),
            ..WorkerConfig::default()
        };

        Ok(CoordinatorConfig {
            db: self.db_config()?,
            queue,
            hub,
            worker,
            collector: self.collector()?,
            namespace: self.namespace.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_memory_database() {
        let cli = Cli::try_parse_from(["lineage-coordinator"]).unwrap();
        let config = cli.coordinator_config().unwrap();
        assert_eq!(config.db.endpoint, "mem://");
        assert_eq!(config.queue.name, "lineage_events");
        assert_eq!(config.queue.max_delivery_attempts, 3);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.hub.client_queue_capacity, 100);
    }

    #[test]
    fn parses_durable_database() {
        let cli = Cli::try_parse_from([
            "lineage-coordinator",
            "--database-url",
            "rocksdb://./data/lineage",
            "--database-user",
            "root",
            "--database-password",
            "secret",
        ])
        .unwrap();
        let db = cli.db_config().unwrap();
        assert_eq!(db.endpoint, "rocksdb://./data/lineage");
        assert_eq!(db.credentials, Some(("root".into(), "secret".into())));
    }

    #[test]
    fn rejects_unknown_database_scheme() {
        let cli = Cli::try_parse_from(["lineage-coordinator", "--database-url", "postgres://x"]).unwrap();
        assert!(matches!(cli.db_config(), Err(ServerError::Database(_))));
    }

    #[test]
    fn http_collector_needs_url() {
        let cli = Cli::try_parse_from(["lineage-coordinator", "--collector", "http"]).unwrap();
        assert!(matches!(cli.coordinator_config(), Err(ServerError::MissingCollectorUrl)));
    }

    #[test]
    fn rejects_zero_timer_intervals() {
        for flag in [
            "--ping-interval-secs",
            "--zombie-check-interval-secs",
            "--metrics-interval-secs",
            "--visibility-timeout-secs",
        ] {
            let cli = Cli::try_parse_from(["lineage-coordinator", flag, "0"]).unwrap();
            assert!(matches!(
                cli.coordinator_config(),
                Err(ServerError::ZeroInterval(_))
            ));
        }

        let cli = Cli::try_parse_from(["lineage-coordinator", "--ping-interval-secs", "5"]).unwrap();
        assert_eq!(cli.coordinator_config().unwrap().hub.ping_interval, Duration::from_secs(5));

        let cli = Cli::try_parse_from(["lineage-coordinator", "--visibility-timeout-secs", "45"]).unwrap();
        assert_eq!(cli.coordinator_config().unwrap().queue.visibility_timeout(), Duration::from_secs(45));
    }
}
