//! Command-line interface for cinder.
//!
//! Wires the receivers, cache and persister together and runs them until a
//! shutdown signal arrives.

use crate::cache::Cache;
use crate::core::config::{Config, ConfigBuilder};
use crate::core::{CinderError, Result};
use crate::persist::{LogSink, Persister, PointsSink};
use crate::receiver::{TcpReceiver, UdpReceiver};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Graphite-family metrics ingestion and aggregation relay
#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TCP listen address for the plaintext protocol
    #[arg(long, env = "CINDER_TCP_LISTEN")]
    pub tcp_listen: Option<String>,

    /// UDP listen address for the plaintext protocol
    #[arg(long, env = "CINDER_UDP_LISTEN")]
    pub udp_listen: Option<String>,

    /// Cache capacity in samples (0 disables the limit)
    #[arg(long, env = "CINDER_MAX_SIZE")]
    pub max_size: Option<usize>,

    /// Configuration file path (default: ~/.config/cinder/config.yaml)
    #[arg(short, long, env = "CINDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "CINDER_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = if let Some(path) = &self.config {
            Some(path.clone())
        } else {
            dirs::config_dir()
                .map(|d| d.join("cinder").join("config.yaml"))
                .filter(|p| p.exists())
        };

        if let Some(path) = config_path {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::debug!(path = ?path, "loaded configuration file");
                },
                Err(e) if self.config.is_some() => {
                    return Err(CinderError::config(format!(
                        "failed to read config file {:?}: {}",
                        path, e
                    )));
                },
                Err(_) => {},
            }
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(addr) = &self.tcp_listen {
            builder = builder.tcp_listen(addr.clone());
        }
        if let Some(addr) = &self.udp_listen {
            builder = builder.udp_listen(addr.clone());
        }
        if let Some(max_size) = self.max_size {
            builder = builder.max_size(max_size);
        }
        builder.debug(self.debug).build()
    }

    /// Initialize logging based on the loaded configuration.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

        let log_level = if self.debug {
            "debug".to_string()
        } else {
            std::env::var("CINDER_LOG_LEVEL")
                .unwrap_or_else(|_| config.logging.level.as_str().to_string())
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact().boxed()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| CinderError::config(format!("failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute the cinder daemon.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;
    cli.init_logging(&config)?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  TCP listen: {} (enabled: {})", config.tcp.listen, config.tcp.enabled);
        println!("  UDP listen: {} (enabled: {})", config.udp.listen, config.udp.enabled);
        println!("  Cache max size: {}", config.cache.max_size);
        println!("  Checkpoint interval: {:?}", config.cache.checkpoint_interval);
        return Ok(());
    }

    run(config).await
}

/// Run receivers, cache and persister until ctrl-c.
async fn run(config: Config) -> Result<()> {
    let mut cache = Cache::new(config.cache.clone());
    let output = cache
        .take_output()
        .ok_or_else(|| CinderError::config("cache output already taken"))?;
    cache.start();

    let sink = Arc::new(LogSink::default());
    let persister = Persister::spawn(output, Arc::clone(&sink) as Arc<dyn PointsSink>);

    let tcp = TcpReceiver::new(cache.input());
    tcp.apply(config.tcp.to_settings()).await?;
    let udp = UdpReceiver::new(cache.input());
    udp.apply(config.udp.to_settings()).await?;

    let stat_task = spawn_receiver_stats(&cache, &tcp, &udp, &config);

    tracing::info!(
        tcp = ?tcp.local_addr().await,
        udp = ?udp.local_addr().await,
        "cinder running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal, stopping");

    stat_task.abort();
    if let Err(e) = udp.stop().await {
        tracing::warn!(error = %e, "udp receiver stop failed");
    }
    if let Err(e) = tcp.stop().await {
        tracing::warn!(error = %e, "tcp receiver stop failed");
    }
    cache.stop().await;
    persister.stop().await;

    tracing::info!(
        persisted_metrics = sink.metrics(),
        persisted_samples = sink.samples(),
        "shutdown complete"
    );
    Ok(())
}

/// Feeds receiver counters back into the cache on the checkpoint cadence so
/// they drain through the ordinary output path.
fn spawn_receiver_stats(
    cache: &Cache,
    tcp: &TcpReceiver,
    udp: &UdpReceiver,
    config: &Config,
) -> tokio::task::JoinHandle<()> {
    let input = cache.input();
    let tcp_stats = tcp.stats();
    let udp_stats = udp.stats();
    let prefix = config.cache.graph_prefix.clone();
    let period = config.cache.checkpoint_interval;

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let points = tcp_stats
                .stat_points(&prefix, "tcp")
                .into_iter()
                .chain(udp_stats.stat_points(&prefix, "udp"));
            for p in points {
                // Same overflow policy as the receivers: never block.
                let _ = input.try_send(p);
            }
        }
    })
}
