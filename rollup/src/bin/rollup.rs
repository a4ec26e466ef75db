use std::{env, future::Future, net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use rollup::{
    config::{self, Config, Telemetry},
    relay::{self, Relay},
};
use rollup_window::{FlushReport, Mode};
use tokio::{runtime::Builder, signal, time::Duration};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid rollup configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Rollup relay returned an error: {0}")]
    Relay(#[from] relay::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Could not join the relay task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: RollupArgs,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the relay, the default
    Run,
    /// Validate configuration and exit
    ConfigCheck,
}

#[derive(clap::Args, Debug)]
struct RollupArgs {
    /// path on disk to the configuration file, ignored if ROLLUP_CONFIG is set
    #[clap(long, global = true)]
    config_path: Option<PathBuf>,
    /// window width and flush period in seconds
    #[clap(short, long, global = true)]
    retention: Option<u64>,
    /// age in seconds past which a window is discarded
    #[clap(short, long, global = true)]
    expire: Option<u64>,
    /// port for the ingest listener
    #[clap(short, long, global = true)]
    port: Option<u16>,
    /// aggregation applied to each window: sum, min, max or avg
    #[clap(short, long, global = true)]
    mode: Option<Mode>,
    /// address to bind the prometheus exporter to
    #[clap(long, global = true)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

fn get_config(args: &RollupArgs, contents: Option<String>) -> Result<Config, Error> {
    let mut config = if let Some(contents) = contents {
        debug!("Using config from env var 'ROLLUP_CONFIG'");
        Config::from_yaml(&contents)?
    } else if let Some(path) = &args.config_path {
        debug!("Attempting to open configuration file at: {}", path.display());
        Config::load(path).inspect_err(|err| error!("Could not load config: {err}"))?
    } else {
        debug!("No configuration given, using defaults");
        Config::default()
    };

    if let Some(retention) = args.retention {
        config.retention_seconds = retention;
    }
    if let Some(expire) = args.expire {
        config.expire_seconds = expire;
    }
    if let Some(port) = args.port {
        config.ingest.binding_addr.set_port(port);
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(prometheus_addr) = args.prometheus_addr {
        config.telemetry = Some(Telemetry { prometheus_addr });
    }
    Ok(config)
}

async fn shutdown_requested() -> Result<(), Error> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("received ctrl-c");
            }
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("received ctrl-c");
    }
    Ok(())
}

async fn inner_main<F>(config: Config, stop: F) -> Result<FlushReport, Error>
where
    F: Future<Output = Result<(), Error>>,
{
    let (shutdown_watcher, shutdown_broadcast) = rollup_signal::signal();

    if let Some(Telemetry { prometheus_addr }) = config.telemetry {
        PrometheusBuilder::new()
            .with_http_listener(prometheus_addr)
            .install()?;
        info!(%prometheus_addr, "prometheus exporter installed");
    }

    let relay = Relay::bind(config, shutdown_watcher).await?;
    info!("listening for samples on {}", relay.local_addr()?);
    let mut relay_handle = tokio::spawn(relay.run());

    tokio::select! {
        res = stop => res?,
        res = &mut relay_handle => {
            // The relay only returns on its own if something failed.
            let report = res??;
            return Ok(report);
        }
    }

    shutdown_broadcast.signal_and_wait().await;
    Ok(relay_handle.await??)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();
    let config = get_config(&cli.args, env::var("ROLLUP_CONFIG").ok())?;

    if cli.command == Some(Commands::ConfigCheck) {
        return match config.validate() {
            Ok(_) => {
                info!("Configuration is valid");
                Ok(())
            }
            Err(err) => {
                error!("Configuration validation failed: {err}");
                Err(err.into())
            }
        };
    }

    info!("Starting rollup {version} run.");
    let max_shutdown_delay = Duration::from_secs(cli.args.max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, shutdown_requested()));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    let report = res?;
    info!(
        emitted = report.emitted,
        failed = report.failed,
        "Bye. :)"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rollup::sink;
    use tokio::time::sleep;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments did not parse")
    }

    #[test]
    fn no_arguments_runs_with_defaults() {
        let cli = parse(&["rollup"]);
        assert!(cli.command.is_none());
        let config = get_config(&cli.args, None).expect("no config");
        assert_eq!(config, Config::default());
        assert_eq!(cli.args.max_shutdown_delay, 30);
    }

    #[test]
    fn flags_override_configuration() {
        let cli = parse(&[
            "rollup",
            "-r",
            "10",
            "--expire",
            "60",
            "-p",
            "2003",
            "-m",
            "max",
            "--prometheus-addr",
            "127.0.0.1:9100",
        ]);
        let config = get_config(
            &cli.args,
            Some("retention_seconds: 30\nmode: avg\n".to_string()),
        )
        .expect("no config");
        assert_eq!(config.retention_seconds, 10);
        assert_eq!(config.expire_seconds, 60);
        assert_eq!(config.ingest.binding_addr.port(), 2003);
        assert_eq!(config.mode, Mode::Max);
        assert_eq!(
            config.telemetry,
            Some(Telemetry {
                prometheus_addr: "127.0.0.1:9100".parse().expect("bad addr")
            })
        );
    }

    #[test]
    fn unknown_mode_flag_rejected() {
        assert!(Cli::try_parse_from(["rollup", "--mode", "median"]).is_err());
    }

    #[test]
    fn config_check_subcommand_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "retention_seconds: 120\nexpire_seconds: 60").expect("write failed");
        let path = file.path().to_str().expect("non utf-8 path");

        let cli = parse(&["rollup", "config-check", "--config-path", path]);
        assert_eq!(cli.command, Some(Commands::ConfigCheck));
        let config = get_config(&cli.args, None).expect("no config");
        assert!(matches!(
            config.validate(),
            Err(config::Error::ExpireBeforeRetention { .. })
        ));

        // The flag repairs what the file got wrong.
        let cli = parse(&["rollup", "config-check", "--config-path", path, "-e", "600"]);
        let config = get_config(&cli.args, None).expect("no config");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_config_file_errors() {
        let cli = parse(&["rollup", "--config-path", "/nonexistent/rollup.yaml"]);
        assert!(matches!(
            get_config(&cli.args, None),
            Err(Error::Config(config::Error::ReadFile { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_stops_on_request() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = Config::default();
        config.ingest.binding_addr = "127.0.0.1:0".parse().expect("bad addr");
        config.sink = sink::Config::File {
            path: dir.path().join("out.txt"),
        };

        let stop = async {
            sleep(Duration::from_millis(100)).await;
            Ok(())
        };
        let report = inner_main(config, stop).await.expect("relay failed");
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_rejects_invalid_config() {
        let config = Config {
            retention_seconds: 0,
            ..Config::default()
        };
        let res = inner_main(config, std::future::pending()).await;
        assert!(matches!(
            res,
            Err(Error::Relay(relay::Error::Config(config::Error::Retention(_))))
        ));
    }
}
