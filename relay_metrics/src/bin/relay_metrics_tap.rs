//! Wire a relay instrumentation registry to an events exporter and print the
//! resulting `relay-metrics` events as JSON lines.
//!
//! Connection activity is simulated for the configured relay and for one
//! neighbour sharing the registry, whose rows must never show up in the
//! output.

use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use clap::Parser;
use relay_metrics::{
    config::{self, Config},
    event::RelayMetricsEvent,
    exporter::{self, EventsExporter},
    instrument::{self, Registry},
    publisher::ChannelPublisher,
    track::{self, ConnectionGuard, ConnectionTags},
};
use tokio::{
    runtime::Builder,
    signal,
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Instrumentation registry error: {0}")]
    Instrument(#[from] instrument::Error),
    #[error("Exporter failed to start: {0}")]
    Exporter(#[from] exporter::Error),
    #[error("Failed to serialize event: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

/// Client groups the simulation cycles through, as (platform, user agent).
const GROUPS: [(&str, &str); 3] = [
    ("gameConsole", "UA1"),
    ("mobile", "UA2/1.4"),
    ("server", "Go-http-client/1.1"),
];

/// Open connections kept per relay before the oldest is closed.
const MAX_OPEN: usize = 8;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path to a yaml exporter configuration, see `relay_metrics::config`
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// relay id to report for, overrides the configuration; random if neither
    /// is given
    #[clap(long)]
    relay_id: Option<String>,
    /// milliseconds between window flushes, overrides the configuration
    #[clap(long)]
    flush_interval_milliseconds: Option<u64>,
    /// milliseconds between registry snapshot reports
    #[clap(long, default_value_t = 1_000)]
    report_interval_milliseconds: u64,
    /// milliseconds between simulated connection events
    #[clap(long, default_value_t = 250)]
    connection_interval_milliseconds: u64,
    /// seconds to run for before shutting down
    #[clap(long, default_value_t = 30)]
    duration_seconds: u64,
}

fn get_config(args: &Args) -> Result<Config, Error> {
    let mut config = match &args.config_path {
        Some(path) => Config::from_yaml(&std::fs::read_to_string(path)?)?,
        None => Config::new(Uuid::new_v4().to_string()),
    };
    if let Some(relay_id) = &args.relay_id {
        config.relay_id.clone_from(relay_id);
    }
    if let Some(millis) = args.flush_interval_milliseconds {
        config.flush_interval_milliseconds = millis;
    }
    config.validate()?;
    Ok(config)
}

/// Open and close connections round-robin over [`GROUPS`] for every relay in
/// `relay_ids` until `shutdown` is cancelled.
async fn simulate(relay_ids: Vec<String>, period: Duration, shutdown: CancellationToken) {
    let mut open: VecDeque<ConnectionGuard> = VecDeque::new();
    let mut ticker = time::interval(period.max(Duration::from_millis(1)));
    let mut step = 0usize;
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let (platform, agent) = GROUPS[step % GROUPS.len()];
                for relay_id in &relay_ids {
                    let tags = ConnectionTags::new(relay_id.as_str(), platform, agent);
                    open.push_back(track::connection_opened(&tags));
                }
                while open.len() > MAX_OPEN * relay_ids.len() {
                    open.pop_front();
                }
                step = step.wrapping_add(1);
            }
        }
    }
}

fn print_events(mut events: UnboundedReceiver<RelayMetricsEvent>) -> Result<(), Error> {
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn inner_main(args: Args, config: Config) -> Result<(), Error> {
    let registry = Registry::new();
    registry.install()?;
    registry.register_default_views()?;

    let shutdown = CancellationToken::new();
    let reporter = registry.spawn_reporter(
        Duration::from_millis(args.report_interval_milliseconds),
        shutdown.clone(),
    );

    let (publisher, mut events) = ChannelPublisher::channel();
    let exporter = EventsExporter::start(&config, Arc::new(publisher), &registry)?;

    let neighbour = Uuid::new_v4().to_string();
    debug!(%neighbour, "simulating neighbouring relay");
    let simulation = tokio::spawn(simulate(
        vec![config.relay_id.clone(), neighbour],
        Duration::from_millis(args.connection_interval_milliseconds),
        shutdown.clone(),
    ));

    let deadline = time::sleep_until(Instant::now() + Duration::from_secs(args.duration_seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                info!("run duration elapsed");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    shutdown.cancel();
    exporter.wait_closed().await;
    // Events whose windows closed before the exporter did.
    print_events(events)?;
    join_tasks(vec![("reporter", reporter), ("simulation", simulation)]).await;
    Ok(())
}

/// Wait for every task, logging those that did not finish cleanly. Returns
/// the number of failed tasks.
async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (task, handle) in tasks {
        if let Err(err) = handle.await {
            warn!(task, "task failed: {err}");
            failed += 1;
        }
    }
    failed
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    let args = Args::parse();
    let config = get_config(&args)?;
    info!(
        relay_id = %config.relay_id,
        "starting relay-metrics-tap {version}",
        version = env!("CARGO_PKG_VERSION")
    );

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(args, config));
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_tasks_counts_failed_tasks() {
        let finished = tokio::spawn(async {});
        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert_eq!(
            join_tasks(vec![("finished", finished), ("aborted", aborted)]).await,
            1
        );
    }

    #[test]
    fn command_line_overrides_configuration() {
        let args = Args::parse_from([
            "relay-metrics-tap",
            "--relay-id",
            "R1",
            "--flush-interval-milliseconds",
            "250",
        ]);
        let config = get_config(&args).unwrap();
        assert_eq!(config.relay_id, "R1");
        assert_eq!(config.flush_interval(), Duration::from_millis(250));
    }
}
