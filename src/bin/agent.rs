use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use venue_fleet::{
    actions::{ActionRunner, HookRunner, SimulatedRunner},
    actors::{collector::CollectorHandle, link::FleetLinkHandle, playback::PlaybackHandle},
    config::{AgentConfig, RunnerKind},
    content::ContentSource,
    executor::CommandExecutor,
    jobs::JobStore,
    monitors::probe::SystemProbe,
    phase::{PhaseMachine, PhaseStore},
    playlist::PlaylistBuilder,
    util::get_agent_config_path,
};

#[derive(Debug, Clone, Parser)]
#[command(about = "Venue device agent: metrics, remote jobs and playlist scheduling")]
struct Args {
    /// Config file (defaults to $VENUE_AGENT_CONFIG or ./agent.toml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("venue_fleet", LevelFilter::DEBUG),
        ("venue_agent", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config_path = args.config.unwrap_or_else(get_agent_config_path);
    let config = AgentConfig::load(&config_path)?;

    let runner: Arc<dyn ActionRunner> = match config.jobs.runner {
        RunnerKind::Simulated => Arc::new(SimulatedRunner::new(config.jobs.simulated_step())),
        RunnerKind::Hooks => Arc::new(HookRunner::new(config.jobs.resolved_hooks()?)),
    };
    let store = JobStore::open(&config.jobs.store_file)?;
    let executor = CommandExecutor::new(runner, store);

    let (snapshot_tx, snapshot_rx) = broadcast::channel(16);
    let probe = Arc::new(SystemProbe::new(&config.metrics));
    let collector = CollectorHandle::spawn(
        probe,
        config.metrics.thresholds,
        config.metrics.interval(),
        snapshot_tx,
    );

    let machine = PhaseMachine::restore(
        PhaseStore::new(&config.playback.phase_file),
        PlaylistBuilder::new(
            config.playback.media_dirs.clone(),
            &config.playback.playlist_file,
        ),
        ContentSource::new(&config.playback.content_file),
    );
    let playback = PlaybackHandle::spawn(machine, config.playback.watch_interval());

    let link = FleetLinkHandle::spawn(
        config.link.clone(),
        executor,
        Some(playback.clone()),
        snapshot_rx,
    );
    info!("agent started, registry at {}", config.link.url);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for (name, result) in [
        ("link", link.shutdown().await),
        ("collector", collector.shutdown().await),
        ("playback", playback.shutdown().await),
    ] {
        if let Err(e) = result {
            error!("failed to stop {name}: {e:#}");
        }
    }

    Ok(())
}
