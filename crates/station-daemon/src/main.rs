mod calibrate;
mod channel;
mod crossfade;
mod fetch;
mod mpv;
mod player;
mod record;
mod recorder;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use station_core::config::Config;
use station_core::platform;
use station_core::probe::MediaProbe;
use station_core::schedule_store::ScheduleStore;

use crate::fetch::HtmlScheduleFetcher;
use crate::mpv::MpvLauncher;
use crate::player::Player;
use crate::recorder::Recorder;

#[derive(Parser)]
#[command(name = "stationd", about = "Delayed-broadcast station engine", version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Clone, Copy)]
enum Role {
    /// Record the live stream slot by slot
    Record,
    /// Play yesterday's recordings on the delayed clock
    Play,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Record => "recorder",
            Role::Play => "player",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join(format!("{}.log", cli.role.name()));
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,station_daemon=debug,station_core=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)?;
    info!("Config loaded from: {:?}", config_path);

    let fetcher = Arc::new(HtmlScheduleFetcher::new(config.schedule.clone())?);
    let store = ScheduleStore::new(fetcher, config.paths.schedule_dir(), config.schedule.fetch_retry());
    let probe = Arc::new(MediaProbe::new());

    match cli.role {
        Role::Record => Recorder::new(&config, store, probe)?.run().await,
        Role::Play => {
            let launcher = Arc::new(MpvLauncher::new(config.mpv.clone())?);
            Player::new(&config, store, probe, launcher).run().await
        }
    }
}
