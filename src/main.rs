use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use tokio::signal;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, trace};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

mod cli;

use cli::Cli;
use waymark::clock::SystemClock;
use waymark::config::{Config, LegacyConfig, Overrides};
use waymark::rng::{Rng, SeededRng, SystemRng};
use waymark::simulator::Simulator;
use waymark::transport::emulator::{CloudEmulator, EmulatorSettings};
use waymark::transport::TransportFactory;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env()
                .unwrap_or(EnvFilter::default().add_directive("info".parse().unwrap())),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    let overrides = Overrides {
        device_id: cli.device_id.clone(),
        seed: cli.seed,
        speed_limit_kph: cli.speed_limit_kph,
        heartbeat_secs: cli.heartbeat_secs,
    };
    let mut config = Config::load(cli.config.as_deref(), &overrides)?;
    trace!(config = ?config, "configuration loaded");

    // The binary always runs against the in-process cloud emulator; a real
    // broker integration plugs in behind the transport port.
    let settings = EmulatorSettings::default();
    if config.provisioning.is_none() && config.legacy.is_none() {
        info!("no credentials configured, using emulated hub access");
        config.legacy = Some(LegacyConfig {
            hub_host: settings.assigned_hub.clone(),
            device_id: config.simulation.device_id.clone(),
            device_key_base64: BASE64.encode(b"waymark emulator key"),
            token_expiry_secs: 3600,
        });
    }

    let factory: Box<dyn TransportFactory> = {
        let settings = settings.clone();
        Box::new(move || CloudEmulator::new(settings.clone()).handle())
    };

    let rng: Box<dyn Rng> = match config.simulation.seed {
        Some(seed) => Box::new(SeededRng::new(seed)),
        None => Box::new(SystemRng),
    };

    let mut simulator = Simulator::new(config, Box::new(SystemClock), rng, factory);
    simulator.start()?;

    let mut ticker = time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks: u64 = 0;
    let mut drive_started = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                simulator.tick();
                ticks += 1;

                if !drive_started && ticks >= cli.drive_after_secs {
                    drive_started = true;
                    simulator.start_driving(cli.drive_minutes);
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                simulator.stop();
                break;
            }
        }
    }

    Ok(())
}
