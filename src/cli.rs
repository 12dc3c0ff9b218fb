use std::path::PathBuf;

use clap::Parser;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long = "config", value_name = "path", env = "WAYMARK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device id override (fallback identity before provisioning)
    #[arg(long = "device-id", value_name = "id", env = "WAYMARK_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Seed for the random source; omit for system randomness
    #[arg(long = "seed", value_name = "num", env = "WAYMARK_SEED")]
    pub seed: Option<u64>,

    /// Speed limit for violation detection, km/h
    #[arg(
        long = "speed-limit-kph",
        value_name = "kph",
        env = "WAYMARK_SPEED_LIMIT_KPH"
    )]
    pub speed_limit_kph: Option<f64>,

    /// Stationary heartbeat interval in seconds
    #[arg(
        long = "heartbeat-secs",
        value_name = "secs",
        env = "WAYMARK_HEARTBEAT_SECS"
    )]
    pub heartbeat_secs: Option<u64>,

    /// Start a scripted driving session this many seconds after launch
    #[arg(
        long = "drive-after-secs",
        value_name = "secs",
        default_value_t = 5,
        env = "WAYMARK_DRIVE_AFTER_SECS"
    )]
    pub drive_after_secs: u64,

    /// Duration of the scripted driving session, minutes
    #[arg(
        long = "drive-minutes",
        value_name = "min",
        default_value_t = 10.0,
        env = "WAYMARK_DRIVE_MINUTES"
    )]
    pub drive_minutes: f64,
}
