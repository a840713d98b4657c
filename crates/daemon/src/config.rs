use crate::allocator::RetryPolicy;
use crate::db;
use crate::tracker::HeartbeatPolicy;
use chrono::NaiveTime;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tunnelport_common::PortRange;

pub const MIN_PORT: u16 = 2200;
pub const MAX_PORT: u16 = 2299;
pub const INACTIVITY_DAYS: i64 = 7;
pub const MAX_INACTIVITY_DAYS: i64 = 3650;
pub const PROBE_INTERVAL_SECS: u64 = 300;
pub const PROBE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port range: {0}")]
    Range(String),

    #[error("invalid reap time {0:?}, expected HH:MM")]
    ReapTime(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: i64 },

    #[error("probe command is empty")]
    EmptyProbeCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeKind {
    /// Run the probe command and search its output
    Ss,
    /// Read /proc/net/tcp directly
    Proc,
    /// Disable health probing
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMode {
    Command(String),
    Proc,
    Off,
}

#[derive(Parser, Debug)]
#[command(name = "tunnelportd", author, version, about = "Tunnel port allocation daemon", long_about = None)]
pub struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:3030", env = "TUNNELPORT_LISTEN")]
    pub listen: SocketAddr,

    /// SQLite database file (default: ~/.tunnelport/allocations.db)
    #[arg(long, env = "TUNNELPORT_DB")]
    pub db: Option<PathBuf>,

    /// Lowest port handed out
    #[arg(long, default_value_t = MIN_PORT, env = "TUNNELPORT_MIN_PORT")]
    pub min_port: u16,

    /// Highest port handed out
    #[arg(long, default_value_t = MAX_PORT, env = "TUNNELPORT_MAX_PORT")]
    pub max_port: u16,

    /// Days without verification before an allocation expires
    #[arg(long, default_value_t = INACTIVITY_DAYS, env = "TUNNELPORT_INACTIVITY_DAYS")]
    pub inactivity_days: i64,

    /// Daily reaper run time, UTC
    #[arg(long, default_value = "03:00", env = "TUNNELPORT_REAP_AT")]
    pub reap_at: String,

    /// How tunnel liveness is probed
    #[arg(long, value_enum, default_value = "ss", env = "TUNNELPORT_PROBE")]
    pub probe: ProbeKind,

    /// Socket listing command used by the `ss` probe
    #[arg(long, default_value = "ss -tln", env = "TUNNELPORT_PROBE_COMMAND")]
    pub probe_command: String,

    /// Seconds between health probes
    #[arg(long, default_value_t = PROBE_INTERVAL_SECS)]
    pub probe_interval_secs: u64,

    /// Seconds before a single probe counts as failed
    #[arg(long, default_value_t = PROBE_TIMEOUT_SECS)]
    pub probe_timeout_secs: u64,

    /// Reject heartbeats for ports with no active allocation instead of registering them
    #[arg(long)]
    pub no_heartbeat_self_heal: bool,

    /// Treat an exact heartbeat as an ownership verification
    #[arg(long)]
    pub heartbeat_verifies: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub range: PortRange,
    pub inactivity_window: chrono::Duration,
    pub reap_at: NaiveTime,
    pub probe: ProbeMode,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub heartbeat: HeartbeatPolicy,
    pub retry: RetryPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3030)),
            db_path: db::default_db_path(),
            range: PortRange {
                min: MIN_PORT,
                max: MAX_PORT,
            },
            inactivity_window: chrono::Duration::days(INACTIVITY_DAYS),
            reap_at: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            probe: ProbeMode::Command("ss -tln".to_string()),
            probe_interval: Duration::from_secs(PROBE_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            heartbeat: HeartbeatPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Cli {
    pub fn into_config(self) -> Result<DaemonConfig, ConfigError> {
        let range = PortRange::new(self.min_port, self.max_port).map_err(ConfigError::Range)?;
        let reap_at = NaiveTime::parse_from_str(&self.reap_at, "%H:%M")
            .map_err(|_| ConfigError::ReapTime(self.reap_at.clone()))?;
        if self.inactivity_days <= 0 {
            return Err(ConfigError::Zero("inactivity-days"));
        }
        if self.inactivity_days > MAX_INACTIVITY_DAYS {
            return Err(ConfigError::TooLarge {
                name: "inactivity-days",
                max: MAX_INACTIVITY_DAYS,
            });
        }
        if self.probe_interval_secs == 0 {
            return Err(ConfigError::Zero("probe-interval-secs"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(ConfigError::Zero("probe-timeout-secs"));
        }
        let probe = match self.probe {
            ProbeKind::Ss if self.probe_command.trim().is_empty() => {
                return Err(ConfigError::EmptyProbeCommand)
            }
            ProbeKind::Ss => ProbeMode::Command(self.probe_command),
            ProbeKind::Proc => ProbeMode::Proc,
            ProbeKind::Off => ProbeMode::Off,
        };

        Ok(DaemonConfig {
            listen: self.listen,
            db_path: self.db.unwrap_or_else(db::default_db_path),
            range,
            inactivity_window: chrono::Duration::days(self.inactivity_days),
            reap_at,
            probe,
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            heartbeat: HeartbeatPolicy {
                self_heal: !self.no_heartbeat_self_heal,
                refresh_verification: self.heartbeat_verifies,
            },
            retry: RetryPolicy::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<DaemonConfig, ConfigError> {
        let mut argv = vec!["tunnelportd"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.range, PortRange { min: 2200, max: 2299 });
        assert_eq!(config.inactivity_window, chrono::Duration::days(7));
        assert_eq!(config.reap_at, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
        assert_eq!(config.probe, ProbeMode::Command("ss -tln".to_string()));
        assert_eq!(config.probe_interval, Duration::from_secs(300));
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert!(config.heartbeat.self_heal);
        assert!(!config.heartbeat.refresh_verification);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--min-port",
            "3000",
            "--max-port",
            "3009",
            "--reap-at",
            "23:15",
            "--probe",
            "proc",
            "--no-heartbeat-self-heal",
            "--heartbeat-verifies",
        ])
        .unwrap();
        assert_eq!(config.range.len(), 10);
        assert_eq!(config.reap_at, NaiveTime::from_hms_opt(23, 15, 0).unwrap());
        assert_eq!(config.probe, ProbeMode::Proc);
        assert!(!config.heartbeat.self_heal);
        assert!(config.heartbeat.refresh_verification);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            parse(&["--min-port", "2300", "--max-port", "2200"]),
            Err(ConfigError::Range(_))
        ));
        assert!(matches!(parse(&["--reap-at", "3am"]), Err(ConfigError::ReapTime(_))));
        assert!(matches!(
            parse(&["--inactivity-days", "0"]),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            parse(&["--probe-command", " "]),
            Err(ConfigError::EmptyProbeCommand)
        ));
    }

    #[test]
    fn oversized_inactivity_window_is_rejected() {
        assert!(matches!(
            parse(&["--inactivity-days", "1000000000"]),
            Err(ConfigError::TooLarge { name: "inactivity-days", .. })
        ));
        assert!(matches!(
            parse(&["--inactivity-days", "9223372036854775807"]),
            Err(ConfigError::TooLarge { .. })
        ));

        let config = parse(&["--inactivity-days", "3650"]).unwrap();
        assert_eq!(config.inactivity_window, chrono::Duration::days(MAX_INACTIVITY_DAYS));
    }
}
