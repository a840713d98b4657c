//! Tunnel health probing against the OS listening-socket table.
//!
//! The prober only reports. It never changes allocation state.

use crate::db::{self, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tunnelport_common::ProbeReport;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Exit { command: String, status: std::process::ExitStatus },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ListenerProbe: Send + Sync {
    async fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError>;
}

/// Runs a socket-listing command (`ss -tln` by default) and looks for the port in its
/// local-address column.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as `netstat -tln`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self::new("ss", vec!["-tln".to_string()])
    }
}

#[async_trait]
impl ListenerProbe for CommandProbe {
    async fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                command: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProbeError::Exit {
                command: self.program.clone(),
                status: output.status,
            });
        }
        Ok(listing_mentions_port(&String::from_utf8_lossy(&output.stdout), port))
    }
}

/// True when any line of `ss`/`netstat` style output has a local address ending in `:port`.
pub fn listing_mentions_port(listing: &str, port: u16) -> bool {
    let suffix = format!(":{}", port);
    listing.lines().any(|line| {
        line.split_whitespace()
            .take(4)
            .any(|field| field.ends_with(&suffix))
    })
}

/// Reads `/proc/net/tcp` and `/proc/net/tcp6` directly.
#[derive(Debug, Clone, Default)]
pub struct ProcNetProbe;

const PROC_NET_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
const TCP_LISTEN: &str = "0A";

#[async_trait]
impl ListenerProbe for ProcNetProbe {
    async fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError> {
        for path in PROC_NET_TABLES {
            match tokio::fs::read_to_string(path).await {
                Ok(table) => {
                    if proc_table_listens_on(&table, port) {
                        return Ok(true);
                    }
                }
                Err(source) if path == PROC_NET_TABLES[0] => {
                    return Err(ProbeError::Read {
                        path: path.to_string(),
                        source,
                    })
                }
                // tcp6 is absent on hosts without IPv6.
                Err(source) => tracing::trace!(path, error = %source, "skipping socket table"),
            }
        }
        Ok(false)
    }
}

/// Lines look like `sl local_address rem_address st ...` with `local_address` as
/// `HEXIP:HEXPORT`.
pub fn proc_table_listens_on(table: &str, port: u16) -> bool {
    table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(local), Some(state)) = (fields.get(1), fields.get(3)) else {
            return false;
        };
        *state == TCP_LISTEN
            && local
                .rsplit(':')
                .next()
                .and_then(|hex| u16::from_str_radix(hex, 16).ok())
                == Some(port)
    })
}

/// Latest report, shared with the HTTP surface.
pub type ReportSlot = Arc<RwLock<Option<ProbeReport>>>;

#[derive(Clone)]
pub struct Prober {
    store: Store,
    probe: Arc<dyn ListenerProbe>,
    timeout: Duration,
}

impl Prober {
    pub fn new(store: Store, probe: Arc<dyn ListenerProbe>, timeout: Duration) -> Self {
        Self { store, probe, timeout }
    }

    /// Check every active allocation once. Errors and timeouts count as unhealthy.
    pub async fn sweep(&self) -> crate::error::Result<ProbeReport> {
        let active = self.store.call(|conn| db::list_active(conn)).await?;
        let mut report = ProbeReport {
            checked_at: Utc::now(),
            healthy: Vec::new(),
            unhealthy: Vec::new(),
        };

        for allocation in active {
            let port = allocation.port;
            let listening = match time::timeout(self.timeout, self.probe.is_port_listening(port)).await {
                Ok(Ok(listening)) => listening,
                Ok(Err(e)) => {
                    tracing::warn!(port, error = %e, "probe failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(port, timeout_secs = self.timeout.as_secs(), "probe timed out");
                    false
                }
            };
            if listening {
                report.healthy.push(port);
            } else {
                tracing::debug!(port, owner_id = %allocation.owner_id, "tunnel not listening");
                report.unhealthy.push(port);
            }
        }

        tracing::info!(
            healthy = report.healthy.len(),
            unhealthy = report.unhealthy.len(),
            "tunnel health check complete"
        );
        Ok(report)
    }

    pub async fn run(self, every: Duration, slot: ReportSlot, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) => {
                            if let Ok(mut latest) = slot.write() {
                                *latest = Some(report);
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "tunnel health check failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("prober stopped");
    }
}
