use crate::config::{DaemonConfig, ProbeMode};
use crate::db::Store;
use crate::prober::{CommandProbe, ListenerProbe, ProcNetProbe, Prober, ReportSlot};
use crate::reaper::Reaper;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The reaper and prober loops, stopped together through one shutdown channel.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn start(store: Store, config: &DaemonConfig, slot: ReportSlot) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();

        let reaper = Reaper::new(store.clone(), config.inactivity_window);
        handles.push(tokio::spawn(reaper.run(config.reap_at, rx.clone())));

        match probe_for(&config.probe) {
            Some(probe) => {
                let prober = Prober::new(store, probe, config.probe_timeout);
                handles.push(tokio::spawn(prober.run(config.probe_interval, slot, rx)));
            }
            None => tracing::info!("tunnel health probing disabled"),
        }

        Self { shutdown, handles }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task ended abnormally");
            }
        }
    }
}

fn probe_for(mode: &ProbeMode) -> Option<Arc<dyn ListenerProbe>> {
    match mode {
        ProbeMode::Command(line) => {
            let probe = CommandProbe::from_command_line(line).unwrap_or_default();
            Some(Arc::new(probe))
        }
        ProbeMode::Proc => Some(Arc::new(ProcNetProbe)),
        ProbeMode::Off => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_stop_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let config = DaemonConfig {
            probe: ProbeMode::Off,
            ..DaemonConfig::default()
        };
        let tasks = BackgroundTasks::start(store, &config, ReportSlot::default());
        assert_eq!(tasks.handles.len(), 1);
        tokio::time::timeout(Duration::from_secs(5), tasks.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn probe_mode_selects_probe() {
        assert!(probe_for(&ProbeMode::Off).is_none());
        assert!(probe_for(&ProbeMode::Proc).is_some());
        assert!(probe_for(&ProbeMode::Command("netstat -tln".to_string())).is_some());
    }
}
