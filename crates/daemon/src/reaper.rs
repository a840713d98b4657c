//! Daily expiry of allocations whose owners stopped verifying.

use crate::db::{self, Store};
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tunnelport_common::Allocation;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct Reaper {
    store: Store,
    window: ChronoDuration,
}

impl Reaper {
    pub fn new(store: Store, window: ChronoDuration) -> Self {
        Self { store, window }
    }

    /// Expire every active allocation whose last verification predates `now - window`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Allocation>> {
        let Some(cutoff) = now.checked_sub_signed(self.window) else {
            tracing::warn!(
                window_days = self.window.num_days(),
                "inactivity window reaches past the earliest representable time, nothing to expire"
            );
            return Ok(Vec::new());
        };
        let expired = self
            .store
            .call(move |conn| {
                db::expire_stale(conn, cutoff, |allocation| {
                    tracing::info!(
                        port = allocation.port,
                        owner_id = %allocation.owner_id,
                        idle_days = (now - allocation.last_verification).num_days(),
                        "expiring inactive allocation"
                    );
                })
            })
            .await?;
        tracing::info!(count = expired.len(), "reaper sweep complete");
        Ok(expired)
    }

    /// Sweep once at startup, then daily at `at` (UTC) until `shutdown` flips to true.
    pub async fn run(self, at: NaiveTime, mut shutdown: watch::Receiver<bool>) {
        self.sweep_logged().await;

        let first = delay_until(Utc::now(), at);
        tracing::info!(next_in_secs = first.as_secs(), "reaper scheduled");
        let mut ticker = time::interval_at(time::Instant::now() + first, DAY);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_logged().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("reaper stopped");
    }

    async fn sweep_logged(&self) {
        // Stale rows are still stale on the next run, so a failure is only logged.
        if let Err(e) = self.sweep(Utc::now()).await {
            tracing::error!(error = %e, "reaper sweep failed");
        }
    }
}

/// Time from `now` until the next strictly-future occurrence of `at` (UTC).
pub fn delay_until(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{HeartbeatPolicy, Tracker};
    use tunnelport_common::{Metadata, PortRange};

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    async fn seed(store: &Store, port: u16, owner: &str, at: DateTime<Utc>) {
        let owner = owner.to_string();
        store
            .call(move |conn| db::insert_active(conn, port, &owner, None, &Metadata::new(), at))
            .await
            .unwrap();
    }

    #[test]
    fn delay_targets_later_today() {
        let now = utc("2026-03-01T01:30:00Z");
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        assert_eq!(delay_until(now, at), Duration::from_secs(90 * 60));
    }

    #[test]
    fn delay_rolls_over_to_tomorrow() {
        let now = utc("2026-03-01T03:00:00Z");
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        assert_eq!(delay_until(now, at), DAY);

        let now = utc("2026-03-01T23:00:00Z");
        assert_eq!(delay_until(now, at), Duration::from_secs(4 * 60 * 60));
    }

    #[tokio::test]
    async fn stale_verification_expires_despite_recent_heartbeat() {
        let store = Store::open_in_memory().unwrap();
        let now = utc("2026-03-10T00:00:00Z");
        seed(&store, 2200, "router-1", now - ChronoDuration::days(8)).await;
        seed(&store, 2201, "router-2", now - ChronoDuration::days(1)).await;

        let tracker = Tracker::new(
            store.clone(),
            PortRange::new(2200, 2202).unwrap(),
            HeartbeatPolicy::default(),
        );
        let outcome = tracker.heartbeat_at(2200, "router-1", now).await.unwrap();
        assert_eq!(outcome, tunnelport_common::HeartbeatOutcome::Matched);

        let reaper = Reaper::new(store.clone(), ChronoDuration::days(7));
        let expired = reaper.sweep(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].port, 2200);

        let active = store.call(|conn| db::list_active(conn)).await.unwrap();
        assert_eq!(active.iter().map(|a| a.port).collect::<Vec<_>>(), vec![2201]);
    }

    #[tokio::test]
    async fn verification_keeps_allocation_alive() {
        let store = Store::open_in_memory().unwrap();
        let now = utc("2026-03-10T00:00:00Z");
        seed(&store, 2200, "router-1", now - ChronoDuration::days(8)).await;

        let tracker = Tracker::new(
            store.clone(),
            PortRange::new(2200, 2202).unwrap(),
            HeartbeatPolicy::default(),
        );
        assert!(tracker.verify_ownership_at(2200, "router-1", now).await.unwrap().is_owner);

        let reaper = Reaper::new(store, ChronoDuration::days(7));
        assert!(reaper.sweep(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_sweep_finds_nothing_new() {
        let store = Store::open_in_memory().unwrap();
        let now = utc("2026-03-10T00:00:00Z");
        seed(&store, 2200, "router-1", now - ChronoDuration::days(30)).await;
        seed(&store, 2201, "router-2", now - ChronoDuration::days(9)).await;

        let reaper = Reaper::new(store.clone(), ChronoDuration::days(7));
        let first = reaper.sweep(now).await.unwrap();
        assert_eq!(first.iter().map(|a| a.port).collect::<Vec<_>>(), vec![2200, 2201]);
        assert!(reaper.sweep(now).await.unwrap().is_empty());

        let range = PortRange::new(2200, 2202).unwrap();
        let counts = store.call(move |conn| db::status_counts(conn, range)).await.unwrap();
        assert_eq!(counts, (0, 0, 2));
    }

    #[tokio::test]
    async fn window_beyond_calendar_expires_nothing() {
        let store = Store::open_in_memory().unwrap();
        let now = utc("2026-03-10T00:00:00Z");
        seed(&store, 2200, "router-1", now - ChronoDuration::days(3000)).await;

        let reaper = Reaper::new(store.clone(), ChronoDuration::days(1_000_000_000));
        assert!(reaper.sweep(now).await.unwrap().is_empty());

        let active = store.call(|conn| db::list_active(conn)).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Store::open_in_memory().unwrap();
        let reaper = Reaper::new(store, ChronoDuration::days(7));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(NaiveTime::from_hms_opt(3, 0, 0).unwrap(), rx));

        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
