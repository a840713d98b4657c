//! Liveness and ownership tracking.
//!
//! Heartbeats are cheap, lenient and best-effort. Verification is the authoritative check,
//! and it alone moves `last_verification` forward unless the heartbeat policy says otherwise.

use crate::db::{self, Store};
use crate::error::{PortError, Result};
use chrono::{DateTime, Utc};
use tunnelport_common::{HeartbeatOutcome, Metadata, PortRange, VerifyResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Create an allocation when a heartbeat names a port with nothing active on it.
    pub self_heal: bool,
    /// Let an exact `(port, owner)` heartbeat also count as a verification.
    pub refresh_verification: bool,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            self_heal: true,
            refresh_verification: false,
        }
    }
}

#[derive(Clone)]
pub struct Tracker {
    store: Store,
    range: PortRange,
    policy: HeartbeatPolicy,
}

impl Tracker {
    pub fn new(store: Store, range: PortRange, policy: HeartbeatPolicy) -> Self {
        Self { store, range, policy }
    }

    pub async fn heartbeat(&self, port: u16, owner_id: &str) -> Result<HeartbeatOutcome> {
        self.heartbeat_at(port, owner_id, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, port: u16, owner_id: &str, now: DateTime<Utc>) -> Result<HeartbeatOutcome> {
        let owner = owner_id.to_string();
        let refresh = self.policy.refresh_verification;
        let (exact, by_port) = self
            .store
            .call(move |conn| {
                if db::touch_heartbeat(conn, port, Some(&owner), refresh, now)? {
                    return Ok((true, false));
                }
                Ok((false, db::touch_heartbeat(conn, port, None, false, now)?))
            })
            .await?;

        if exact {
            tracing::trace!(port, owner_id, "heartbeat");
            return Ok(HeartbeatOutcome::Matched);
        }
        if by_port {
            tracing::warn!(port, owner_id, "heartbeat matched port only, owner id differs from stored owner");
            return Ok(HeartbeatOutcome::Degraded);
        }

        if !self.policy.self_heal {
            return Err(PortError::not_found_for(port, owner_id));
        }
        if !self.range.contains(port) {
            tracing::warn!(port, owner_id, range = %self.range, "heartbeat for port outside range ignored");
            return Ok(HeartbeatOutcome::Ignored);
        }

        let owner = owner_id.to_string();
        let mut metadata = Metadata::new();
        metadata.insert("origin".to_string(), "heartbeat".to_string());
        let inserted = self
            .store
            .call(move |conn| db::insert_active(conn, port, &owner, None, &metadata, now))
            .await;

        match inserted {
            Ok(_) => {
                tracing::warn!(port, owner_id, "registered allocation from heartbeat");
                Ok(HeartbeatOutcome::Registered)
            }
            Err(err) if err.is_unique_violation() => {
                tracing::warn!(port, owner_id, "heartbeat registration conflicts with an active allocation");
                Ok(HeartbeatOutcome::Ignored)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn verify_ownership(&self, port: u16, owner_id: &str) -> Result<VerifyResponse> {
        self.verify_ownership_at(port, owner_id, Utc::now()).await
    }

    pub async fn verify_ownership_at(
        &self,
        port: u16,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyResponse> {
        let owner = owner_id.to_string();
        let (verified_at, holder) = self
            .store
            .call(move |conn| {
                if let Some(at) = db::touch_verification(conn, port, &owner, now)? {
                    return Ok((Some(at), None));
                }
                Ok((None, db::active_at_port(conn, port)?))
            })
            .await?;

        if let Some(verified_at) = verified_at {
            tracing::debug!(port, owner_id, "ownership verified");
            return Ok(VerifyResponse {
                is_owner: true,
                verified_at: Some(verified_at),
                reason: None,
            });
        }

        let reason = match holder {
            Some(_) => format!("port {} is allocated to a different owner", port),
            None => format!("port {} has no active allocation", port),
        };
        tracing::info!(port, owner_id, %reason, "ownership verification failed");
        Ok(VerifyResponse {
            is_owner: false,
            verified_at: None,
            reason: Some(reason),
        })
    }
}
