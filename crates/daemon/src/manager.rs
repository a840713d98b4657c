use crate::allocator::{PortAllocator, RetryPolicy};
use crate::db::{self, Store};
use crate::error::{PortError, Result};
use crate::tracker::{HeartbeatPolicy, Tracker};
use tunnelport_common::{
    Allocation, Credentials, HeartbeatOutcome, Metadata, PortRange, Stats, VerifyResponse,
};

/// Every inbound call shape of the service, over one shared store.
#[derive(Clone)]
pub struct PortManager {
    store: Store,
    range: PortRange,
    allocator: PortAllocator,
    tracker: Tracker,
}

impl PortManager {
    pub fn new(store: Store, range: PortRange, policy: HeartbeatPolicy, retry: RetryPolicy) -> Self {
        Self {
            allocator: PortAllocator::with_retry(store.clone(), range, retry),
            tracker: Tracker::new(store.clone(), range, policy),
            store,
            range,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub async fn allocate(
        &self,
        owner_id: &str,
        credentials: Option<Credentials>,
        metadata: Metadata,
    ) -> Result<Allocation> {
        self.allocator.allocate(owner_id, credentials, metadata).await
    }

    pub async fn release(&self, port: u16, owner_id: &str) -> Result<()> {
        self.allocator.release(port, owner_id).await
    }

    pub async fn update_credentials(&self, port: u16, credentials: Credentials) -> Result<()> {
        self.allocator.update_credentials(port, credentials).await
    }

    pub async fn heartbeat(&self, port: u16, owner_id: &str) -> Result<HeartbeatOutcome> {
        self.tracker.heartbeat(port, owner_id).await
    }

    pub async fn verify(&self, port: u16, owner_id: &str) -> Result<VerifyResponse> {
        self.tracker.verify_ownership(port, owner_id).await
    }

    pub async fn credentials(&self, port: u16) -> Result<Option<Credentials>> {
        self.store
            .call(move |conn| db::active_at_port(conn, port))
            .await?
            .map(|allocation| allocation.credentials)
            .ok_or_else(|| PortError::not_found(port))
    }

    pub async fn status(&self, port: u16) -> Result<Allocation> {
        self.store
            .call(move |conn| db::latest_for_port(conn, port))
            .await?
            .ok_or_else(|| PortError::not_found(port))
    }

    pub async fn list_active(&self) -> Result<Vec<Allocation>> {
        self.store.call(|conn| db::list_active(conn)).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        let range = self.range;
        let (active, released, expired) = self
            .store
            .call(move |conn| db::status_counts(conn, range))
            .await?;
        let total_ports = range.len();
        Ok(Stats {
            total_ports,
            available: total_ports.saturating_sub(active),
            active,
            released,
            expired,
        })
    }
}
