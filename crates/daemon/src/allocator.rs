//! Port assignment over a fixed range.
//!
//! The allocator keeps no scan state between calls. Each request takes a snapshot of the
//! active ports, walks the free ones from the bottom of the range and relies on the store's
//! unique indexes to settle races between concurrent requests.

use crate::db::{self, Store};
use crate::error::{PortError, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Duration;
use tunnelport_common::{Allocation, Credentials, Metadata, PortRange};

/// Bounded backoff applied when an insert collides but the candidate turns out to be free.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(50),
        }
    }
}

/// Free ports of `range` in ascending order, given the currently occupied set.
pub fn free_ports(range: PortRange, occupied: &BTreeSet<u16>) -> impl Iterator<Item = u16> + '_ {
    range.iter().filter(move |port| !occupied.contains(port))
}

#[derive(Clone)]
pub struct PortAllocator {
    store: Store,
    range: PortRange,
    retry: RetryPolicy,
}

impl PortAllocator {
    pub fn new(store: Store, range: PortRange) -> Self {
        Self::with_retry(store, range, RetryPolicy::default())
    }

    pub fn with_retry(store: Store, range: PortRange, retry: RetryPolicy) -> Self {
        Self { store, range, retry }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Return the owner's active allocation, or assign the lowest free port to it.
    pub async fn allocate(
        &self,
        owner_id: &str,
        credentials: Option<Credentials>,
        metadata: Metadata,
    ) -> Result<Allocation> {
        if let Some(existing) = self.existing(owner_id, credentials.as_ref()).await? {
            return Ok(existing);
        }

        let range = self.range;
        let occupied = self.store.call(move |conn| db::active_ports(conn, range)).await?;
        self.allocate_from(owner_id, credentials, metadata, &occupied).await
    }

    async fn existing(&self, owner_id: &str, credentials: Option<&Credentials>) -> Result<Option<Allocation>> {
        let owner = owner_id.to_string();
        let creds = credentials.cloned();
        self.store
            .call(move |conn| {
                let Some(mut existing) = db::active_for_owner(conn, &owner)? else {
                    return Ok(None);
                };
                if let Some(creds) = creds {
                    if existing.credentials.as_ref() != Some(&creds) {
                        db::update_credentials(conn, existing.port, &creds)?;
                        existing.credentials = Some(creds);
                    }
                }
                Ok(Some(existing))
            })
            .await
    }

    async fn allocate_from(
        &self,
        owner_id: &str,
        credentials: Option<Credentials>,
        metadata: Metadata,
        occupied: &BTreeSet<u16>,
    ) -> Result<Allocation> {
        'ports: for port in free_ports(self.range, occupied) {
            for attempt in 1..=self.retry.max_attempts {
                let owner = owner_id.to_string();
                let creds = credentials.clone();
                let meta = metadata.clone();
                let inserted = self
                    .store
                    .call(move |conn| db::insert_active(conn, port, &owner, creds.as_ref(), &meta, Utc::now()))
                    .await;

                match inserted {
                    Ok(allocation) => {
                        tracing::info!(port, owner_id, "allocated port");
                        return Ok(allocation);
                    }
                    Err(err) if err.is_unique_violation() => {
                        if let Some(existing) = self.existing(owner_id, credentials.as_ref()).await? {
                            tracing::debug!(port = existing.port, owner_id, "owner registered concurrently");
                            return Ok(existing);
                        }
                        let taken = self.store.call(move |conn| db::active_at_port(conn, port)).await?;
                        if taken.is_some() {
                            tracing::debug!(port, owner_id, "lost race for port, trying next candidate");
                            continue 'ports;
                        }
                        if attempt < self.retry.max_attempts {
                            tracing::warn!(port, owner_id, attempt, "allocation collided, backing off");
                            tokio::time::sleep(self.retry.delay(attempt)).await;
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        tracing::warn!(owner_id, range = %self.range, "port range exhausted");
        Err(PortError::NoCapacity {
            min: self.range.min,
            max: self.range.max,
        })
    }

    /// Release the active allocation at `port`, provided `owner_id` holds it.
    pub async fn release(&self, port: u16, owner_id: &str) -> Result<()> {
        let owner = owner_id.to_string();
        let released = self.store.call(move |conn| db::release(conn, port, &owner)).await?;
        if !released {
            return Err(PortError::not_found_for(port, owner_id));
        }
        tracing::info!(port, owner_id, "released port");
        Ok(())
    }

    pub async fn update_credentials(&self, port: u16, credentials: Credentials) -> Result<()> {
        let updated = self
            .store
            .call(move |conn| db::update_credentials(conn, port, &credentials))
            .await?;
        if !updated {
            return Err(PortError::not_found(port));
        }
        tracing::debug!(port, "updated credentials");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        let store = Store::open_in_memory().unwrap();
        PortAllocator::new(store, PortRange::new(min, max).unwrap())
    }

    async fn alloc(allocator: &PortAllocator, owner: &str) -> Result<Allocation> {
        allocator.allocate(owner, None, Metadata::new()).await
    }

    #[test]
    fn free_ports_skips_occupied() {
        let range = PortRange::new(2200, 2204).unwrap();
        let occupied: BTreeSet<u16> = [2200, 2202].into_iter().collect();
        let free: Vec<u16> = free_ports(range, &occupied).collect();
        assert_eq!(free, vec![2201, 2203, 2204]);
    }

    #[tokio::test]
    async fn lifecycle_reuses_lowest_port() {
        let allocator = allocator(2200, 2202);

        assert_eq!(alloc(&allocator, "router-1").await.unwrap().port, 2200);
        assert_eq!(alloc(&allocator, "router-2").await.unwrap().port, 2201);
        allocator.release(2200, "router-1").await.unwrap();
        assert_eq!(alloc(&allocator, "router-3").await.unwrap().port, 2200);
    }

    #[tokio::test]
    async fn reallocation_is_idempotent() {
        let allocator = allocator(2200, 2202);
        let first = alloc(&allocator, "router-1").await.unwrap();
        let second = alloc(&allocator, "router-1").await.unwrap();
        assert_eq!(first.port, second.port);
        assert_eq!(first.allocated_at, second.allocated_at);
    }

    #[tokio::test]
    async fn reallocation_refreshes_credentials() {
        let allocator = allocator(2200, 2202);
        alloc(&allocator, "router-1").await.unwrap();
        let creds = Credentials {
            username: "root".to_string(),
            secret: "pw".to_string(),
        };
        let again = allocator
            .allocate("router-1", Some(creds.clone()), Metadata::new())
            .await
            .unwrap();
        assert_eq!(again.port, 2200);
        assert_eq!(again.credentials, Some(creds));
    }

    #[tokio::test]
    async fn exhausted_range_reports_no_capacity() {
        let allocator = allocator(2200, 2202);
        for owner in ["a", "b", "c"] {
            alloc(&allocator, owner).await.unwrap();
        }
        let err = alloc(&allocator, "d").await.unwrap_err();
        assert!(matches!(err, PortError::NoCapacity { min: 2200, max: 2202 }));

        allocator.release(2201, "b").await.unwrap();
        assert_eq!(alloc(&allocator, "d").await.unwrap().port, 2201);
    }

    #[tokio::test]
    async fn release_requires_matching_owner() {
        let allocator = allocator(2200, 2202);
        alloc(&allocator, "router-b").await.unwrap();
        let err = allocator.release(2200, "router-a").await.unwrap_err();
        assert!(matches!(err, PortError::NotFound { port: 2200, .. }));
        allocator.release(2200, "router-b").await.unwrap();
        assert!(allocator.release(2200, "router-b").await.is_err());
    }

    #[tokio::test]
    async fn update_credentials_requires_active_allocation() {
        let allocator = allocator(2200, 2202);
        let creds = Credentials {
            username: "u".to_string(),
            secret: "s".to_string(),
        };
        assert!(allocator.update_credentials(2200, creds.clone()).await.is_err());
        alloc(&allocator, "router-1").await.unwrap();
        allocator.update_credentials(2200, creds).await.unwrap();
    }

    #[tokio::test]
    async fn stale_snapshot_moves_to_next_candidate() {
        let allocator = allocator(2200, 2202);
        alloc(&allocator, "router-1").await.unwrap();

        // Pretend the snapshot was taken before router-1 claimed 2200.
        let stale = BTreeSet::new();
        let allocation = allocator
            .allocate_from("router-2", None, Metadata::new(), &stale)
            .await
            .unwrap();
        assert_eq!(allocation.port, 2201);
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.delay(1), Duration::from_millis(50));
        assert_eq!(retry.delay(2), Duration::from_millis(100));
        assert_eq!(retry.delay(5), Duration::from_millis(250));
    }

    fn with_retry(min: u16, max: u16, max_attempts: u32, step: Duration) -> PortAllocator {
        let store = Store::open_in_memory().unwrap();
        PortAllocator::with_retry(
            store,
            PortRange::new(min, max).unwrap(),
            RetryPolicy { max_attempts, step },
        )
    }

    // A unique index on metadata makes inserts collide with a released row, so the
    // candidate port stays free while every insert fails.
    async fn block_on_metadata(allocator: &PortAllocator, metadata: &Metadata) {
        let metadata = metadata.clone();
        allocator
            .store
            .call(move |conn| {
                db::insert_active(conn, 2299, "blocker", None, &metadata, Utc::now())?;
                db::release(conn, 2299, "blocker")?;
                conn.execute_batch("CREATE UNIQUE INDEX one_per_metadata ON allocations(metadata)")?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn collision_on_free_port_backs_off_a_bounded_number_of_times() {
        let step = Duration::from_millis(20);
        let allocator = with_retry(2200, 2201, 3, step);
        let mut metadata = Metadata::new();
        metadata.insert("site".to_string(), "lab".to_string());
        block_on_metadata(&allocator, &metadata).await;

        let started = std::time::Instant::now();
        let err = allocator.allocate("router-1", None, metadata).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, PortError::NoCapacity { min: 2200, max: 2201 }));
        // Two candidates, each sleeping after attempts 1 and 2 only.
        assert!(elapsed >= (step + step * 2) * 2, "backed off for only {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn backoff_retries_the_same_port_once_the_conflict_clears() {
        let allocator = with_retry(2200, 2201, 5, Duration::from_millis(100));
        let mut metadata = Metadata::new();
        metadata.insert("site".to_string(), "lab".to_string());
        block_on_metadata(&allocator, &metadata).await;

        let store = allocator.store.clone();
        let clear = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store
                .call(|conn| {
                    conn.execute("DELETE FROM allocations WHERE owner_id = 'blocker'", [])?;
                    Ok(())
                })
                .await
                .unwrap();
        });

        let allocation = allocator.allocate("router-1", None, metadata).await.unwrap();
        clear.await.unwrap();
        assert_eq!(allocation.port, 2200);
    }

    #[tokio::test]
    async fn store_failure_on_insert_is_returned_without_backoff() {
        let allocator = with_retry(2200, 2202, 5, Duration::from_secs(10));
        allocator
            .store
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER refuse_insert BEFORE INSERT ON allocations
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), alloc(&allocator, "router-1"))
            .await
            .expect("allocation kept retrying after a store failure");
        let err = result.unwrap_err();
        assert!(matches!(err, PortError::StoreUnavailable(_)));
        assert!(!err.is_unique_violation());
    }

    #[tokio::test]
    async fn missing_table_surfaces_as_store_unavailable() {
        let allocator = with_retry(2200, 2202, 5, Duration::from_secs(10));
        allocator
            .store
            .call(|conn| {
                conn.execute_batch("DROP TABLE allocations")?;
                Ok(())
            })
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), alloc(&allocator, "router-1"))
            .await
            .expect("allocation hung on a broken store");
        assert!(matches!(result, Err(PortError::StoreUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_owners_get_distinct_ports() {
        let allocator = Arc::new(allocator(2200, 2231));
        let mut handles = Vec::new();
        for i in 0..32 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .allocate(&format!("router-{}", i), None, Metadata::new())
                    .await
            }));
        }

        let mut ports = HashSet::new();
        for handle in handles {
            let allocation = handle.await.unwrap().unwrap();
            assert!(allocator.range().contains(allocation.port));
            assert!(ports.insert(allocation.port), "port {} handed out twice", allocation.port);
        }
        assert_eq!(ports.len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_of_one_owner_yields_one_port() {
        let allocator = Arc::new(allocator(2200, 2209));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move { alloc(&allocator, "router-1").await }));
        }
        let mut ports = HashSet::new();
        for handle in handles {
            ports.insert(handle.await.unwrap().unwrap().port);
        }
        assert_eq!(ports.len(), 1);
    }
}
