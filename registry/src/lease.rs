//! A lease-based lock that serializes garbage collection runs.
//!
//! The lock is a JSON record stored in the registry's own backend at
//! `gc/lock`. It carries a holder id and an expiry timestamp; a record past
//! its expiry is treated as abandoned and taken over. Holders renew the
//! lease periodically while a run is in progress.
//!
//! The storage backend offers no compare-and-swap, so acquisition is
//! check-write-verify: write our record, read it back, and treat a foreign
//! holder in the read-back as a lost race.

use camino::Utf8Path;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GcError, GcResult};
use crate::store::RegistryStore;

const LOCK_PATH: &str = "gc/lock";

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A held garbage collection lease.
#[derive(Debug)]
pub struct GcLease {
    store: RegistryStore,
    holder: Uuid,
    ttl: TimeDelta,
}

impl GcLease {
    /// The lease time-to-live applied when none is configured.
    pub const DEFAULT_TTL: std::time::Duration = std::time::Duration::from_secs(60);

    /// Try to acquire the garbage collection lease.
    ///
    /// Fails with [`GcError::LockHeld`] when another holder's unexpired
    /// record is present. Expired or unreadable records are taken over.
    #[tracing::instrument(skip_all, fields(ttl = ?ttl))]
    pub async fn acquire(store: RegistryStore, ttl: std::time::Duration) -> GcResult<Self> {
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|_| GcError::Config("lease ttl out of range".to_string()))?;

        match Self::read_record(&store).await? {
            Some(record) if !record.is_expired(Utc::now()) => {
                tracing::info!(
                    holder = %record.holder,
                    expires_at = %record.expires_at,
                    "lock is held"
                );
                return Err(GcError::LockHeld);
            }
            Some(record) => {
                tracing::warn!(
                    holder = %record.holder,
                    expired_at = %record.expires_at,
                    "taking over expired lock"
                );
            }
            None => {}
        }

        let lease = Self {
            store,
            holder: Uuid::new_v4(),
            ttl,
        };
        lease.write_record().await?;

        // Read-back guards against a concurrent acquisition racing our
        // write.
        match Self::read_record(&lease.store).await? {
            Some(record) if record.holder == lease.holder => {
                tracing::info!(holder = %lease.holder, "lease acquired");
                Ok(lease)
            }
            _ => Err(GcError::LockHeld),
        }
    }

    /// Extend the lease by its time-to-live.
    ///
    /// Fails with [`GcError::LockLost`] when the record is missing or held
    /// by someone else, meaning this run's lease expired and was taken over.
    #[tracing::instrument(skip_all, fields(holder = %self.holder))]
    pub async fn renew(&self) -> GcResult<()> {
        match Self::read_record(&self.store).await? {
            Some(record) if record.holder == self.holder => {
                self.write_record().await?;
                tracing::debug!("lease renewed");
                Ok(())
            }
            _ => Err(GcError::LockLost),
        }
    }

    /// Release the lease, removing the lock record if it is still ours.
    #[tracing::instrument(skip_all, fields(holder = %self.holder))]
    pub async fn release(&self) -> GcResult<()> {
        match Self::read_record(&self.store).await? {
            Some(record) if record.holder == self.holder => {
                match self.store.delete_object(Utf8Path::new(LOCK_PATH)).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
                tracing::info!("lease released");
            }
            _ => {
                tracing::warn!("lock record is no longer ours, leaving it in place");
            }
        }
        Ok(())
    }

    async fn read_record(store: &RegistryStore) -> GcResult<Option<LeaseRecord>> {
        let data = match store.read_object(Utf8Path::new(LOCK_PATH)).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!("unreadable lock record, treating as abandoned: {err}");
                Ok(None)
            }
        }
    }

    async fn write_record(&self) -> GcResult<()> {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: self.holder,
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        let data = serde_json::to_vec(&record)
            .map_err(|err| GcError::Config(format!("failed to encode lock record: {err}")))?;
        self.store
            .write_object(Utf8Path::new(LOCK_PATH), &data)
            .await?;
        Ok(())
    }
}
