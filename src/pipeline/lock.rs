//! Distributed lease lock over the `job_locks` table
//!
//! Acquisition is a single conditional upsert: it wins when no row exists
//! or the current lease has expired. A live lease is never taken over,
//! not even by the same owner, so one worker cannot overlap itself.

use super::error::PipelineError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Current `job_locks` row for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRecord {
    pub job_name: String,
    pub owner_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

pub struct LeaseLock {
    conn: Arc<Mutex<Connection>>,
    job_name: String,
    owner_id: String,
    lease_secs: i64,
}

impl LeaseLock {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        job_name: impl Into<String>,
        owner_id: impl Into<String>,
        lease_secs: i64,
    ) -> Self {
        Self {
            conn,
            job_name: job_name.into(),
            owner_id: owner_id.into(),
            lease_secs,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Try to take the lease at `now`
    ///
    /// Returns None when another live lease exists. The returned guard
    /// releases the lease when dropped.
    pub fn try_acquire(&self, now: i64) -> Result<Option<LeaseGuard<'_>>, PipelineError> {
        let expires_at = now + self.lease_secs;
        let conn = self.conn.lock()?;

        let changes = conn.execute(
            r#"
            INSERT INTO job_locks (job_name, owner_id, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(job_name) DO UPDATE SET
                owner_id = excluded.owner_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE job_locks.expires_at <= excluded.acquired_at
            "#,
            params![self.job_name, self.owner_id, now, expires_at],
        )?;

        if changes == 0 {
            return Ok(None);
        }

        log::debug!(
            "🔒 {} acquired lease on '{}' until {}",
            self.owner_id, self.job_name, expires_at
        );
        Ok(Some(LeaseGuard {
            lock: self,
            expires_at,
        }))
    }

    /// Push the expiry of a lease we hold
    ///
    /// False when the lease is no longer ours (expired and taken over).
    pub fn heartbeat(&self, now: i64) -> Result<bool, PipelineError> {
        let conn = self.conn.lock()?;
        self.heartbeat_with(&conn, now)
    }

    /// `heartbeat` on a connection the caller already holds locked
    pub fn heartbeat_with(&self, conn: &Connection, now: i64) -> Result<bool, PipelineError> {
        let changes = conn.execute(
            "UPDATE job_locks SET expires_at = ?3
             WHERE job_name = ?1 AND owner_id = ?2",
            params![self.job_name, self.owner_id, now + self.lease_secs],
        )?;
        Ok(changes > 0)
    }

    /// Delete our lease row; no-op when someone else holds it
    pub fn release(&self) -> Result<bool, PipelineError> {
        let conn = self.conn.lock()?;
        let changes = conn.execute(
            "DELETE FROM job_locks WHERE job_name = ?1 AND owner_id = ?2",
            params![self.job_name, self.owner_id],
        )?;
        Ok(changes > 0)
    }

    pub fn holder(&self) -> Result<Option<LeaseRecord>, PipelineError> {
        let conn = self.conn.lock()?;
        current_lease(&conn, &self.job_name)
    }
}

pub fn current_lease(conn: &Connection, job_name: &str) -> Result<Option<LeaseRecord>, PipelineError> {
    let lease = conn
        .query_row(
            "SELECT job_name, owner_id, acquired_at, expires_at FROM job_locks WHERE job_name = ?1",
            [job_name],
            |row| {
                Ok(LeaseRecord {
                    job_name: row.get(0)?,
                    owner_id: row.get(1)?,
                    acquired_at: row.get(2)?,
                    expires_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(lease)
}

/// Held lease; released on drop on every exit path
pub struct LeaseGuard<'a> {
    lock: &'a LeaseLock,
    expires_at: i64,
}

impl LeaseGuard<'_> {
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        match self.lock.release() {
            Ok(true) => log::debug!("🔓 Released lease on '{}'", self.lock.job_name),
            Ok(false) => log::warn!(
                "⚠️  Lease on '{}' was no longer ours at release",
                self.lock.job_name
            ),
            // Expiry reclaims the lease
            Err(e) => log::error!(
                "❌ Failed to release lease on '{}' (expires {}): {}",
                self.lock.job_name, self.expires_at, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::open_database;
    use crate::pipeline::db::test_support::memory_db;

    fn shared(conn: Connection) -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn test_single_owner_until_release() {
        let conn = shared(memory_db());
        let a = LeaseLock::new(conn.clone(), "aggregation", "worker-a", 300);
        let b = LeaseLock::new(conn.clone(), "aggregation", "worker-b", 300);

        let guard = a.try_acquire(1_000).unwrap().expect("first acquire");
        assert_eq!(guard.expires_at(), 1_300);
        assert!(b.try_acquire(1_001).unwrap().is_none());
        // Same owner cannot stack a second run either
        assert!(a.try_acquire(1_002).unwrap().is_none());
        assert_eq!(b.holder().unwrap().unwrap().owner_id, "worker-a");

        drop(guard);
        assert!(a.holder().unwrap().is_none());
        assert!(b.try_acquire(1_003).unwrap().is_some());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let conn = shared(memory_db());
        let a = LeaseLock::new(conn.clone(), "aggregation", "worker-a", 300);
        let b = LeaseLock::new(conn.clone(), "aggregation", "worker-b", 300);

        // Simulate a crashed holder: acquire without ever releasing
        std::mem::forget(a.try_acquire(1_000).unwrap().unwrap());

        assert!(b.try_acquire(1_299).unwrap().is_none());
        let guard = b.try_acquire(1_300).unwrap().expect("takeover after expiry");

        // The stale owner can neither extend nor remove the new lease
        assert!(!a.heartbeat(1_301).unwrap());
        assert!(!a.release().unwrap());
        assert_eq!(b.holder().unwrap().unwrap().owner_id, "worker-b");
        drop(guard);
    }

    #[test]
    fn test_heartbeat_extends_only_own_lease() {
        let conn = shared(memory_db());
        let a = LeaseLock::new(conn.clone(), "aggregation", "worker-a", 300);
        let b = LeaseLock::new(conn.clone(), "aggregation", "worker-b", 300);

        let _guard = a.try_acquire(1_000).unwrap().unwrap();
        assert!(a.heartbeat(1_200).unwrap());
        assert!(!b.heartbeat(1_200).unwrap());
        assert_eq!(a.holder().unwrap().unwrap().expires_at, 1_500);
        assert!(b.try_acquire(1_400).unwrap().is_none());
    }

    #[test]
    fn test_jobs_are_locked_independently() {
        let conn = shared(memory_db());
        let agg = LeaseLock::new(conn.clone(), "aggregation", "worker-a", 300);
        let other = LeaseLock::new(conn.clone(), "verification", "worker-b", 300);

        let _g1 = agg.try_acquire(0).unwrap().unwrap();
        assert!(other.try_acquire(0).unwrap().is_some());
    }

    #[test]
    fn test_concurrent_attempts_exactly_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        drop(open_database(&path).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let conn = shared(open_database(&path).unwrap());
                    let lock = LeaseLock::new(conn, "aggregation", format!("worker-{}", i), 300);
                    let acquired = lock.try_acquire(5_000).unwrap();
                    // Keep the lease held so losers cannot slip in after a release
                    let won = acquired.is_some();
                    std::mem::forget(acquired);
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
