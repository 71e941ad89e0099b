//! Cancellation registry for running import invocations
//!
//! The durable `cancelled` status is the source of truth; this registry lets
//! a cancel request reach an invocation running in this process without
//! waiting for the next status poll. Entries are owner-checked and removed
//! by `JobGuard` when the invocation ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process-wide registry
pub static CANCELLATION: Lazy<CancellationRegistry> = Lazy::new(CancellationRegistry::default);

struct JobEntry {
    token: CancellationToken,
    owner_id: Uuid,
    /// Registration that created the entry
    generation: u64,
}

/// Removes its own registration from the registry when dropped
pub struct JobGuard {
    job_id: Uuid,
    generation: u64,
    registry: CancellationRegistry,
}

impl JobGuard {
    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.job_id)
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.release(&self.job_id, self.generation);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelError {
    /// Caller does not own the job
    NotOwner,
}

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    generations: Arc<AtomicU64>,
}

impl CancellationRegistry {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track an invocation of `job_id`, replacing an older invocation's
    /// entry. An entry whose token is already cancelled is adopted instead,
    /// so the invocation observes it on its first poll.
    pub fn register(&self, job_id: Uuid, owner_id: Uuid) -> JobGuard {
        let mut jobs = self.jobs.lock();
        let adopted = jobs
            .get(&job_id)
            .filter(|e| e.token.is_cancelled())
            .map(|e| e.generation);
        let generation = match adopted {
            Some(generation) => generation,
            None => {
                let generation = self.next_generation();
                jobs.insert(
                    job_id,
                    JobEntry {
                        token: CancellationToken::new(),
                        owner_id,
                        generation,
                    },
                );
                generation
            }
        };
        JobGuard {
            job_id,
            generation,
            registry: self.clone(),
        }
    }

    /// Cancel a running invocation on behalf of `caller_id`.
    ///
    /// `Ok(false)` when nothing is running for the job in this process.
    pub fn cancel(&self, job_id: &Uuid, caller_id: Uuid) -> Result<bool, CancelError> {
        let jobs = self.jobs.lock();
        match jobs.get(job_id) {
            Some(entry) => {
                if entry.owner_id != caller_id {
                    return Err(CancelError::NotOwner);
                }
                entry.token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark a job cancelled before any invocation has picked it up
    #[cfg(test)]
    pub fn pre_cancel(&self, job_id: Uuid, caller_id: Uuid) {
        let token = CancellationToken::new();
        token.cancel();
        let generation = self.next_generation();
        self.jobs.lock().insert(
            job_id,
            JobEntry {
                token,
                owner_id: caller_id,
                generation,
            },
        );
    }

    pub fn is_cancelled(&self, job_id: &Uuid) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .map_or(false, |e| e.token.is_cancelled())
    }

    /// Drop the entry only if it still belongs to `generation`
    fn release(&self, job_id: &Uuid, generation: u64) {
        let mut jobs = self.jobs.lock();
        if jobs.get(job_id).map_or(false, |e| e.generation == generation) {
            jobs.remove(job_id);
        }
    }

    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_job_starts_uncancelled() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        let guard = reg.register(job_id, Uuid::new_v4());

        assert!(!guard.is_cancelled());
    }

    #[test]
    fn test_owner_can_cancel() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        let guard = reg.register(job_id, owner_id);

        assert_eq!(reg.cancel(&job_id, owner_id), Ok(true));
        assert!(guard.is_cancelled());
    }

    #[test]
    fn test_other_user_cannot_cancel() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();
        let guard = reg.register(job_id, Uuid::new_v4());

        assert_eq!(reg.cancel(&job_id, Uuid::new_v4()), Err(CancelError::NotOwner));
        assert!(!guard.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_job_returns_false() {
        let reg = CancellationRegistry::default();
        assert_eq!(reg.cancel(&Uuid::new_v4(), Uuid::new_v4()), Ok(false));
    }

    #[test]
    fn test_register_keeps_pre_cancelled_token() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();

        reg.pre_cancel(job_id, owner_id);
        let guard = reg.register(job_id, owner_id);

        assert!(guard.is_cancelled());
    }

    #[test]
    fn test_guard_drop_removes_entry() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        {
            let _guard = reg.register(job_id, Uuid::new_v4());
            assert!(reg.contains(&job_id));
        }

        assert!(!reg.contains(&job_id));
    }

    #[test]
    fn test_stale_guard_keeps_newer_registration() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();

        let older = reg.register(job_id, owner_id);
        let newer = reg.register(job_id, owner_id);
        drop(older);

        assert!(reg.contains(&job_id));
        assert_eq!(reg.cancel(&job_id, owner_id), Ok(true));
        assert!(newer.is_cancelled());

        drop(newer);
        assert!(!reg.contains(&job_id));
    }
}
