//! Process-local registry of cancellation handles for in-flight jobs.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Map from job id to the cancellation token of its current run.
///
/// Workers register a token while they hold a lease; the API layer signals it
/// on cancel requests. Purely in-process — the durable CANCEL_REQUESTED
/// status covers jobs not running locally.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a job.
    pub fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("CancelRegistry mutex poisoned")
            .insert(job_id, token.clone());
        token
    }

    /// Drop the token for a job after its run ends.
    pub fn remove(&self, job_id: Uuid) {
        self.tokens
            .lock()
            .expect("CancelRegistry mutex poisoned")
            .remove(&job_id);
    }

    /// Signal the token for a job, if it is running locally.
    pub fn signal(&self, job_id: Uuid) -> bool {
        let tokens = self.tokens.lock().expect("CancelRegistry mutex poisoned");
        match tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a job currently has a registered handle.
    pub fn is_registered(&self, job_id: Uuid) -> bool {
        self.tokens
            .lock()
            .expect("CancelRegistry mutex poisoned")
            .contains_key(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_signal_remove() {
        let registry = CancelRegistry::new();
        let job_id = Uuid::now_v7();

        let token = registry.register(job_id);
        assert!(registry.is_registered(job_id));
        assert!(!token.is_cancelled());

        assert!(registry.signal(job_id));
        assert!(token.is_cancelled());

        registry.remove(job_id);
        assert!(!registry.is_registered(job_id));
    }

    #[test]
    fn signal_unknown_job_is_false() {
        let registry = CancelRegistry::new();
        assert!(!registry.signal(Uuid::now_v7()));
    }
}
