use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::IdeError;
use crate::models::heartbeat_models::{HeartbeatStat, TEACHER_PRESENCE_BODY, store_key};
use crate::models::session_models::SessionIdentity;
use crate::store::SessionStore;
use crate::utils::clock::Clock;

/// Tracks last-activity timestamps per session. Student records live until
/// the sweeper reclaims them; teacher views are presence keys that expire on
/// their own.
pub struct HeartbeatService {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    teacher_ttl: Duration,
}

impl HeartbeatService {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, teacher_ttl: Duration) -> Self {
        HeartbeatService {
            store,
            clock,
            teacher_ttl,
        }
    }

    /// Refreshes `last_visited_at` for an open student session. Fails with
    /// [`IdeError::NoActiveSession`] when the session was never opened or
    /// has already been swept.
    pub async fn record_student(&self, lab_id: u64, student_id: u64) -> Result<(), IdeError> {
        let key = store_key(&SessionIdentity::for_student(lab_id, student_id));
        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or(IdeError::NoActiveSession)?;
        let mut stat = HeartbeatStat::from_bytes(&bytes)?;
        stat.last_visited_at = self.clock.now().timestamp();
        self.store.set(&key, stat.to_bytes(), None).await
    }

    /// Rewrites the teacher presence key unconditionally; its TTL is the
    /// entire lifecycle.
    pub async fn record_teacher(
        &self,
        lab_id: u64,
        student_id: u64,
        teacher_id: u64,
    ) -> Result<(), IdeError> {
        let key = store_key(&SessionIdentity::for_teacher(lab_id, student_id, teacher_id));
        self.store
            .set(&key, TEACHER_PRESENCE_BODY.to_vec(), Some(self.teacher_ttl))
            .await
    }

    /// Seeds the record on first open. Set-if-absent so two concurrent opens
    /// of a brand-new session cannot reset each other's timestamps.
    pub async fn seed_student(&self, lab_id: u64, student_id: u64) -> Result<(), IdeError> {
        let key = store_key(&SessionIdentity::for_student(lab_id, student_id));
        let now = self.clock.now().timestamp();
        let stat = HeartbeatStat {
            created_at: now,
            last_visited_at: now,
        };
        let seeded = self.store.set_nx(&key, stat.to_bytes(), None).await?;
        if !seeded {
            debug!(%key, "heartbeat record already seeded");
        }
        Ok(())
    }
}
