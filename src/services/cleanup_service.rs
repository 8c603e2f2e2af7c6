use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Settings;
use crate::docker::docker_gateway::ContainerRuntime;
use crate::error::IdeError;
use crate::models::heartbeat_models::{HeartbeatStat, store_key};
use crate::models::session_models::SessionIdentity;
use crate::store::SessionStore;
use crate::utils::clock::Clock;

/// Reclaims containers whose sessions have gone idle. Runs as a single
/// supervised background task; it talks only to the runtime and the
/// heartbeat store, never to request-scoped state.
pub struct CleanupService {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    sweep_interval: Duration,
    idle_timeout: Duration,
}

impl CleanupService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        CleanupService {
            runtime,
            store,
            clock,
            prefix: settings.docker.container_prefix.clone(),
            sweep_interval: settings.sweeper.interval(),
            idle_timeout: settings.sweeper.idle_timeout(),
        }
    }

    /// Starts the sweep loop. The task runs until `shutdown` is cancelled;
    /// callers own the token, so tests can single-step with
    /// [`sweep_once`](Self::sweep_once) instead.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("idle sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let started = Instant::now();
                match self.sweep_once(&shutdown).await {
                    Ok(()) => trace!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "sweep tick finished"
                    ),
                    Err(IdeError::Canceled) => {
                        info!("idle sweeper stopped");
                        return;
                    }
                    Err(err) => error!("sweep tick failed: {err}"),
                }
            }
        })
    }

    /// One sweep pass over every container carrying our prefix. Entries are
    /// handled independently so one failure cannot block the rest.
    pub async fn sweep_once(&self, ctx: &CancellationToken) -> Result<(), IdeError> {
        let names = self.runtime.list_names(ctx, &self.prefix).await?;
        if names.is_empty() {
            return Ok(());
        }

        let now = self.clock.now().timestamp();
        for name in names {
            let identity = match SessionIdentity::from_container_name(&self.prefix, &name) {
                Ok(identity) => identity,
                Err(_) => {
                    warn!(%name, "unrecognized container name in sweep, skipping");
                    continue;
                }
            };
            let key = store_key(&identity);
            if self.session_is_live(&identity, &key, now).await? {
                continue;
            }

            match self
                .runtime
                .remove(ctx, std::slice::from_ref(&name))
                .await
            {
                Ok(()) | Err(IdeError::NotFound) => {
                    self.store.del(&key).await?;
                    debug!(%name, "reclaimed idle container");
                }
                Err(IdeError::Canceled) => return Err(IdeError::Canceled),
                Err(err) => {
                    // record left intact so the next tick retries
                    warn!(%name, "reclaim failed, will retry next tick: {err}");
                }
            }
        }
        Ok(())
    }

    async fn session_is_live(
        &self,
        identity: &SessionIdentity,
        key: &str,
        now: i64,
    ) -> Result<bool, IdeError> {
        let value = self.store.get(key).await?;
        if identity.is_teacher_view() {
            // the presence key expiring is the idle signal
            return Ok(value.is_some());
        }
        match value {
            // record already swept or never seeded; the container lingers
            None => Ok(false),
            Some(bytes) => match HeartbeatStat::from_bytes(&bytes) {
                Ok(stat) => Ok(now - stat.last_visited_at <= self.idle_timeout.as_secs() as i64),
                Err(err) => {
                    warn!(%key, "corrupt heartbeat record left in place: {err}");
                    Ok(true)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::heartbeat_models::TEACHER_PRESENCE_BODY;
    use crate::store::InMemoryStore;
    use crate::testutil::{FakeClock, FakeRuntime};

    const NOW: i64 = 1_700_000_000;

    fn sweeper(
        runtime: Arc<FakeRuntime>,
        store: Arc<InMemoryStore>,
        clock: Arc<FakeClock>,
    ) -> CleanupService {
        CleanupService {
            runtime,
            store,
            clock,
            prefix: "mytheia".to_string(),
            sweep_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(64),
        }
    }

    async fn seed(store: &InMemoryStore, key: &str, last_visited_at: i64) {
        let stat = HeartbeatStat {
            created_at: last_visited_at,
            last_visited_at,
        };
        store.set(key, stat.to_bytes(), None).await.unwrap();
    }

    #[tokio::test]
    async fn reclaims_exactly_the_expired_session() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["mytheia-1-2", "mytheia-3-4"]);
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "hbs:1:2", NOW - 100).await; // past the 64s threshold
        seed(&store, "hbs:3:4", NOW - 10).await;
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(runtime.calls_of("remove"), vec!["mytheia-1-2"]);
        assert!(store.get("hbs:1:2").await.unwrap().is_none());
        assert!(store.get("hbs:3:4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn record_within_threshold_is_untouched() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["mytheia-1-2"]);
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "hbs:1:2", NOW - 64).await; // exactly at the threshold
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        assert!(runtime.calls_of("remove").is_empty());
        assert!(store.get("hbs:1:2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn container_without_a_record_is_reclaimed() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["mytheia-1-2"]);
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(runtime.calls_of("remove"), vec!["mytheia-1-2"]);
    }

    #[tokio::test]
    async fn teacher_view_lives_while_its_presence_key_does() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["mytheia-1-2-3", "mytheia-5-6-7"]);
        let store = Arc::new(InMemoryStore::new());
        store
            .set("hbt:1:2:3", TEACHER_PRESENCE_BODY.to_vec(), None)
            .await
            .unwrap();
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        // only the view whose key lapsed is reclaimed
        assert_eq!(runtime.calls_of("remove"), vec!["mytheia-5-6-7"]);
    }

    #[tokio::test]
    async fn failed_reclaim_keeps_the_record_for_retry() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["mytheia-1-2"]);
        runtime.fail_remove();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "hbs:1:2", NOW - 100).await;
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        assert!(store.get("hbs:1:2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn one_failing_entry_does_not_block_the_rest() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_names(&["not-ours", "mytheia-1-2"]);
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "hbs:1:2", NOW - 100).await;
        let clock = Arc::new(FakeClock::at(NOW));
        let sweeper = sweeper(runtime.clone(), store.clone(), clock);

        sweeper.sweep_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(runtime.calls_of("remove"), vec!["mytheia-1-2"]);
    }
}
