use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::docker::docker_gateway::ContainerRuntime;
use crate::error::IdeError;
use crate::models::container_models::{
    ContainerSpec, ContainerState, IdeLanguage, SessionRow, SortKey,
};
use crate::models::session_models::SessionIdentity;
use crate::services::heartbeat_service::HeartbeatService;
use crate::services::listing_service::ListingService;
use crate::services::ports_service::PortAllocator;
use crate::store::SessionStore;
use crate::utils::clock::Clock;

/// Lab facts consumed from the relational repository.
#[derive(Debug, Clone)]
pub struct LabRecord {
    pub course_id: u64,
    pub deadline: Option<DateTime<Utc>>,
}

/// Course facts consumed from the relational repository.
#[derive(Debug, Clone)]
pub struct CourseRecord {
    pub teacher_id: u64,
    pub language: IdeLanguage,
}

/// Read side of the course/lab repository. Lives outside this subsystem;
/// only the two lookups the orchestrator needs are consumed here.
#[async_trait]
pub trait LabDirectory: Send + Sync {
    async fn lab(&self, lab_id: u64) -> Result<LabRecord, IdeError>;
    async fn course(&self, course_id: u64) -> Result<CourseRecord, IdeError>;
}

/// Connection info handed back to the client opening an IDE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub port: u16,
    pub token: String,
    /// `true` when an already-running container answered the request without
    /// any runtime mutation.
    pub reused: bool,
}

/// Orchestrates one container per session: reuse it while it runs, restart
/// it while its port is still free, recreate it otherwise. Runtime state is
/// the only session table there is.
pub struct IdeService {
    runtime: Arc<dyn ContainerRuntime>,
    directory: Arc<dyn LabDirectory>,
    clock: Arc<dyn Clock>,
    ports: Arc<PortAllocator>,
    settings: Arc<Settings>,
    heartbeats: HeartbeatService,
    listing: ListingService,
}

impl IdeService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn LabDirectory>,
        clock: Arc<dyn Clock>,
        ports: Arc<PortAllocator>,
        settings: Arc<Settings>,
    ) -> Self {
        let heartbeats =
            HeartbeatService::new(store, clock.clone(), settings.sweeper.teacher_ttl());
        let listing =
            ListingService::new(runtime.clone(), settings.docker.container_prefix.clone());
        IdeService {
            runtime,
            directory,
            clock,
            ports,
            settings,
            heartbeats,
            listing,
        }
    }

    /// Opens (or re-opens) the student's IDE for a lab. Editing is allowed
    /// until the lab's deadline passes; afterwards the workspace is mounted
    /// read-only. The first non-reused open seeds the heartbeat record.
    pub async fn open_student_session(
        &self,
        ctx: &CancellationToken,
        lab_id: u64,
        student_id: u64,
    ) -> Result<SessionHandle, IdeError> {
        let lab = self.directory.lab(lab_id).await?;
        let course = self.directory.course(lab.course_id).await?;
        let can_edit = lab
            .deadline
            .is_none_or(|deadline| self.clock.now() <= deadline);

        let identity = SessionIdentity::for_student(lab_id, student_id);
        let handle = self
            .open_session(ctx, &identity, course.language, can_edit)
            .await?;
        if !handle.reused {
            self.heartbeats.seed_student(lab_id, student_id).await?;
        }
        Ok(handle)
    }

    /// Opens a read-only view of the student's workspace for the teacher who
    /// owns the lab's course.
    pub async fn open_teacher_session(
        &self,
        ctx: &CancellationToken,
        lab_id: u64,
        student_id: u64,
        teacher_id: u64,
    ) -> Result<SessionHandle, IdeError> {
        let lab = self.directory.lab(lab_id).await?;
        let course = self.directory.course(lab.course_id).await?;
        if course.teacher_id != teacher_id {
            debug!(
                teacher_id,
                owner = course.teacher_id,
                "teacher does not own the lab's course"
            );
            return Err(IdeError::Forbidden);
        }

        let identity = SessionIdentity::for_teacher(lab_id, student_id, teacher_id);
        let handle = self
            .open_session(ctx, &identity, course.language, false)
            .await?;
        self.heartbeats
            .record_teacher(lab_id, student_id, teacher_id)
            .await?;
        Ok(handle)
    }

    pub async fn heartbeat_student(&self, lab_id: u64, student_id: u64) -> Result<(), IdeError> {
        self.heartbeats.record_student(lab_id, student_id).await
    }

    pub async fn heartbeat_teacher(
        &self,
        lab_id: u64,
        student_id: u64,
        teacher_id: u64,
    ) -> Result<(), IdeError> {
        self.heartbeats
            .record_teacher(lab_id, student_id, teacher_id)
            .await
    }

    pub async fn stop_session(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
    ) -> Result<(), IdeError> {
        self.runtime.stop(ctx, container_id).await
    }

    pub async fn list_sessions(
        &self,
        ctx: &CancellationToken,
        offset: usize,
        limit: usize,
        key: SortKey,
        descending: bool,
    ) -> Result<(Vec<SessionRow>, usize), IdeError> {
        self.listing.list(ctx, offset, limit, key, descending).await
    }

    pub async fn remove_sessions_by_name(
        &self,
        ctx: &CancellationToken,
        names: &[String],
    ) -> Result<(), IdeError> {
        if names.is_empty() {
            return Ok(());
        }
        self.runtime.remove(ctx, names).await
    }

    async fn open_session(
        &self,
        ctx: &CancellationToken,
        identity: &SessionIdentity,
        language: IdeLanguage,
        can_edit: bool,
    ) -> Result<SessionHandle, IdeError> {
        let name = identity.container_name(&self.settings.docker.container_prefix);
        match self.runtime.state(ctx, &name).await? {
            ContainerState::Running => self.reuse(ctx, &name).await,
            ContainerState::Stopped => {
                if let Some(handle) = self.try_restart(ctx, &name).await? {
                    return Ok(handle);
                }
                self.create_session(ctx, identity, &name, language, can_edit)
                    .await
            }
            ContainerState::Absent => {
                self.create_session(ctx, identity, &name, language, can_edit)
                    .await
            }
        }
    }

    async fn reuse(&self, ctx: &CancellationToken, name: &str) -> Result<SessionHandle, IdeError> {
        let port = self.runtime.bound_port(ctx, name).await?;
        let token = self.runtime.access_token(ctx, name).await?;
        debug!(%name, port, "reusing running container");
        Ok(SessionHandle {
            port,
            token,
            reused: true,
        })
    }

    /// Restart path for a stopped container. `Ok(None)` means the container
    /// was unusable and has been cleared out of the way; the caller falls
    /// through to recreation.
    async fn try_restart(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<Option<SessionHandle>, IdeError> {
        let port = self.runtime.bound_port(ctx, name).await?;
        if PortAllocator::probe(port).await {
            match self.runtime.start(ctx, name).await {
                Ok(()) => {
                    let token = self.runtime.access_token(ctx, name).await?;
                    debug!(%name, port, "restarted stopped container");
                    return Ok(Some(SessionHandle {
                        port,
                        token,
                        reused: false,
                    }));
                }
                Err(IdeError::Canceled) => return Err(IdeError::Canceled),
                Err(err) => warn!(%name, "start failed, recreating: {err}"),
            }
        } else {
            warn!(%name, port, "previously bound port was reclaimed, recreating");
        }

        // removal failure must not fail the open; creation will surface a
        // name conflict if the container is truly still there
        let names = [name.to_string()];
        match self.runtime.remove(ctx, &names).await {
            Ok(()) | Err(IdeError::NotFound) => {}
            Err(IdeError::Canceled) => return Err(IdeError::Canceled),
            Err(err) => warn!(%name, "removing stale container failed: {err}"),
        }
        Ok(None)
    }

    async fn create_session(
        &self,
        ctx: &CancellationToken,
        identity: &SessionIdentity,
        name: &str,
        language: IdeLanguage,
        can_edit: bool,
    ) -> Result<SessionHandle, IdeError> {
        let port = self.ports.allocate().await?;
        let token = Uuid::new_v4().simple().to_string();
        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.settings.images.for_language(language).to_string(),
            host_port: port,
            internal_port: self.settings.docker.internal_port,
            token: token.clone(),
            workspace: self.workspace_dir(identity),
            read_only: !can_edit,
            cpus: self.settings.docker.cpus,
            memory: self.settings.docker.memory.clone(),
            memory_swap: self.settings.docker.memory_swap.clone(),
        };

        match self.runtime.create(ctx, &spec).await {
            Ok(()) => {}
            Err(IdeError::Canceled) => return Err(IdeError::Canceled),
            Err(err) => {
                // a concurrent open for the same brand-new session may have
                // won the duplicate-name race; if the container is up now,
                // answer with its connection info instead of failing
                if self.runtime.state(ctx, name).await? == ContainerState::Running {
                    debug!(%name, "lost create race to a concurrent open, reusing");
                    return self.reuse(ctx, name).await;
                }
                return Err(err);
            }
        }

        // give the IDE inside the container a moment to come up
        tokio::time::sleep(Duration::from_secs(self.settings.docker.settle_delay_secs)).await;
        Ok(SessionHandle {
            port,
            token,
            reused: false,
        })
    }

    fn workspace_dir(&self, identity: &SessionIdentity) -> PathBuf {
        self.settings
            .paths
            .workspace_base
            .join(format!("workspace-{}", identity.lab_id))
            .join(identity.student_id.to_string())
    }
}
