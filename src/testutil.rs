//! Hand-rolled fakes shared by the service tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::docker::docker_gateway::{ContainerRuntime, parse_created_at};
use crate::error::IdeError;
use crate::models::container_models::{
    ContainerSpec, ContainerState, ListRow, UsageRow, UsageSample,
};
use crate::services::ide_service::{CourseRecord, LabDirectory, LabRecord};
use crate::utils::clock::Clock;

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.docker.settle_delay_secs = 0;
    settings
}

#[derive(Debug)]
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn at(unix_secs: i64) -> Self {
        FakeClock {
            now: AtomicI64::new(unix_secs),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.now.load(Ordering::SeqCst), 0)
            .unwrap()
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    labs: Mutex<HashMap<u64, LabRecord>>,
    courses: Mutex<HashMap<u64, CourseRecord>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        FakeDirectory::default()
    }

    pub fn insert_lab(&self, lab_id: u64, record: LabRecord) {
        self.labs.lock().unwrap().insert(lab_id, record);
    }

    pub fn insert_course(&self, course_id: u64, record: CourseRecord) {
        self.courses.lock().unwrap().insert(course_id, record);
    }
}

#[async_trait]
impl LabDirectory for FakeDirectory {
    async fn lab(&self, lab_id: u64) -> Result<LabRecord, IdeError> {
        self.labs
            .lock()
            .unwrap()
            .get(&lab_id)
            .cloned()
            .ok_or(IdeError::NotFound)
    }

    async fn course(&self, course_id: u64) -> Result<CourseRecord, IdeError> {
        self.courses
            .lock()
            .unwrap()
            .get(&course_id)
            .cloned()
            .ok_or(IdeError::NotFound)
    }
}

/// Scriptable runtime double. Records every mutating call so tests can
/// assert exactly which operations the orchestrator and sweeper issued.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<ContainerState>,
    conflict_state: Mutex<Option<ContainerState>>,
    names: Mutex<Vec<String>>,
    list_rows: Mutex<Vec<ListRow>>,
    usage_rows: Mutex<Vec<UsageRow>>,
    bound_port: Mutex<Option<u16>>,
    token: Mutex<String>,
    last_spec: Mutex<Option<ContainerSpec>>,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_remove: AtomicBool,
    stop_not_found: AtomicBool,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime::default()
    }

    pub fn set_state(&self, state: ContainerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_names(&self, names: &[&str]) {
        *self.names.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_bound_port(&self, port: u16) {
        *self.bound_port.lock().unwrap() = Some(port);
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn stop_reports_not_found(&self) {
        self.stop_not_found.store(true, Ordering::SeqCst);
    }

    /// Makes `create` fail and flips the reported state afterwards, modeling
    /// a concurrent open winning the duplicate-name race.
    pub fn fail_create_with_conflict(&self, state_after: ContainerState) {
        self.fail_create.store(true, Ordering::SeqCst);
        *self.conflict_state.lock().unwrap() = Some(state_after);
    }

    pub fn push_list_row(&self, id: &str, name: &str, port: u16, created: &str, size: &str) {
        let row = ListRow {
            container_id: id.to_string(),
            container_name: name.to_string(),
            raw_port: format!("0.0.0.0:{port}->10443/tcp"),
            created_at: parse_created_at(created).unwrap(),
            raw_size: size.to_string(),
        };
        self.list_rows.lock().unwrap().push(row);
    }

    pub fn push_usage_row(&self, id: &str, cpu_perc: f64, mem_perc: f64) {
        let row = UsageRow {
            container_id: id.to_string(),
            cpu_raw: format!("{cpu_perc:.2}%"),
            cpu_perc,
            mem_perc,
            mem_usage: "10MiB / 500MiB".to_string(),
        };
        self.usage_rows.lock().unwrap().push(row);
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    /// Arguments of every recorded call to the given operation, in order.
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == op)
            .map(|(_, arg)| arg.clone())
            .collect()
    }

    fn record(&self, op: &str, arg: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), arg.to_string()));
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn state(
        &self,
        _ctx: &CancellationToken,
        name: &str,
    ) -> Result<ContainerState, IdeError> {
        self.record("state", name);
        Ok(*self.state.lock().unwrap())
    }

    async fn list_all(&self, _ctx: &CancellationToken) -> Result<Vec<ListRow>, IdeError> {
        Ok(self.list_rows.lock().unwrap().clone())
    }

    async fn list_by_ids(
        &self,
        _ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<ListRow>, IdeError> {
        Ok(self
            .list_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| ids.contains(&row.container_id))
            .cloned()
            .collect())
    }

    async fn list_names(
        &self,
        _ctx: &CancellationToken,
        _name_filter: &str,
    ) -> Result<Vec<String>, IdeError> {
        Ok(self.names.lock().unwrap().clone())
    }

    async fn usage_for(
        &self,
        _ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<UsageSample>, IdeError> {
        self.record("usage_for", &ids.join(","));
        let rows = self.usage_rows.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| {
                rows.iter()
                    .find(|row| &row.container_id == id)
                    .map(|row| UsageSample {
                        cpu_perc: row.cpu_raw.clone(),
                        mem_usage: row.mem_usage.clone(),
                    })
                    .unwrap_or(UsageSample {
                        cpu_perc: "0.00%".to_string(),
                        mem_usage: "0B / 0B".to_string(),
                    })
            })
            .collect())
    }

    async fn usage_all(&self, _ctx: &CancellationToken) -> Result<Vec<UsageRow>, IdeError> {
        Ok(self.usage_rows.lock().unwrap().clone())
    }

    async fn bound_port(&self, _ctx: &CancellationToken, name: &str) -> Result<u16, IdeError> {
        self.record("bound_port", name);
        self.bound_port
            .lock()
            .unwrap()
            .ok_or_else(|| IdeError::Internal("no bound port configured".to_string()))
    }

    async fn access_token(
        &self,
        _ctx: &CancellationToken,
        name: &str,
    ) -> Result<String, IdeError> {
        self.record("access_token", name);
        Ok(self.token.lock().unwrap().clone())
    }

    async fn create(&self, _ctx: &CancellationToken, spec: &ContainerSpec) -> Result<(), IdeError> {
        self.record("create", &spec.name);
        if self.fail_create.load(Ordering::SeqCst) {
            if let Some(state) = self.conflict_state.lock().unwrap().take() {
                *self.state.lock().unwrap() = state;
            }
            return Err(IdeError::Internal("create rejected".to_string()));
        }
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        *self.state.lock().unwrap() = ContainerState::Running;
        *self.bound_port.lock().unwrap() = Some(spec.host_port);
        *self.token.lock().unwrap() = spec.token.clone();
        Ok(())
    }

    async fn start(&self, _ctx: &CancellationToken, name: &str) -> Result<(), IdeError> {
        self.record("start", name);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(IdeError::Internal("start rejected".to_string()));
        }
        *self.state.lock().unwrap() = ContainerState::Running;
        Ok(())
    }

    async fn stop(&self, _ctx: &CancellationToken, id_or_name: &str) -> Result<(), IdeError> {
        self.record("stop", id_or_name);
        if self.stop_not_found.load(Ordering::SeqCst) {
            return Err(IdeError::NotFound);
        }
        Ok(())
    }

    async fn remove(&self, _ctx: &CancellationToken, names: &[String]) -> Result<(), IdeError> {
        for name in names {
            self.record("remove", name);
        }
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(IdeError::Internal("remove rejected".to_string()));
        }
        Ok(())
    }
}
