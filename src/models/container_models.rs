use chrono::DateTime;
use chrono_tz::Tz;

use crate::models::session_models::SessionIdentity;

/// Container state as reported by the runtime at query time. Never cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerState {
    #[default]
    Absent,
    Running,
    Stopped,
}

/// IDE flavor baked into the container image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeLanguage {
    Python3,
    Cpp,
    Java,
}

/// Sort criterion for the administrative container listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    DiskSize,
    Cpu,
    Memory,
}

/// One row of `docker ps` output in the five-column listing format.
#[derive(Debug, Clone)]
pub struct ListRow {
    pub container_id: String,
    pub container_name: String,
    /// Published-ports column, verbatim (e.g. `0.0.0.0:30123->10443/tcp`).
    pub raw_port: String,
    pub created_at: DateTime<Tz>,
    /// Size column, verbatim (e.g. `57.4MB (virtual 1.19GB)`).
    pub raw_size: String,
}

/// One row of the two-column `docker stats` form, correlated positionally
/// with the list rows the stats command was issued for.
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub cpu_perc: String,
    pub mem_usage: String,
}

/// One row of the four-column `docker stats` form, carrying the numeric
/// percentages the usage-first listing strategies sort on.
#[derive(Debug, Clone)]
pub struct UsageRow {
    pub container_id: String,
    pub cpu_raw: String,
    pub cpu_perc: f64,
    pub mem_perc: f64,
    pub mem_usage: String,
}

/// Fully merged listing row handed to callers: identity and size from the
/// list snapshot, live usage from the stats snapshot.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub container_id: String,
    pub identity: SessionIdentity,
    pub port: u16,
    pub created_at: DateTime<Tz>,
    pub disk_size: String,
    pub cpu_perc: String,
    pub mem_usage: String,
}

/// Everything `docker run` needs to launch one IDE container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub token: String,
    pub workspace: std::path::PathBuf,
    pub read_only: bool,
    pub cpus: f64,
    pub memory: String,
    pub memory_swap: String,
}
