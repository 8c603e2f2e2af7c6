//! Runtime gateway: the only component that crosses the external process
//! boundary. Each operation builds a fixed `docker` argument list, executes
//! it under the caller's cancellation token, and parses stdout into typed
//! rows. The CLI's output formats are contractual; a mismatch is a
//! [`IdeError::ParseFailure`], never a silent skip.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::docker::command::{self, CommandError, CommandOutput};
use crate::error::IdeError;
use crate::models::container_models::{
    ContainerSpec, ContainerState, ListRow, UsageRow, UsageSample,
};

const DOCKER_BIN: &str = "docker";

// The templates wrap each line in literal double quotes; parsing strips the
// leading quote from the first column and leaves the trailing one on the
// last, which the size-token extraction never reaches.
const LIST_FORMAT: &str = "\"{{.ID}}\t{{.Names}}\t{{.Ports}}\t{{.CreatedAt}}\t{{.Size}}\"";
const NAMES_FORMAT: &str = "{{.Names}}";
const USAGE_FORMAT: &str = "\"{{.CPUPerc}}\t{{.MemUsage}}\"";
const USAGE_FULL_FORMAT: &str = "\"{{.ID}}\t{{.CPUPerc}}\t{{.MemPerc}}\t{{.MemUsage}}\"";
const PORT_BINDINGS_TEMPLATE: &str = "'{{json .HostConfig.PortBindings}}'";

/// `docker ps` prints `CreatedAt` in this shape, in the daemon host's zone:
/// `2021-07-01 12:00:00 +0800 CST`. The trailing zone abbreviation is
/// dropped before parsing and the result is normalized into Asia/Shanghai so
/// creation-time ordering stays consistent across fields.
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";
const CREATED_AT_ZONE: Tz = chrono_tz::Asia::Shanghai;

static PUBLISHED_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*?(\d+)->").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"token: (\w+)").unwrap());

/// Operations the session services need from the container runtime. The CLI
/// is the system of record; this trait is the seam that keeps everything
/// else testable without a daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Classifies the container's current state, queried fresh each call.
    async fn state(&self, ctx: &CancellationToken, name: &str) -> Result<ContainerState, IdeError>;

    /// Full list snapshot of running containers.
    async fn list_all(&self, ctx: &CancellationToken) -> Result<Vec<ListRow>, IdeError>;

    /// List snapshot filtered to the given container IDs. Row order is the
    /// runtime's own; callers correlate by ID.
    async fn list_by_ids(
        &self,
        ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<ListRow>, IdeError>;

    /// Names of running containers matching the filter.
    async fn list_names(
        &self,
        ctx: &CancellationToken,
        name_filter: &str,
    ) -> Result<Vec<String>, IdeError>;

    /// Live usage for exactly the given IDs, row `i` belonging to `ids[i]`.
    async fn usage_for(
        &self,
        ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<UsageSample>, IdeError>;

    /// Full usage snapshot with numeric CPU/memory percentages.
    async fn usage_all(&self, ctx: &CancellationToken) -> Result<Vec<UsageRow>, IdeError>;

    /// Host port the container's single published port is bound to.
    async fn bound_port(&self, ctx: &CancellationToken, name: &str) -> Result<u16, IdeError>;

    /// Access token recovered from the container's log stream.
    async fn access_token(&self, ctx: &CancellationToken, name: &str) -> Result<String, IdeError>;

    async fn create(&self, ctx: &CancellationToken, spec: &ContainerSpec) -> Result<(), IdeError>;

    async fn start(&self, ctx: &CancellationToken, name: &str) -> Result<(), IdeError>;

    /// Stops the container; [`IdeError::NotFound`] when the runtime reports
    /// no such container.
    async fn stop(&self, ctx: &CancellationToken, id_or_name: &str) -> Result<(), IdeError>;

    /// Force-removes the named containers; a no-op for an empty slice.
    async fn remove(&self, ctx: &CancellationToken, names: &[String]) -> Result<(), IdeError>;
}

#[derive(Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        DockerCli
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        args: Vec<String>,
    ) -> Result<CommandOutput, IdeError> {
        let mut cmd = Command::new(DOCKER_BIN);
        cmd.args(&args);
        match command::command_output(ctx, cmd).await {
            Ok(output) => Ok(output),
            Err(CommandError::Canceled) => Err(IdeError::Canceled),
            Err(err) => {
                let stderr = match &err {
                    CommandError::WrongCode { stderr }
                    | CommandError::Failed { stderr, .. } => {
                        String::from_utf8_lossy(stderr).into_owned()
                    }
                    _ => String::new(),
                };
                error!(
                    command = %command::render(DOCKER_BIN, &args),
                    %stderr,
                    "runtime command failed: {err}"
                );
                Err(IdeError::internal(err))
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn state(&self, ctx: &CancellationToken, name: &str) -> Result<ContainerState, IdeError> {
        let running = self
            .run(
                ctx,
                argv(&["ps", "--filter", &format!("name={name}"), "--format", NAMES_FORMAT]),
            )
            .await?;
        // the name filter matches substrings, so compare whole names
        if parse_names(&running.stdout).iter().any(|n| n == name) {
            return Ok(ContainerState::Running);
        }

        let stopped = self
            .run(
                ctx,
                argv(&[
                    "ps",
                    "-a",
                    "--filter",
                    "status=exited",
                    "--filter",
                    &format!("name={name}"),
                    "--format",
                    NAMES_FORMAT,
                ]),
            )
            .await?;
        if parse_names(&stopped.stdout).iter().any(|n| n == name) {
            Ok(ContainerState::Stopped)
        } else {
            Ok(ContainerState::Absent)
        }
    }

    async fn list_all(&self, ctx: &CancellationToken) -> Result<Vec<ListRow>, IdeError> {
        let output = self
            .run(ctx, argv(&["ps", "--format", LIST_FORMAT]))
            .await?;
        parse_list_rows(&output.stdout)
    }

    async fn list_by_ids(
        &self,
        ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<ListRow>, IdeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = argv(&["ps", "--format", LIST_FORMAT]);
        for id in ids {
            args.push("--filter".to_string());
            args.push(format!("id={id}"));
        }
        let output = self.run(ctx, args).await?;
        parse_list_rows(&output.stdout)
    }

    async fn list_names(
        &self,
        ctx: &CancellationToken,
        name_filter: &str,
    ) -> Result<Vec<String>, IdeError> {
        let output = self
            .run(
                ctx,
                argv(&[
                    "ps",
                    "--filter",
                    &format!("name={name_filter}"),
                    "--format",
                    NAMES_FORMAT,
                ]),
            )
            .await?;
        Ok(parse_names(&output.stdout))
    }

    async fn usage_for(
        &self,
        ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<Vec<UsageSample>, IdeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = argv(&["stats", "--no-stream", "--format", USAGE_FORMAT]);
        args.extend(ids.iter().cloned());
        let output = self.run(ctx, args).await?;
        parse_usage_samples(&output.stdout)
    }

    async fn usage_all(&self, ctx: &CancellationToken) -> Result<Vec<UsageRow>, IdeError> {
        let output = self
            .run(ctx, argv(&["stats", "--no-stream", "--format", USAGE_FULL_FORMAT]))
            .await?;
        parse_usage_rows(&output.stdout)
    }

    async fn bound_port(&self, ctx: &CancellationToken, name: &str) -> Result<u16, IdeError> {
        let output = self
            .run(ctx, argv(&["inspect", "-f", PORT_BINDINGS_TEMPLATE, name]))
            .await?;
        parse_port_bindings(&output.stdout)
    }

    async fn access_token(&self, ctx: &CancellationToken, name: &str) -> Result<String, IdeError> {
        let output = self.run(ctx, argv(&["logs", name])).await?;
        parse_token(&output.stdout)
    }

    async fn create(&self, ctx: &CancellationToken, spec: &ContainerSpec) -> Result<(), IdeError> {
        let mode = if spec.read_only { "ro" } else { "rw" };
        let args = argv(&[
            "run",
            "-d",
            "-u",
            "root",
            "--restart=always",
            &format!("--cpus={}", spec.cpus),
            &format!("--memory={}", spec.memory),
            &format!("--memory-swap={}", spec.memory_swap),
            "-e",
            &format!("token={}", spec.token),
            "-p",
            &format!("{}:{}", spec.host_port, spec.internal_port),
            "-v",
            &format!("{}:/home/project:{mode}", spec.workspace.display()),
            &format!("--name={}", spec.name),
            &spec.image,
        ]);
        self.run(ctx, args).await.map(|_| ())
    }

    async fn start(&self, ctx: &CancellationToken, name: &str) -> Result<(), IdeError> {
        self.run(ctx, argv(&["start", name])).await.map(|_| ())
    }

    async fn stop(&self, ctx: &CancellationToken, id_or_name: &str) -> Result<(), IdeError> {
        let args = argv(&["stop", "-t", "3", id_or_name]);
        let mut cmd = Command::new(DOCKER_BIN);
        cmd.args(&args);
        match command::command_output(ctx, cmd).await {
            Ok(_) => Ok(()),
            Err(CommandError::WrongCode { .. }) => {
                debug!(container = id_or_name, "stop targeted a nonexistent container");
                Err(IdeError::NotFound)
            }
            Err(CommandError::Canceled) => Err(IdeError::Canceled),
            Err(err) => {
                error!(command = %command::render(DOCKER_BIN, &args), "stop failed: {err}");
                Err(IdeError::internal(err))
            }
        }
    }

    async fn remove(&self, ctx: &CancellationToken, names: &[String]) -> Result<(), IdeError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args = argv(&["rm", "-f"]);
        args.extend(names.iter().cloned());
        let mut cmd = Command::new(DOCKER_BIN);
        cmd.args(&args);
        match command::command_output(ctx, cmd).await {
            Ok(_) => Ok(()),
            Err(CommandError::WrongCode { .. }) => {
                debug!(containers = ?names, "remove targeted nonexistent containers");
                Err(IdeError::NotFound)
            }
            Err(CommandError::Canceled) => Err(IdeError::Canceled),
            Err(err) => {
                error!(command = %command::render(DOCKER_BIN, &args), "remove failed: {err}");
                Err(IdeError::internal(err))
            }
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn parse_names(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_list_rows(stdout: &[u8]) -> Result<Vec<ListRow>, IdeError> {
    let text = String::from_utf8_lossy(stdout);
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    // output always ends with a newline; the final split element is an empty
    // pseudo-line, not a row
    lines.pop();

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 5 {
            return Err(IdeError::ParseFailure(format!(
                "{line:?} is not a standard container row"
            )));
        }
        rows.push(ListRow {
            container_id: cols[0].trim_start_matches('"').to_string(),
            container_name: cols[1].to_string(),
            raw_port: cols[2].to_string(),
            created_at: parse_created_at(cols[3])?,
            raw_size: cols[4].to_string(),
        });
    }
    Ok(rows)
}

pub(crate) fn parse_created_at(raw: &str) -> Result<DateTime<Tz>, IdeError> {
    let without_zone_name = raw.rsplit_once(' ').map(|(head, _)| head).unwrap_or(raw);
    DateTime::parse_from_str(without_zone_name, CREATED_AT_FORMAT)
        .map(|parsed| parsed.with_timezone(&CREATED_AT_ZONE))
        .map_err(|err| IdeError::ParseFailure(format!("time parse {raw:?} failed: {err}")))
}

pub(crate) fn parse_usage_samples(stdout: &[u8]) -> Result<Vec<UsageSample>, IdeError> {
    let text = String::from_utf8_lossy(stdout);
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    lines.pop();

    let mut samples = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 2 {
            return Err(IdeError::ParseFailure(format!(
                "{line:?} is not a standard usage row"
            )));
        }
        samples.push(UsageSample {
            cpu_perc: cols[0].trim_start_matches('"').to_string(),
            mem_usage: cols[1].trim_end_matches('"').to_string(),
        });
    }
    Ok(samples)
}

pub(crate) fn parse_usage_rows(stdout: &[u8]) -> Result<Vec<UsageRow>, IdeError> {
    let text = String::from_utf8_lossy(stdout);
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    lines.pop();

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 4 {
            return Err(IdeError::ParseFailure(format!(
                "{line:?} is not a standard usage row"
            )));
        }
        let cpu_raw = cols[1].to_string();
        rows.push(UsageRow {
            container_id: cols[0].trim_start_matches('"').to_string(),
            cpu_perc: percent(cols[1])?,
            mem_perc: percent(cols[2])?,
            mem_usage: cols[3].trim_end_matches('"').to_string(),
            cpu_raw,
        });
    }
    Ok(rows)
}

fn percent(raw: &str) -> Result<f64, IdeError> {
    raw.strip_suffix('%')
        .and_then(|digits| digits.parse::<f64>().ok())
        .ok_or_else(|| IdeError::ParseFailure(format!("{raw:?} is not a percentage")))
}

/// First digit run immediately preceding `->` in the published-ports column.
pub(crate) fn published_port(raw: &str) -> Result<u16, IdeError> {
    let caps = PUBLISHED_PORT_RE
        .captures(raw)
        .ok_or_else(|| IdeError::ParseFailure(format!("{raw:?} is not a valid port mapping")))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| IdeError::ParseFailure(format!("{:?} is not a valid port", &caps[1])))
}

/// First whitespace-delimited token of the human-readable size column, kept
/// verbatim rather than converted to bytes.
pub(crate) fn size_token(raw: &str) -> Result<String, IdeError> {
    raw.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| IdeError::ParseFailure(format!("{raw:?} is not a valid size")))
}

#[derive(Debug, Deserialize)]
struct HostBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

pub(crate) fn parse_port_bindings(stdout: &[u8]) -> Result<u16, IdeError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text
        .trim_end_matches('\n')
        .trim_start_matches('\'')
        .trim_end_matches('\'');
    let bindings: HashMap<String, Vec<HostBinding>> = serde_json::from_str(trimmed)
        .map_err(|err| {
            IdeError::ParseFailure(format!("decode port bindings {trimmed:?} failed: {err}"))
        })?;
    for hosts in bindings.values() {
        if let Some(first) = hosts.first() {
            return first.host_port.parse::<u16>().map_err(|_| {
                IdeError::ParseFailure(format!("{:?} is not a valid host port", first.host_port))
            });
        }
    }
    Err(IdeError::ParseFailure(format!(
        "no host port binding in {trimmed:?}"
    )))
}

pub(crate) fn parse_token(stdout: &[u8]) -> Result<String, IdeError> {
    let text = String::from_utf8_lossy(stdout);
    TOKEN_RE
        .captures(&text)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| {
            IdeError::ParseFailure("token marker not found in container logs".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE_LIST: &[u8] = b"\"1f0c\tmytheia-5-9\t0.0.0.0:30123->10443/tcp\t2021-07-01 12:00:00 +0800 CST\t57.4MB (virtual 1.19GB)\"\n\"2a9d\tmytheia-5-9-3\t0.0.0.0:30456->10443/tcp\t2021-07-02 08:30:00 +0800 CST\t1.2MB (virtual 1.19GB)\"\n";

    #[test]
    fn parses_list_rows() {
        let rows = parse_list_rows(SAMPLE_LIST).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].container_id, "1f0c");
        assert_eq!(rows[0].container_name, "mytheia-5-9");
        assert_eq!(rows[0].raw_port, "0.0.0.0:30123->10443/tcp");
        assert_eq!(
            rows[0].created_at,
            CREATED_AT_ZONE.with_ymd_and_hms(2021, 7, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(rows[1].container_name, "mytheia-5-9-3");
    }

    #[test]
    fn empty_list_output_yields_no_rows() {
        assert!(parse_list_rows(b"").unwrap().is_empty());
    }

    #[test]
    fn malformed_list_row_is_a_hard_error() {
        let err = parse_list_rows(b"\"1f0c\tonly-two-cols\n").unwrap_err();
        assert!(matches!(err, IdeError::ParseFailure(_)));
    }

    #[test]
    fn parses_usage_samples() {
        let samples =
            parse_usage_samples(b"\"1.52%\t10.5MiB / 500MiB\"\n\"0.00%\t4MiB / 500MiB\"\n")
                .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].cpu_perc, "1.52%");
        assert_eq!(samples[0].mem_usage, "10.5MiB / 500MiB");
    }

    #[test]
    fn parses_full_usage_rows() {
        let rows = parse_usage_rows(
            b"\"1f0c\t1.52%\t2.10%\t10.5MiB / 500MiB\"\n\"2a9d\t12.00%\t0.80%\t4MiB / 500MiB\"\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].container_id, "1f0c");
        assert_eq!(rows[0].cpu_raw, "1.52%");
        assert!((rows[0].cpu_perc - 1.52).abs() < f64::EPSILON);
        assert!((rows[1].mem_perc - 0.80).abs() < f64::EPSILON);
        assert_eq!(rows[1].mem_usage, "4MiB / 500MiB");
    }

    #[test]
    fn usage_row_with_wrong_columns_is_a_hard_error() {
        assert!(parse_usage_rows(b"\"1f0c\t1.52%\n").is_err());
    }

    #[test]
    fn extracts_published_port() {
        assert_eq!(published_port("0.0.0.0:30123->10443/tcp").unwrap(), 30123);
        assert!(published_port("10443/tcp").is_err());
    }

    #[test]
    fn extracts_size_token() {
        assert_eq!(size_token("57.4MB (virtual 1.19GB)\"").unwrap(), "57.4MB");
        assert!(size_token("   ").is_err());
    }

    #[test]
    fn parses_port_bindings_json() {
        let stdout = b"'{\"10443/tcp\":[{\"HostIp\":\"0.0.0.0\",\"HostPort\":\"30123\"}]}'\n";
        assert_eq!(parse_port_bindings(stdout).unwrap(), 30123);
    }

    #[test]
    fn empty_port_binding_map_is_a_hard_error() {
        assert!(parse_port_bindings(b"'{}'\n").is_err());
        assert!(parse_port_bindings(b"'null'\n").is_err());
    }

    #[test]
    fn recovers_token_from_logs() {
        let logs = b"theia up\ntoken: a1b2c3d4e5\nlistening on 10443\n";
        assert_eq!(parse_token(logs).unwrap(), "a1b2c3d4e5");
        assert!(parse_token(b"no marker here\n").is_err());
    }
}
