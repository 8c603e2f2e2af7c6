//! Subprocess execution for the runtime CLI.
//!
//! Every runtime invocation funnels through [`command_output`], which honors
//! the caller's cancellation token by killing the child process and
//! classifies the exit status into the small set of conditions the rest of
//! the service dispatches on.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Recognized failure status (exit 1, or the 136/139 fallbacks): the
    /// target of the command does not exist or rejected it outright.
    #[error("command exited with a recognized failure status")]
    WrongCode { stderr: Vec<u8> },

    /// Exit 137: the process inside the container hit its memory cap.
    #[error("process was oom killed")]
    OomKilled,

    #[error("command canceled by caller")]
    Canceled,

    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command exited with status {status}")]
    Failed { status: i32, stderr: Vec<u8> },
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub async fn command_output(
    ctx: &CancellationToken,
    mut cmd: Command,
) -> Result<CommandOutput, CommandError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn()?;

    tokio::select! {
        output = child.wait_with_output() => classify(output?),
        () = ctx.cancelled() => Err(CommandError::Canceled),
    }
}

fn classify(output: std::process::Output) -> Result<CommandOutput, CommandError> {
    if output.status.success() {
        return Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    match output.status.code() {
        Some(1) | Some(136) | Some(139) => Err(CommandError::WrongCode {
            stderr: output.stderr,
        }),
        Some(137) => Err(CommandError::OomKilled),
        Some(status) => Err(CommandError::Failed {
            status,
            stderr: output.stderr,
        }),
        // killed by a signal, which only happens on cancellation
        None => Err(CommandError::Canceled),
    }
}

/// Command line reproduced for log messages.
pub fn render(program: &str, args: &[String]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    fn status_from_code(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    fn output_with_code(code: i32) -> std::process::Output {
        std::process::Output {
            status: status_from_code(code),
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn classifies_success() {
        let output = classify(output_with_code(0)).unwrap();
        assert_eq!(output.stdout, b"out");
    }

    #[cfg(unix)]
    #[test]
    fn classifies_recognized_failures() {
        for code in [1, 136, 139] {
            assert!(matches!(
                classify(output_with_code(code)),
                Err(CommandError::WrongCode { .. })
            ));
        }
        assert!(matches!(
            classify(output_with_code(137)),
            Err(CommandError::OomKilled)
        ));
        assert!(matches!(
            classify(output_with_code(125)),
            Err(CommandError::Failed { status: 125, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn classifies_signal_death_as_canceled() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(9),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(matches!(classify(output), Err(CommandError::Canceled)));
    }

    #[tokio::test]
    async fn captures_stdout() {
        let ctx = CancellationToken::new();
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = command_output(&ctx, cmd).await.unwrap();
        assert_eq!(output.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let ctx = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });
        let started = std::time::Instant::now();
        let result = command_output(&ctx, cmd).await;
        assert!(matches!(result, Err(CommandError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
