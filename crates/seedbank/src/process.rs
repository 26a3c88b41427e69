//! Subprocess collaborator: run an external program, capture its streams and
//! exit code, fail with a structured [`ProcessError`] on a non-zero exit.
//!
//! Children are spawned with `kill_on_drop`, so when a scheduler batch is
//! aborted the child is terminated rather than orphaned. A timed-out child is
//! killed explicitly and its exit status still collected; there is no
//! fire-and-forget path.

use crate::errors::ProcessError;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Run `program` with `args`, capturing stdout and stderr. Runs in `cwd` when
/// given. Returns captured stdout on a clean exit.
pub async fn run<P, I, A>(
    program: P,
    args: I,
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let (mut cmd, cmdline) = build(program.as_ref(), args);
    tracing::info!("+ {}", cmdline.join(" "));
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn `{}`", cmdline.join(" ")))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let (status, stdout, stderr) = tokio::join!(
        wait_bounded(&mut child, timeout, &cmdline),
        slurp(stdout_pipe),
        slurp(stderr_pipe),
    );
    let status = status?;
    let stdout = stdout.context("read child stdout")?;
    let stderr = stderr.context("read child stderr")?;

    if !status.success() {
        return Err(ProcessError::new(cmdline, stdout, stderr, status.code().unwrap_or(1)).into());
    }
    Ok(stdout)
}

/// Run `program` with `args`, streaming both stdout and stderr into `log`.
/// Used for fuzzer invocations whose output is scraped afterwards; the
/// captured-stream slots of a failure point at the log file instead. `cwd` is
/// where the engine drops its failure artifacts, so callers pass a directory
/// they scan afterwards.
pub async fn run_to_log<P, I, A>(
    program: P,
    args: I,
    cwd: Option<&Path>,
    log: &Path,
    timeout: Option<Duration>,
) -> Result<()>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let (mut cmd, cmdline) = build(program.as_ref(), args);
    tracing::debug!("+ {} (logs in {})", cmdline.join(" "), log.display());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let file = std::fs::File::create(log)
        .with_context(|| format!("create log file {}", log.display()))?;
    let err_file = file
        .try_clone()
        .with_context(|| format!("clone log handle {}", log.display()))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::from(err_file));
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn `{}`", cmdline.join(" ")))?;

    let status = wait_bounded(&mut child, timeout, &cmdline).await?;
    if !status.success() {
        let note = format!("logs in {}", log.display()).into_bytes();
        return Err(ProcessError::new(cmdline, Vec::new(), note, status.code().unwrap_or(1)).into());
    }
    Ok(())
}

/// Quiet git invocation against `repo`, captured stdout returned.
pub async fn git<I, A>(repo: &Path, args: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut full: Vec<std::ffi::OsString> = vec!["-C".into(), repo.into()];
    full.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
    let (mut cmd, cmdline) = build(OsStr::new("git"), full);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn `{}`", cmdline.join(" ")))?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let (status, stdout, stderr) = tokio::join!(
        wait_bounded(&mut child, None, &cmdline),
        slurp(stdout_pipe),
        slurp(stderr_pipe),
    );
    let status = status?;
    let stdout = stdout.context("read git stdout")?;
    if !status.success() {
        return Err(ProcessError::new(
            cmdline,
            stdout,
            stderr.unwrap_or_default(),
            status.code().unwrap_or(1),
        )
        .into());
    }
    Ok(stdout)
}

/// Captured stdout decoded into trimmed, non-empty lines.
pub fn lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn build<I, A>(program: &OsStr, args: I) -> (Command, Vec<String>)
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    let mut cmdline = vec![program.to_string_lossy().into_owned()];
    for arg in args {
        cmd.arg(arg.as_ref());
        cmdline.push(arg.as_ref().to_string_lossy().into_owned());
    }
    (cmd, cmdline)
}

/// Wait for the child, enforcing `timeout` if set. A child that outlives the
/// bound is killed and its exit status still reaped.
async fn wait_bounded(
    child: &mut Child,
    timeout: Option<Duration>,
    cmdline: &[String],
) -> Result<std::process::ExitStatus> {
    let status = match timeout {
        Some(bound) => match tokio::time::timeout(bound, child.wait()).await {
            Ok(status) => status.context("wait for child")?,
            Err(_) => {
                tracing::warn!(
                    "`{}` exceeded {:?}, killing",
                    cmdline.join(" "),
                    bound
                );
                // Fails only when the child already exited; either way the
                // wait below reaps the real status.
                let _ = child.start_kill();
                child.wait().await.context("reap killed child")?
            }
        },
        None => child.wait().await.context("wait for child")?,
    };
    Ok(status)
}

async fn slurp<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = run("sh", ["-c", "printf hello"], None, None).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_process_error() {
        let err = run("sh", ["-c", "echo oops >&2; exit 3"], None, None)
            .await
            .unwrap_err();
        let perr = err.downcast_ref::<ProcessError>().expect("ProcessError");
        assert_eq!(perr.code, 3);
        assert_eq!(perr.stderr, "oops");
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_failure() {
        let started = std::time::Instant::now();
        let err = run("sleep", ["5"], None, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(err.downcast_ref::<ProcessError>().is_some());
    }

    #[tokio::test]
    async fn child_runs_in_requested_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        run("sh", ["-c", "printf payload > dropped"], Some(dir.path()), None)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("dropped")).unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn log_file_collects_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        run_to_log("sh", ["-c", "echo one; echo two >&2"], None, &log, None)
            .await
            .unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("two"));
    }

    #[test]
    fn lines_trims_and_drops_empties() {
        assert_eq!(lines(b"  a \n\n b\n"), vec!["a".to_string(), "b".to_string()]);
    }
}
