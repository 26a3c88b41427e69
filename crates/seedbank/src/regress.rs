//! Regression over stored crash inputs.
//!
//! One batch is a (fuzz target, corpus bucket) pair: the target is invoked
//! over the whole bucket at once for throughput, with a bounded timeout,
//! through the scheduler. A failing batch is attributed to the single input
//! the target's own log shows as started but never finished; that input moves
//! into the crashes collection. Buckets that complete cleanly get a done
//! marker so an interrupted session resumes where it left off.

use crate::process;
use crate::sched::ExecPolicy;
use crate::store::Store;
use anyhow::{Context, Result};
use regex::bytes::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flags passed to every fuzz-target invocation.
const FUZZ_FLAGS: [&str; 2] = ["-detect_leaks=0", "-use_value_profile=1"];

/// The contract with the fuzzing engine's execution log: it records each
/// input with a start token as it begins and a finish token as it completes.
/// The input started but never finished is the culprit of a failing batch.
///
/// The token pair is data, not code, so a changed log format touches exactly
/// this type.
#[derive(Debug, Clone)]
pub struct LogFormat {
    start: Regex,
    finish: Regex,
}

impl LogFormat {
    pub fn new(start_token: &str, finish_token: &str) -> Result<Self> {
        Ok(Self {
            start: token_pattern(start_token)?,
            finish: token_pattern(finish_token)?,
        })
    }

    /// The libFuzzer log format: "Running: <path>" / "Executed <path>".
    pub fn libfuzzer() -> Self {
        Self::new("Running:", "Executed").expect("static libfuzzer tokens")
    }

    /// Paths recorded as started but never finished.
    pub fn culprits(&self, log: &[u8]) -> Vec<PathBuf> {
        let started = paths_after(&self.start, log);
        let finished = paths_after(&self.finish, log);
        started
            .difference(&finished)
            .map(PathBuf::from)
            .collect()
    }
}

fn token_pattern(token: &str) -> Result<Regex> {
    Regex::new(&format!(r"{}\s+(\S+)", regex::escape(token)))
        .with_context(|| format!("log token pattern for {token:?}"))
}

fn paths_after(pattern: &Regex, log: &[u8]) -> BTreeSet<String> {
    pattern
        .captures_iter(log)
        .filter_map(|cap| cap.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .collect()
}

/// Discover built fuzz targets: `fuzz-*` executables anywhere under `build`.
pub fn fuzz_targets(build: &Path) -> Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;

    let mut targets = Vec::new();
    let mut stack = vec![build.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if !dir.is_dir() {
            continue;
        }
        for entry in
            fs::read_dir(&dir).with_context(|| format!("list build dir {}", dir.display()))?
        {
            let path = entry.context("read build entry")?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("fuzz-"))
            {
                let mode = fs::metadata(&path)
                    .with_context(|| format!("stat {}", path.display()))?
                    .permissions()
                    .mode();
                if mode & 0o111 != 0 {
                    targets.push(path);
                }
            }
        }
    }
    targets.sort();
    Ok(targets)
}

/// Drives fuzz targets over the store's corpus buckets and crash inputs.
#[derive(Debug, Clone)]
pub struct Regression {
    store: Store,
    targets: Vec<PathBuf>,
    policy: ExecPolicy,
    timeout: Duration,
    format: LogFormat,
    log_dir: PathBuf,
    work_dir: PathBuf,
}

impl Regression {
    pub fn new(
        store: Store,
        targets: Vec<PathBuf>,
        policy: ExecPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            work_dir: store.root().to_path_buf(),
            store,
            targets,
            policy,
            timeout,
            format: LogFormat::libfuzzer(),
            log_dir: std::env::temp_dir(),
        }
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Working directory every target invocation runs in. The fuzzing engine
    /// writes its failure artifacts there, so the caller must include it in
    /// the roots scanned by the next trim. Defaults to the store root.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn targets(&self) -> &[PathBuf] {
        &self.targets
    }

    /// One regression pass: every (target, not-yet-done bucket) batch, fanned
    /// out under the execution policy. Returns the number of failing batches;
    /// a failing batch never aborts its siblings.
    pub async fn pass(&self) -> Result<usize> {
        let mut ops = Vec::new();
        for bucket in self.store.corpus_buckets()? {
            if self.store.is_done(&bucket) {
                continue;
            }
            if self.store.bucket_inputs(&bucket)?.is_empty() {
                continue;
            }
            for target in &self.targets {
                ops.push(run_batch(
                    self.store.clone(),
                    target.clone(),
                    bucket.clone(),
                    self.timeout,
                    self.format.clone(),
                    self.log_dir.clone(),
                    self.work_dir.clone(),
                ));
            }
        }
        let outcomes = self.policy.run_settled(ops).await?;
        let mut failures = 0;
        for outcome in outcomes {
            if let Err(err) = outcome {
                tracing::info!(error = %err, "batch reproduced a failure");
                failures += 1;
            }
        }
        Ok(failures)
    }

    /// Revalidate every stored crash input against every target. An input no
    /// target fails on is promoted into the corpus: still a valuable case,
    /// no longer a reproducer. Returns the number promoted.
    pub async fn revalidate_crashes(&self) -> Result<usize> {
        let mut crash_files = Vec::new();
        let crashes = self.store.crashes();
        if crashes.is_dir() {
            collect_files(&crashes, &mut crash_files)?;
        }
        crash_files.sort();

        let ops = crash_files.into_iter().map(|file| {
            let store = self.store.clone();
            let targets = self.targets.clone();
            let timeout = self.timeout;
            let work_dir = self.work_dir.clone();
            async move { revalidate_one(store, targets, file, timeout, work_dir).await }
        });
        let outcomes = self.policy.run_settled(ops).await?;
        let mut promoted = 0;
        for outcome in outcomes {
            if outcome? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Clear markers once the overall session concluded successfully.
    pub fn finish_session(&self) -> Result<usize> {
        self.store.clear_done_markers()
    }
}

/// Run one (target, bucket) batch. Failure is a classification signal: the
/// culprit input moves into crashes (tagged with its bucket name so two
/// same-named files from different buckets cannot clobber each other before
/// re-hashing) and the error propagates so the caller can count it.
async fn run_batch(
    store: Store,
    target: PathBuf,
    bucket: PathBuf,
    timeout: Duration,
    format: LogFormat,
    log_dir: PathBuf,
    work_dir: PathBuf,
) -> Result<()> {
    let inputs = store.bucket_inputs(&bucket)?;
    if inputs.is_empty() {
        return Ok(());
    }
    let log = log_dir.join(format!(
        "{}-{}.log",
        file_name(&target),
        file_name(&bucket)
    ));

    let mut args: Vec<std::ffi::OsString> =
        FUZZ_FLAGS.iter().map(|f| f.into()).collect();
    args.extend(inputs.iter().map(|p| p.clone().into_os_string()));
    let outcome =
        process::run_to_log(&target, args, Some(work_dir.as_path()), &log, Some(timeout)).await;

    if outcome.is_err() {
        let log_bytes = fs::read(&log).unwrap_or_default();
        for culprit in format.culprits(&log_bytes) {
            let tagged = format!("{}{}", file_name(&bucket), file_name(&culprit));
            let dest = store.crashes().join(tagged);
            match fs::rename(&culprit, &dest) {
                Ok(()) => {
                    tracing::info!(input = %culprit.display(), "still crashes, recorded")
                }
                // Another target's batch over the same bucket may have
                // claimed the culprit first.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("move culprit {} -> {}", culprit.display(), dest.display())
                    })
                }
            }
        }
    }
    let _ = fs::remove_file(&log);
    outcome?;
    store.mark_done(&bucket)?;
    Ok(())
}

/// True when the input was promoted.
async fn revalidate_one(
    store: Store,
    targets: Vec<PathBuf>,
    file: PathBuf,
    timeout: Duration,
    work_dir: PathBuf,
) -> Result<bool> {
    for target in &targets {
        let mut args: Vec<std::ffi::OsString> =
            FUZZ_FLAGS.iter().map(|f| f.into()).collect();
        args.push(file.clone().into_os_string());
        if process::run(target, args, Some(work_dir.as_path()), Some(timeout))
            .await
            .is_err()
        {
            // Still reproduces under at least one target; keep it.
            return Ok(false);
        }
    }
    // Tag with the source bucket so two same-named inputs from different
    // buckets cannot clobber each other before trim re-hashes them.
    let tag = match file.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
        Some(parent) => format!("{parent}{}", file_name(&file)),
        None => file_name(&file),
    };
    let dest = store.corpus().join(tag);
    fs::create_dir_all(store.corpus()).context("create corpus dir")?;
    fs::rename(&file, &dest)
        .with_context(|| format!("promote {} -> {}", file.display(), dest.display()))?;
    tracing::info!(input = %dest.display(), "no longer reproduces, promoted to corpus");
    Ok(true)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry.context("read dir entry")?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
