//! Pipeline configuration.
//!
//! One YAML file carries everything the pipeline needs: the store root, the
//! build directory holding fuzz targets, name-length bounds, concurrency,
//! timeouts, and the frozen-archive deny-list. No working-directory
//! assumptions and no globals.

use crate::hash::{NameLength, DEFAULT_NAME_LEN, MAX_NAME_LEN};
use crate::sched::ExecPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Store root; `corpus/`, `crashes/`, and `seen.json` live underneath.
    pub root: PathBuf,

    /// Directory searched for built `fuzz-*` executables.
    #[serde(default = "default_build")]
    pub build: PathBuf,

    /// Frozen archive destination.
    #[serde(default = "default_archive")]
    pub archive: PathBuf,

    /// Starting truncated-name length for trim passes.
    #[serde(default = "default_name_length")]
    pub name_length: usize,

    /// Hard ceiling on the truncated-name length.
    #[serde(default = "default_name_ceiling")]
    pub name_ceiling: usize,

    /// Concurrency ceiling; defaults to available parallelism × 3.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Strictly sequential execution for deterministic CI logs.
    #[serde(default)]
    pub sequential: bool,

    /// Bound on each fuzzing-binary invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Content ids never admitted to the frozen archive.
    #[serde(default)]
    pub deny: Vec<String>,

    /// Optional version-control collaborator settings; without them, gather
    /// and freeze work from local store contents only.
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// Checkout the history queries run against.
    pub repo: PathBuf,

    /// Revision additions/removals are computed since.
    #[serde(default = "default_base_reference")]
    pub base_reference: String,

    /// Repo-relative path of the corpus collection.
    pub corpus_prefix: String,

    /// Repo-relative path of the crashes collection.
    pub crashes_prefix: String,
}

impl HistoryConfig {
    pub fn prefixes(&self) -> Vec<String> {
        vec![self.corpus_prefix.clone(), self.crashes_prefix.clone()]
    }
}

impl Config {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            build: default_build(),
            archive: default_archive(),
            name_length: default_name_length(),
            name_ceiling: default_name_ceiling(),
            limit: None,
            sequential: false,
            timeout_secs: default_timeout_secs(),
            deny: Vec::new(),
            history: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn seen_path(&self) -> PathBuf {
        self.root.join("seen.json")
    }

    pub fn name_length(&self) -> NameLength {
        NameLength::with_ceiling(self.name_length, self.name_ceiling)
    }

    pub fn exec_policy(&self) -> ExecPolicy {
        if self.sequential {
            ExecPolicy::Sequential
        } else {
            ExecPolicy::Bounded(self.limit.unwrap_or_else(crate::sched::default_limit))
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_build() -> PathBuf {
    PathBuf::from("build")
}

fn default_archive() -> PathBuf {
    PathBuf::from("cases.json")
}

fn default_name_length() -> usize {
    DEFAULT_NAME_LEN
}

fn default_name_ceiling() -> usize {
    MAX_NAME_LEN
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_base_reference() -> String {
    "HEAD".to_string()
}
