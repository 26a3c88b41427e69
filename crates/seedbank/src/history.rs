//! Version-control history collaborator.
//!
//! The pipeline only ever asks four narrow questions of the VCS: which paths
//! were added since a revision, which were removed, which objects sit under a
//! commit's tree, and what an object's bytes are. [`History`] is the seam;
//! [`GitHistory`] answers over a real git checkout. Tests substitute their
//! own impl.

use crate::process;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[async_trait]
pub trait History: Send + Sync {
    /// Commits since `base` that added or modified files under any of
    /// `prefixes`, each with the matching paths. Entries with no matching
    /// path are dropped.
    async fn added_paths_since(
        &self,
        prefixes: &[String],
        base: &str,
    ) -> Result<Vec<(String, Vec<String>)>>;

    /// Paths under `prefixes` deleted by commits since `base`, sorted and
    /// deduplicated.
    async fn removed_paths_since(&self, prefixes: &[String], base: &str) -> Result<Vec<String>>;

    /// Object ids of every blob under `prefixes` in `commit`'s tree.
    async fn tree_objects(&self, commit: &str, prefixes: &[String]) -> Result<Vec<String>>;

    /// Raw bytes of one object.
    async fn cat_object(&self, object: &str) -> Result<Vec<u8>>;
}

/// [`History`] over a git checkout at `repo`.
#[derive(Debug, Clone)]
pub struct GitHistory {
    repo: PathBuf,
}

impl GitHistory {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn name_only_log(
        &self,
        prefixes: &[String],
        base: &str,
        diff_filter: &str,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let mut args: Vec<String> = vec![
            "log".into(),
            "--break-rewrites=0".into(),
            "--find-renames=100%".into(),
            "--no-renames".into(),
            "--name-only".into(),
            "--pretty=format:commit:%H".into(),
            diff_filter.into(),
            base.into(),
            "--".into(),
        ];
        args.extend(prefixes.iter().cloned());
        let out = process::git(&self.repo, args)
            .await
            .context("git log for history query")?;

        let mut commits: Vec<(String, Vec<String>)> = Vec::new();
        for line in process::lines(&out) {
            if let Some(sha) = line.strip_prefix("commit:") {
                commits.push((sha.to_string(), Vec::new()));
            } else if let Some((_, paths)) = commits.last_mut() {
                if prefixes.iter().any(|p| line.starts_with(p.as_str())) {
                    paths.push(line);
                }
            }
        }
        commits.retain(|(_, paths)| !paths.is_empty());
        Ok(commits)
    }
}

#[async_trait]
impl History for GitHistory {
    async fn added_paths_since(
        &self,
        prefixes: &[String],
        base: &str,
    ) -> Result<Vec<(String, Vec<String>)>> {
        // --diff-filter=d: everything except deletions.
        self.name_only_log(prefixes, base, "--diff-filter=d").await
    }

    async fn removed_paths_since(&self, prefixes: &[String], base: &str) -> Result<Vec<String>> {
        let commits = self.name_only_log(prefixes, base, "--diff-filter=D").await?;
        let paths: BTreeSet<String> = commits
            .into_iter()
            .flat_map(|(_, paths)| paths)
            .collect();
        Ok(paths.into_iter().collect())
    }

    async fn tree_objects(&self, commit: &str, prefixes: &[String]) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            "ls-tree".into(),
            "--full-tree".into(),
            "--object-only".into(),
            "-r".into(),
            commit.into(),
        ];
        args.extend(prefixes.iter().cloned());
        let out = process::git(&self.repo, args)
            .await
            .with_context(|| format!("git ls-tree {commit}"))?;
        Ok(process::lines(&out))
    }

    async fn cat_object(&self, object: &str) -> Result<Vec<u8>> {
        process::git(&self.repo, ["cat-file", "-p", object])
            .await
            .with_context(|| format!("git cat-file {object}"))
    }
}
