//! The content-addressed corpus/crash store.
//!
//! Layout under the root: `corpus/<2-hex>/<rest-hex>` and
//! `crashes/<2-hex>/<rest-hex>`, plus transient `.done` markers inside corpus
//! bucket directories. Truncated names never alias distinct content: a trim
//! pass that detects aliasing is thrown away wholesale and retried with one
//! more hex character, because a shorter length could have produced other
//! aliasing the pass had not reached yet.
//!
//! Nothing here takes a lock; the pipeline never runs two trim or regression
//! passes against the same root concurrently, and violating that is misuse.

use crate::conflict;
use crate::errors::StoreError;
use crate::hash::{ContentId, NameLength};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Bucket marker: the bucket's regression batch completed without a retry in
/// the current session.
pub const DONE_MARKER: &str = ".done";

/// Filename prefixes the fuzzing engine uses for failure artifacts.
pub const ARTIFACT_PREFIXES: [&str; 3] = ["crash-", "leak-", "timeout-"];

/// The two named collections a stored case can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    /// Accepted, minimized inputs that do not currently trigger a failure.
    Corpus,
    /// Inputs currently believed to trigger a failure.
    Crashes,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Corpus, Collection::Crashes];

    pub fn dir_name(self) -> &'static str {
        match self {
            Collection::Corpus => "corpus",
            Collection::Crashes => "crashes",
        }
    }
}

/// Directory-backed set of deduplicated fuzz inputs under an explicit root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.dir_name())
    }

    pub fn corpus(&self) -> PathBuf {
        self.dir(Collection::Corpus)
    }

    pub fn crashes(&self) -> PathBuf {
        self.dir(Collection::Crashes)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for collection in Collection::ALL {
            let dir = self.dir(collection);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create collection dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Every stored case across both collections, sorted. Done markers are
    /// not cases.
    pub fn gather(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for collection in Collection::ALL {
            walk(&self.dir(collection), &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    /// Write raw bytes as a new case under its full content id, trusting a
    /// later trim pass to truncate and bucket it. Writing content that is
    /// already present is a no-op.
    pub fn write_full(&self, collection: Collection, bytes: &[u8]) -> Result<PathBuf> {
        let id = ContentId::of(bytes);
        let dir = self.dir(collection);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let dest = dir.join(id.as_hex());
        if !dest.exists() {
            fs::write(&dest, bytes).with_context(|| format!("write case {}", dest.display()))?;
        }
        Ok(dest)
    }

    /// Scan both collections for unresolved merge-conflict markers; split
    /// each hit into its non-empty sections, store those as independent
    /// cases, and delete the original. Returns the number of files repaired.
    pub fn recover_conflicts(&self) -> Result<usize> {
        let mut repaired = 0;
        for file in self.gather()? {
            let bytes =
                fs::read(&file).with_context(|| format!("read case {}", file.display()))?;
            if !conflict::has_conflict(&bytes) {
                continue;
            }
            let parent = file
                .parent()
                .with_context(|| format!("case without parent dir: {}", file.display()))?;
            for section in conflict::split_sections(&bytes) {
                let recovered = parent.join(ContentId::of(section).as_hex());
                fs::write(&recovered, section)
                    .with_context(|| format!("write recovered case {}", recovered.display()))?;
            }
            fs::remove_file(&file)
                .with_context(|| format!("remove conflicted case {}", file.display()))?;
            tracing::info!(file = %file.display(), "split merge-conflicted case");
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Relocate fuzzing-engine failure artifacts (`crash-*`, `leak-*`,
    /// `timeout-*`) found under `search_root` into the crashes collection,
    /// named by full content hash so they cannot collide with anything
    /// already trimmed.
    pub fn collect_artifacts(&self, search_root: &Path) -> Result<usize> {
        let mut files = Vec::new();
        walk(search_root, &mut files)?;
        files.sort();
        let crashes = self.crashes();
        let mut moved = 0;
        for file in files {
            if file.starts_with(&crashes) {
                continue;
            }
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let bytes =
                fs::read(&file).with_context(|| format!("read artifact {}", file.display()))?;
            self.write_full(Collection::Crashes, &bytes)?;
            fs::remove_file(&file)
                .with_context(|| format!("remove artifact {}", file.display()))?;
            tracing::info!(artifact = %file.display(), "relocated failure artifact");
            moved += 1;
        }
        Ok(moved)
    }

    /// Bring both collections into canonical, deduplicated, bucketed form.
    ///
    /// Order: conflict recovery, artifact relocation from `artifact_roots`,
    /// the truncation/rename loop (restarted from scratch with a bumped name
    /// length on collision), then cross-collection dedup. Returns the name
    /// length the pass converged at.
    pub fn trim(&self, start: NameLength, artifact_roots: &[PathBuf]) -> Result<NameLength> {
        self.ensure_layout()?;
        self.recover_conflicts()?;
        for root in artifact_roots {
            if root.is_dir() {
                self.collect_artifacts(root)?;
            }
        }
        let mut len = start;
        loop {
            match self.trim_pass(len) {
                Ok(()) => break,
                Err(err) => match err.downcast_ref::<StoreError>() {
                    Some(StoreError::TruncationCollision { .. }) => {
                        len = len.bump()?;
                        tracing::warn!(
                            name_length = len.get(),
                            "truncation collision, restarting trim pass"
                        );
                    }
                    _ => return Err(err),
                },
            }
        }
        self.dedup_crashes()?;
        Ok(len)
    }

    fn trim_pass(&self, len: NameLength) -> Result<()> {
        for file in self.gather()? {
            let bytes =
                fs::read(&file).with_context(|| format!("read case {}", file.display()))?;
            let id = ContentId::of(&bytes);
            if current_name(&file) == Some(id.truncated(len).to_string()) {
                continue;
            }
            let (bucket_dir, rest) = id.bucket(len);
            // An already-trimmed file in either collection that shares the
            // truncated name but not the content means this length aliases.
            for collection in Collection::ALL {
                let candidate = self.dir(collection).join(&bucket_dir).join(&rest);
                if candidate.exists() && candidate != file {
                    let other = fs::read(&candidate)
                        .with_context(|| format!("read case {}", candidate.display()))?;
                    if ContentId::of(&other) != id {
                        return Err(StoreError::TruncationCollision {
                            name_length: len.get(),
                        }
                        .into());
                    }
                }
            }
            let collection = self.collection_of(&file).with_context(|| {
                format!("case outside both collections: {}", file.display())
            })?;
            let dest = self.dir(collection).join(&bucket_dir).join(&rest);
            let dest_dir = dest
                .parent()
                .with_context(|| format!("bucket without parent: {}", dest.display()))?;
            fs::create_dir_all(dest_dir)
                .with_context(|| format!("create bucket {}", dest_dir.display()))?;
            // Renaming onto an identical-content destination deduplicates.
            fs::rename(&file, &dest).with_context(|| {
                format!("rename {} -> {}", file.display(), dest.display())
            })?;
        }
        Ok(())
    }

    /// A minimized corpus already covers any behavior a same-content crash
    /// record would; the crashes copy is the redundant one.
    fn dedup_crashes(&self) -> Result<usize> {
        let mut files = Vec::new();
        walk(&self.crashes(), &mut files)?;
        let mut removed = 0;
        for file in files {
            let rel = file
                .strip_prefix(self.crashes())
                .context("crash case outside crashes dir")?
                .to_path_buf();
            if self.corpus().join(&rel).is_file() {
                fs::remove_file(&file)
                    .with_context(|| format!("remove duplicate crash {}", file.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn collection_of(&self, file: &Path) -> Option<Collection> {
        let rel = file.strip_prefix(&self.root).ok()?;
        let first = rel.components().next()?.as_os_str();
        Collection::ALL
            .into_iter()
            .find(|c| first == c.dir_name())
    }

    /// Immediate bucket subdirectories of the corpus collection, sorted.
    pub fn corpus_buckets(&self) -> Result<Vec<PathBuf>> {
        let corpus = self.corpus();
        if !corpus.is_dir() {
            return Ok(Vec::new());
        }
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&corpus)
            .with_context(|| format!("list corpus {}", corpus.display()))?
        {
            let path = entry.context("read corpus entry")?.path();
            if path.is_dir() {
                buckets.push(path);
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    /// Input files of one bucket, sorted, done marker excluded.
    pub fn bucket_inputs(&self, bucket: &Path) -> Result<Vec<PathBuf>> {
        let mut inputs = Vec::new();
        for entry in
            fs::read_dir(bucket).with_context(|| format!("list bucket {}", bucket.display()))?
        {
            let path = entry.context("read bucket entry")?.path();
            if path.is_file() && path.file_name().is_some_and(|n| n != DONE_MARKER) {
                inputs.push(path);
            }
        }
        inputs.sort();
        Ok(inputs)
    }

    pub fn is_done(&self, bucket: &Path) -> bool {
        bucket.join(DONE_MARKER).exists()
    }

    pub fn mark_done(&self, bucket: &Path) -> Result<()> {
        let marker = bucket.join(DONE_MARKER);
        fs::write(&marker, b"").with_context(|| format!("touch {}", marker.display()))
    }

    /// Delete every done marker so the next session starts clean.
    pub fn clear_done_markers(&self) -> Result<usize> {
        let mut cleared = 0;
        for bucket in self.corpus_buckets()? {
            let marker = bucket.join(DONE_MARKER);
            if marker.exists() {
                fs::remove_file(&marker)
                    .with_context(|| format!("remove {}", marker.display()))?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

fn current_name(file: &Path) -> Option<String> {
    let name = file.file_name()?.to_str()?;
    let parent = file.parent()?.file_name()?.to_str()?;
    Some(format!("{parent}{name}"))
}

/// Recursive file walk, skipping `.git` and done markers. A missing
/// directory yields nothing.
fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry.with_context(|| format!("read entry in {}", dir.display()))?.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            walk(&path, out)?;
        } else if path.is_file() && path.file_name().is_some_and(|n| n != DONE_MARKER) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.ensure_layout().unwrap();
        (dir, store)
    }

    /// Two distinct payloads whose content ids share their first `prefix_len`
    /// hex characters, found by search. Cheap for short prefixes.
    fn colliding_pair(prefix_len: usize) -> (Vec<u8>, Vec<u8>) {
        let mut by_prefix: std::collections::HashMap<String, Vec<u8>> =
            std::collections::HashMap::new();
        for i in 0u32..200_000 {
            let payload = format!("case-{i}").into_bytes();
            let prefix = ContentId::of(&payload).as_hex()[..prefix_len].to_string();
            if let Some(existing) = by_prefix.get(&prefix) {
                return (existing.clone(), payload);
            }
            by_prefix.insert(prefix, payload);
        }
        panic!("no {prefix_len}-hex collision found in search window");
    }

    #[test]
    fn aliasing_contents_surface_a_typed_collision() {
        let (_dir, store) = store();
        let (a, b) = colliding_pair(3);
        store.write_full(Collection::Corpus, &a).unwrap();
        store.write_full(Collection::Corpus, &b).unwrap();
        let err = store
            .trim_pass(NameLength::with_ceiling(3, 32))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::TruncationCollision { name_length: 3 })
        );
    }

    #[test]
    fn write_full_is_idempotent() {
        let (_dir, store) = store();
        let a = store.write_full(Collection::Corpus, b"case").unwrap();
        let b = store.write_full(Collection::Corpus, b"case").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.gather().unwrap().len(), 1);
    }

    #[test]
    fn trim_buckets_cases_under_truncated_names() {
        let (_dir, store) = store();
        store.write_full(Collection::Corpus, b"alpha").unwrap();
        store.write_full(Collection::Crashes, b"beta").unwrap();
        let len = store.trim(NameLength::new(14), &[]).unwrap();
        assert_eq!(len.get(), 14);

        let id = ContentId::of(b"alpha");
        let (bucket, rest) = id.bucket(len);
        assert!(store.corpus().join(bucket).join(rest).is_file());
    }

    #[test]
    fn trim_twice_changes_nothing() {
        let (_dir, store) = store();
        store.write_full(Collection::Corpus, b"one").unwrap();
        store.write_full(Collection::Corpus, b"two").unwrap();
        store.write_full(Collection::Crashes, b"three").unwrap();
        store.trim(NameLength::new(14), &[]).unwrap();
        let before = store.gather().unwrap();
        store.trim(NameLength::new(14), &[]).unwrap();
        assert_eq!(before, store.gather().unwrap());
    }

    #[test]
    fn identical_content_across_files_dedups() {
        let (_dir, store) = store();
        // Same bytes under two stale names collapse to one case.
        std::fs::write(store.corpus().join("stale-a"), b"same").unwrap();
        std::fs::write(store.corpus().join("stale-b"), b"same").unwrap();
        store.trim(NameLength::new(14), &[]).unwrap();
        assert_eq!(store.gather().unwrap().len(), 1);
    }

    #[test]
    fn crashes_copy_of_corpus_content_is_removed() {
        let (_dir, store) = store();
        store.write_full(Collection::Corpus, b"shared").unwrap();
        store.write_full(Collection::Crashes, b"shared").unwrap();
        store.trim(NameLength::new(14), &[]).unwrap();
        let remaining = store.gather().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].starts_with(store.corpus()));
    }

    #[test]
    fn conflicted_case_is_replaced_by_sections() {
        let (_dir, store) = store();
        let conflicted =
            b"<<<<<<< HEAD\nleft payload\n=======\nright payload\n>>>>>>> other\n";
        std::fs::write(store.corpus().join("broken"), conflicted).unwrap();
        let repaired = store.recover_conflicts().unwrap();
        assert_eq!(repaired, 1);
        assert!(!store.corpus().join("broken").exists());
        let cases = store.gather().unwrap();
        assert_eq!(cases.len(), 2);
        let contents: Vec<Vec<u8>> = cases.iter().map(|p| std::fs::read(p).unwrap()).collect();
        assert!(contents.contains(&b"left payload\n".to_vec()));
        assert!(contents.contains(&b"right payload\n".to_vec()));
    }

    #[test]
    fn artifacts_move_into_crashes_under_full_hash() {
        let (_dir, store) = store();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("crash-1a2b"), b"boom").unwrap();
        std::fs::write(scratch.path().join("notes.txt"), b"keep").unwrap();
        let moved = store.collect_artifacts(scratch.path()).unwrap();
        assert_eq!(moved, 1);
        assert!(scratch.path().join("notes.txt").exists());
        let expected = store.crashes().join(ContentId::of(b"boom").as_hex());
        assert!(expected.is_file());
    }

    #[test]
    fn done_markers_round_trip() {
        let (_dir, store) = store();
        store.write_full(Collection::Corpus, b"case").unwrap();
        store.trim(NameLength::new(14), &[]).unwrap();
        let buckets = store.corpus_buckets().unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(!store.is_done(&buckets[0]));
        store.mark_done(&buckets[0]).unwrap();
        assert!(store.is_done(&buckets[0]));
        // Markers are not inputs and not cases.
        assert_eq!(store.bucket_inputs(&buckets[0]).unwrap().len(), 1);
        assert_eq!(store.gather().unwrap().len(), 1);
        assert_eq!(store.clear_done_markers().unwrap(), 1);
        assert!(!store.is_done(&buckets[0]));
    }
}
