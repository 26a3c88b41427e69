//! Top-level pipeline stages.
//!
//! Each stage fully drains before the next begins; trim never runs
//! concurrently with regression. These entry points are the only place an
//! external-process failure stops being data: [`exit_report`] turns it into
//! a clean report plus a process exit with the failing command's code.

use crate::config::{Config, HistoryConfig};
use crate::errors::ProcessError;
use crate::freeze::{self, FreezeOptions};
use crate::hash::{ContentId, NameLength};
use crate::history::History;
use crate::regress::{self, Regression};
use crate::store::{Collection, Store};
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Pull historical additions into the store, apply historical deletions, and
/// trim both collections into canonical form. Returns the name length trim
/// converged at.
pub async fn gather(cfg: &Config, history: Option<Arc<dyn History>>) -> Result<NameLength> {
    let store = Store::new(&cfg.root);
    store.ensure_layout()?;

    if let (Some(history), Some(hcfg)) = (history, cfg.history.as_ref()) {
        let known = known_ids(cfg, &store).await?;
        // One query per prefix so a blob lands in the collection its repo
        // path says it belongs to.
        let sources = [
            (hcfg.corpus_prefix.clone(), Collection::Corpus),
            (hcfg.crashes_prefix.clone(), Collection::Crashes),
        ];
        for (prefix, collection) in sources {
            let blobs = freeze::objects_added_under(
                history.clone(),
                std::slice::from_ref(&prefix),
                &hcfg.base_reference,
                cfg.exec_policy(),
            )
            .await?;
            for bytes in blobs {
                if !known.contains(&ContentId::of(&bytes)) {
                    store.write_full(collection, &bytes)?;
                }
            }
        }
        for path in history
            .removed_paths_since(&hcfg.prefixes(), &hcfg.base_reference)
            .await?
        {
            if let Some(local) = local_path(hcfg, &store, &path) {
                if local.is_file() {
                    std::fs::remove_file(&local)
                        .with_context(|| format!("apply deletion {}", local.display()))?;
                    tracing::info!(case = %local.display(), "removed historically deleted case");
                }
            }
        }
    }

    store.trim(cfg.name_length(), &artifact_roots(cfg))
}

/// Re-validate the whole crash collection against the current fuzz targets:
/// gather, promote inputs that no longer reproduce, then run regression
/// passes until one finds no failures. Done markers are cleared only when
/// the session concludes.
pub async fn retest(cfg: &Config, history: Option<Arc<dyn History>>) -> Result<()> {
    let mut len = gather(cfg, history).await?;
    let store = Store::new(&cfg.root);

    let targets = regress::fuzz_targets(&cfg.build)?;
    if targets.is_empty() {
        bail!("no fuzz targets built under {}", cfg.build.display());
    }
    // Targets run in a scratch dir under the store root so the engine's
    // failure artifacts land somewhere every trim scans.
    let scratch = cfg.root.join("scratch");
    std::fs::create_dir_all(&scratch)
        .with_context(|| format!("create scratch dir {}", scratch.display()))?;
    let regression = Regression::new(store.clone(), targets, cfg.exec_policy(), cfg.timeout())
        .with_work_dir(&scratch);

    let promoted = regression.revalidate_crashes().await?;
    if promoted > 0 {
        tracing::info!(promoted, "crash inputs no longer reproduce");
    }
    let roots = artifact_roots(cfg);
    len = store.trim(len, &roots)?;

    loop {
        let failures = regression.pass().await?;
        if failures == 0 {
            break;
        }
        let cases = store.gather()?.len();
        tracing::info!(failures, cases, "regression failed, retrying");
        len = store.trim(len, &roots)?;
    }

    regression.finish_session()?;
    store.trim(len, &roots)?;
    Ok(())
}

/// Export the store into the frozen archive and update the seen ledger.
pub async fn freeze(cfg: &Config, history: Option<Arc<dyn History>>) -> Result<usize> {
    let store = Store::new(&cfg.root);
    // Without configured prefixes there is nothing sensible to ask the VCS.
    let history = if cfg.history.is_some() { history } else { None };
    freeze::freeze(&store, history, &freeze_options(cfg)).await
}

/// Directories scanned for engine failure artifacts before a trim: the build
/// tree and the store root (which contains the scratch working directory the
/// targets run in).
fn artifact_roots(cfg: &Config) -> Vec<PathBuf> {
    vec![cfg.build.clone(), cfg.root.clone()]
}

/// Derive [`FreezeOptions`] from the configuration.
pub fn freeze_options(cfg: &Config) -> FreezeOptions {
    FreezeOptions {
        archive_path: cfg.archive.clone(),
        seen_path: cfg.seen_path(),
        deny: cfg.deny.iter().cloned().collect(),
        prefixes: cfg
            .history
            .as_ref()
            .map(HistoryConfig::prefixes)
            .unwrap_or_default(),
        base_reference: cfg
            .history
            .as_ref()
            .map(|h| h.base_reference.clone())
            .unwrap_or_else(|| "HEAD".to_string()),
        policy: cfg.exec_policy(),
    }
}

/// Report a pipeline failure and exit. An external-process failure exits
/// with the failing command's code after its captured output is logged;
/// anything else is logged and exits 1.
pub fn exit_report(err: &anyhow::Error) -> ! {
    if let Some(perr) = err.downcast_ref::<ProcessError>() {
        perr.exit()
    }
    tracing::error!("{err:#}");
    std::process::exit(1)
}

/// Content ids of everything already stored, hashed through the scheduler.
async fn known_ids(cfg: &Config, store: &Store) -> Result<BTreeSet<ContentId>> {
    let ops = store.gather()?.into_iter().map(|file| async move {
        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("read case {}", file.display()))?;
        Ok(ContentId::of(&bytes))
    });
    let ids = cfg.exec_policy().run(ops).await?;
    Ok(ids.into_iter().collect())
}

/// Map a repo-relative path under one of the configured prefixes to its
/// location in the store.
fn local_path(hcfg: &HistoryConfig, store: &Store, path: &str) -> Option<PathBuf> {
    let strip = |prefix: &str| {
        path.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
    };
    if let Some(rest) = strip(&hcfg.corpus_prefix) {
        return Some(store.corpus().join(rest));
    }
    if let Some(rest) = strip(&hcfg.crashes_prefix) {
        return Some(store.crashes().join(rest));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_paths_map_into_collections() {
        let hcfg: HistoryConfig = serde_yaml::from_str(
            "repo: /src\ncorpus_prefix: tests/fuzz/corpus\ncrashes_prefix: tests/fuzz/crashes\n",
        )
        .unwrap();
        let store = Store::new("/data/fuzz");
        assert_eq!(
            local_path(&hcfg, &store, "tests/fuzz/corpus/ab/cdef"),
            Some(PathBuf::from("/data/fuzz/corpus/ab/cdef"))
        );
        assert_eq!(
            local_path(&hcfg, &store, "tests/fuzz/crashes/00/1122"),
            Some(PathBuf::from("/data/fuzz/crashes/00/1122"))
        );
        assert_eq!(local_path(&hcfg, &store, "docs/readme.md"), None);
    }
}
