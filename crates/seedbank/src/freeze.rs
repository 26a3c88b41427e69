//! Frozen snapshot of the store and the append-only seen ledger.
//!
//! The archive is a JSON object from content id to a base64-encoded,
//! xz-compressed copy of the original bytes, written with sorted keys and
//! fixed indentation so a re-export with no semantic change is byte-identical.
//! Only printable text is admitted; binary inputs would defeat the
//! diff-friendly, review-in-versioncontrol design. The seen ledger records
//! every processed id regardless, so the next run never re-fetches content it
//! has already judged.

use crate::hash::ContentId;
use crate::history::History;
use crate::sched::ExecPolicy;
use crate::store::Store;
use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything freeze needs beyond the store: destinations, the deny-list,
/// and (optionally) where to pull historical additions from.
#[derive(Debug, Clone)]
pub struct FreezeOptions {
    pub archive_path: PathBuf,
    pub seen_path: PathBuf,
    pub deny: BTreeSet<String>,
    pub prefixes: Vec<String>,
    pub base_reference: String,
    pub policy: ExecPolicy,
}

/// `string.printable` semantics: ASCII graphic characters plus whitespace.
pub fn is_printable(data: &[u8]) -> bool {
    data.iter()
        .all(|b| matches!(b, b' '..=b'~' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c))
}

/// Base64 text of the xz-compressed payload, as stored in the archive.
pub fn encode_case(bytes: &[u8]) -> Result<String> {
    let mut encoder = XzEncoder::new(Vec::new(), 9);
    encoder.write_all(bytes).context("compress case")?;
    let compressed = encoder.finish().context("finish compressing case")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Inverse of [`encode_case`]; the round-trip law the archive guarantees.
pub fn decode_case(value: &str) -> Result<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(value)
        .context("decode archive value")?;
    let mut decoder = XzDecoder::new(compressed.as_slice());
    let mut bytes = Vec::new();
    decoder
        .read_to_end(&mut bytes)
        .context("decompress archive value")?;
    Ok(bytes)
}

/// Export the store (and, when a [`History`] is supplied, content added
/// historically under the configured prefixes) into the frozen archive.
/// Returns the number of newly archived cases.
pub async fn freeze(
    store: &Store,
    history: Option<Arc<dyn History>>,
    options: &FreezeOptions,
) -> Result<usize> {
    let mut archive = load_archive(&options.archive_path)?;
    let mut seen = load_seen(&options.seen_path)?;

    let mut candidates: BTreeMap<ContentId, Vec<u8>> = BTreeMap::new();
    for file in store.gather()? {
        let bytes =
            std::fs::read(&file).with_context(|| format!("read case {}", file.display()))?;
        candidates.insert(ContentId::of(&bytes), bytes);
    }
    if let Some(ref history) = history {
        for bytes in historical_objects(history.clone(), options).await? {
            candidates.entry(ContentId::of(&bytes)).or_insert(bytes);
        }
    }

    let mut archived = 0;
    for (id, bytes) in candidates {
        let key = id.as_hex().to_string();
        if options.deny.contains(&key) || seen.contains(&key) || archive.contains_key(&key) {
            continue;
        }
        // The ledger grows for every processed id, printable or not.
        seen.insert(key.clone());
        if is_printable(&bytes) {
            archive.insert(key, encode_case(&bytes)?);
            archived += 1;
        }
    }

    write_sorted_json(&options.archive_path, &archive)?;
    write_sorted_json(&options.seen_path, &seen)?;
    tracing::info!(
        archived,
        total = archive.len(),
        seen = seen.len(),
        "froze corpus snapshot"
    );
    Ok(archived)
}

/// Blobs added under all configured prefixes since the base reference.
pub(crate) async fn historical_objects(
    history: Arc<dyn History>,
    options: &FreezeOptions,
) -> Result<Vec<Vec<u8>>> {
    objects_added_under(history, &options.prefixes, &options.base_reference, options.policy)
        .await
}

/// Blobs added under `prefixes` since `base`, fetched through the scheduler.
/// Callers that care which collection a blob belongs to query one prefix at a
/// time.
pub(crate) async fn objects_added_under(
    history: Arc<dyn History>,
    prefixes: &[String],
    base: &str,
    policy: ExecPolicy,
) -> Result<Vec<Vec<u8>>> {
    let commits = history.added_paths_since(prefixes, base).await?;
    let mut objects = BTreeSet::new();
    for (commit, _paths) in &commits {
        for object in history.tree_objects(commit, prefixes).await? {
            objects.insert(object);
        }
    }
    let ops = objects.into_iter().map(|object| {
        let history = history.clone();
        async move {
            history
                .cat_object(&object)
                .await
                .with_context(|| format!("fetch object {object}"))
        }
    });
    policy.run(ops).await
}

fn load_archive(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read archive {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse archive {}", path.display()))
}

fn load_seen(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let ids: Vec<String> =
        serde_json::from_str(&text).with_context(|| format!("parse ledger {}", path.display()))?;
    Ok(ids.into_iter().collect())
}

/// Serialize with sorted keys (BTree order), 4-space indentation, and a
/// trailing newline: repeated exports with no semantic change are
/// byte-identical.
fn write_sorted_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push(b'\n');
    std::fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_accepts_text_and_whitespace() {
        assert!(is_printable(b"fn main() {}\n\ttab\r\n"));
        assert!(!is_printable(b"\x00binary"));
        assert!(!is_printable("unicode snowman \u{2603}".as_bytes()));
    }

    #[test]
    fn encode_decode_round_trips() {
        let original = b"some corpus case\nwith lines\n";
        let encoded = encode_case(original).unwrap();
        assert_eq!(decode_case(&encoded).unwrap(), original.to_vec());
    }

    #[test]
    fn sorted_json_output_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.json");
        let mut map = BTreeMap::new();
        map.insert("bb".to_string(), "2".to_string());
        map.insert("aa".to_string(), "1".to_string());
        write_sorted_json(&path, &map).unwrap();
        let first = std::fs::read(&path).unwrap();
        write_sorted_json(&path, &map).unwrap();
        assert_eq!(first, std::fs::read(&path).unwrap());
        let text = String::from_utf8(first).unwrap();
        assert!(text.starts_with("{\n    \"aa\""));
        assert!(text.ends_with("}\n"));
    }
}
