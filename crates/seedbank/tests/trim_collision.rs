//! Truncation-collision handling: distinct contents sharing a short hash
//! prefix must force the name length up and both survive under distinct
//! truncated names.

use seedbank::{Collection, ContentId, NameLength, Store};
use std::collections::HashMap;

/// Two distinct payloads whose content ids share their first `prefix_len`
/// hex characters, found by search. Cheap for short prefixes.
fn colliding_pair(prefix_len: usize) -> (Vec<u8>, Vec<u8>) {
    let mut by_prefix: HashMap<String, Vec<u8>> = HashMap::new();
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
fn collision_bumps_name_length_and_keeps_both() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    store.ensure_layout().unwrap();

    let (a, b) = colliding_pair(3);
    assert_ne!(a, b);
    store.write_full(Collection::Corpus, &a).unwrap();
    store.write_full(Collection::Corpus, &b).unwrap();

    let len = store.trim(NameLength::with_ceiling(3, 32), &[]).unwrap();
    assert!(len.get() > 3, "collision must increase the name length");

    let cases = store.gather().unwrap();
    assert_eq!(cases.len(), 2, "both contents survive under distinct names");
    let names: Vec<_> = cases
        .iter()
        .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect();
    assert_ne!(names[0], names[1]);

    let mut contents: Vec<Vec<u8>> = cases.iter().map(|p| std::fs::read(p).unwrap()).collect();
    contents.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(contents, expected);
}

#[test]
fn cross_collection_collision_is_detected_too() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    store.ensure_layout().unwrap();

    let (a, b) = colliding_pair(3);
    store.write_full(Collection::Corpus, &a).unwrap();
    store.write_full(Collection::Crashes, &b).unwrap();

    let len = store.trim(NameLength::with_ceiling(3, 32), &[]).unwrap();
    assert!(len.get() > 3);
    assert_eq!(store.gather().unwrap().len(), 2);
}

#[test]
fn ceiling_breach_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    store.ensure_layout().unwrap();

    let (a, b) = colliding_pair(3);
    store.write_full(Collection::Corpus, &a).unwrap();
    store.write_full(Collection::Corpus, &b).unwrap();

    // Ceiling equal to the colliding start length leaves no room to recover.
    let err = store
        .trim(NameLength::with_ceiling(3, 3), &[])
        .unwrap_err();
    assert!(
        err.downcast_ref::<seedbank::StoreError>().is_some(),
        "{err:#}"
    );
}

#[test]
fn converged_store_trims_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    store.ensure_layout().unwrap();

    for i in 0..32 {
        store
            .write_full(Collection::Corpus, format!("seed {i}").as_bytes())
            .unwrap();
    }
    store.trim(NameLength::new(14), &[]).unwrap();
    let first = store.gather().unwrap();
    store.trim(NameLength::new(14), &[]).unwrap();
    assert_eq!(first, store.gather().unwrap());
}
