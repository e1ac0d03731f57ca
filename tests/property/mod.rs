//! Property-based testing for Mimic
//!
//! Uses proptest to check manifest storage and sync planning across randomly
//! generated inventories.

use ::mimic::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tempfile::TempDir;

/// Generate `./`-prefixed relative record paths
fn path_strategy() -> impl Strategy<Value = String> {
    let component = prop_oneof!["[a-z,]{1,8}", "dir[0-9]{1,2}", "[a-z, ]{1,6}\\.(txt|csv|dat)"];
    prop::collection::vec(component, 1..=4).prop_map(|parts| format!("./{}", parts.join("/")))
}

/// Generate a file or directory record
fn record_strategy() -> impl Strategy<Value = ManifestRecord> {
    (
        path_strategy(),
        any::<bool>(),
        0u64..10_000_000,
        0u64..4_000_000_000_000,
        "[0-9a-f]{40}",
    )
        .prop_map(|(path, is_dir, length, modified, checksum)| {
            if is_dir {
                ManifestRecord::directory(modified, path)
            } else {
                ManifestRecord::file(length, modified, checksum, path)
            }
        })
}

fn manifest_strategy() -> impl Strategy<Value = Manifest> {
    prop::collection::vec(record_strategy(), 0..40).prop_map(|records| records.into_iter().collect())
}

fn paths(records: &[ManifestRecord]) -> Vec<&str> {
    records.iter().map(|r| r.path.as_str()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_manifest_store_load_preserves_records(records in manifest_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checksum.mimic");

        mimic::manifest::store_to(&path, &records).unwrap();
        let loaded = mimic::manifest::load_from(&path).unwrap();
        prop_assert_eq!(loaded, records);
    }

    #[test]
    fn prop_diff_of_identical_manifests_is_empty(records in manifest_strategy()) {
        let plan = diff(&records, &records);
        prop_assert!(plan.copy.is_empty());
        prop_assert!(plan.delete.is_empty());
    }

    #[test]
    fn prop_diff_sides_and_ordering(local in manifest_strategy(), remote in manifest_strategy()) {
        let plan = diff(&local, &remote);

        // Copies come from the remote, deletes from the local side
        for record in &plan.copy {
            prop_assert_eq!(remote.get(&record.path), Some(record));
            prop_assert_ne!(local.get(&record.path), Some(record));
        }
        for record in &plan.delete {
            prop_assert_eq!(local.get(&record.path), Some(record));
            prop_assert_ne!(remote.get(&record.path), Some(record));
        }

        // Copies ascend so parents precede children; deletes descend
        let copy = paths(&plan.copy);
        let mut sorted = copy.clone();
        sorted.sort();
        prop_assert_eq!(&copy, &sorted);

        let delete = paths(&plan.delete);
        let mut sorted = delete.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        prop_assert_eq!(&delete, &sorted);

        // Applying the plan to the local manifest yields the remote one
        let mut applied = local.clone();
        for record in &plan.delete {
            applied.remove(&record.path);
        }
        for record in &plan.copy {
            applied.insert(record.clone());
        }
        prop_assert_eq!(applied, remote);
    }

    #[test]
    fn prop_deletion_waves_run_deepest_first(records in manifest_strategy()) {
        let all: Vec<ManifestRecord> = records.descending().cloned().collect();
        let waves = mimic::sync::deletion_waves(&all);

        let total: usize = waves.iter().map(Vec::len).sum();
        prop_assert_eq!(total, all.len());

        let mut seen = BTreeSet::new();
        for wave in &waves {
            for record in wave {
                // No ancestor of this record was removed in an earlier wave
                for earlier in &seen {
                    let prefix = format!("{}/", earlier);
                    prop_assert!(!record.path.starts_with(&prefix));
                }
            }
            for record in wave {
                seen.insert(record.path.clone());
            }
        }
    }
}
