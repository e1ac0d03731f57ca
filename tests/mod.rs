//! Main test module for Mimic
//!
//! This module includes all test suites:
//! - Integration tests against a loopback HTTP remote
//! - Property-based tests for manifest and diff invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::mimic::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_collection() {
        let temp_dir = TempDir::new().unwrap();
        let collection = Collection::init(temp_dir.path()).unwrap();

        let summary = collection.add(collection.root(), &ScanOptions::default()).unwrap();
        assert_eq!(summary.files + summary.folders, 0);
        assert!(collection.load_manifest().unwrap().is_empty());
        assert_eq!(collection.info().unwrap(), InventorySummary::default());
    }

    #[test]
    fn test_unmanaged_path_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        match Collection::open(temp_dir.path()) {
            Err(MimicError::RootNotManaged(_)) => {}
            other => panic!("expected RootNotManaged, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_file_and_unicode_name() {
        let temp_dir = TempDir::new().unwrap();
        let collection = Collection::init(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("empty"), b"").unwrap();
        fs::write(temp_dir.path().join("données.txt"), "é").unwrap();

        collection.add(collection.root(), &ScanOptions::default()).unwrap();
        let records = collection.load_manifest().unwrap();
        let empty = records.get("./empty").unwrap();
        assert_eq!(empty.length, 0);
        assert_eq!(empty.checksum, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert!(!empty.is_dir());
        assert!(records.contains("./données.txt"));

        // Stored form reloads identically
        let reloaded = mimic::manifest::load_from(&collection.manifest_path()).unwrap();
        assert_eq!(reloaded, records);
    }

    #[test]
    fn test_refresh_detects_file_replaced_by_folder() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let collection = Collection::init(root).unwrap();
        fs::write(root.join("thing"), b"file").unwrap();
        collection.add(root, &ScanOptions::default()).unwrap();

        fs::remove_file(root.join("thing")).unwrap();
        fs::create_dir(root.join("thing")).unwrap();
        collection.refresh(root, &RefreshOptions::default()).unwrap();

        let records = collection.load_manifest().unwrap();
        assert!(records.get("./thing").unwrap().is_dir());
        let report = collection.status(root, &RefreshOptions::default()).unwrap();
        assert!(!report.has_changes());
    }
}
