//! Metadata persistence, id allocation and consistency checks.

use bugscout::{Facet, KbError, KnowledgeBase, RowId, WeightOverride};
use tempfile::TempDir;

use crate::common::{record, toy_settings, vectors};

fn metadata_path(temp_dir: &TempDir) -> std::path::PathBuf {
    temp_dir.path().join("data").join("metadata.json")
}

fn add_summary(kb: &KnowledgeBase, identifier: &str, v: &[f32]) -> RowId {
    kb.add_record(record(identifier, "x"), vectors(&[(Facet::Summary, v)]))
        .unwrap()
        .row_ids[0]
}

#[test]
fn test_corrupt_metadata_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    {
        let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        add_summary(&kb, "BUG-1", &[1.0, 0.0]);
    }
    std::fs::write(metadata_path(&temp_dir), "{ not json").unwrap();

    let err = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap_err();
    assert!(matches!(err, KbError::MetadataCorruption { .. }));
    assert_eq!(err.status_code(), "METADATA_CORRUPTION");
    assert!(!err.recovery_suggestions().is_empty());
}

#[test]
fn test_corrupt_metadata_recovery_moves_file_aside() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("data")).unwrap();
    std::fs::write(metadata_path(&temp_dir), "{ not json").unwrap();

    let mut settings = toy_settings(&temp_dir, 2);
    settings.storage.recover_corrupt_metadata = true;
    let kb = KnowledgeBase::open(settings).unwrap();
    assert_eq!(kb.stats().records, 0);

    let moved: Vec<_> = std::fs::read_dir(temp_dir.path().join("data"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("metadata.json.corrupt-")
        })
        .collect();
    assert_eq!(moved.len(), 1);
    assert_eq!(
        std::fs::read_to_string(moved[0].path()).unwrap(),
        "{ not json"
    );
}

#[test]
fn test_row_ids_are_never_reused() {
    let temp_dir = TempDir::new().unwrap();
    let retired = {
        let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        let first = add_summary(&kb, "BUG-1", &[1.0, 0.0]);
        let second = add_summary(&kb, "BUG-2", &[0.0, 1.0]);
        assert_eq!((first.value(), second.value()), (0, 1));
        assert!(kb.retire(second).unwrap());
        assert!(!kb.retire(second).unwrap());
        second
    };

    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    let third = add_summary(&kb, "BUG-3", &[0.0, 1.0]);
    assert_eq!(third.value(), 2);

    let response = kb
        .search(&vectors(&[(Facet::Summary, &[0.0, 1.0])]), &WeightOverride::Auto, 5)
        .unwrap();
    assert!(response.hits.iter().all(|hit| hit.row_id != retired));
    assert_eq!(response.hits[0].record.identifier, "BUG-3");
    assert_eq!(kb.stats().active_records, 2);
}

#[test]
fn test_retire_unknown_row() {
    let temp_dir = TempDir::new().unwrap();
    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    let err = kb.retire(RowId::new(42)).unwrap_err();
    assert!(matches!(err, KbError::RecordNotFound { .. }));
}

#[test]
fn test_verify_reports_orphaned_rows() {
    let temp_dir = TempDir::new().unwrap();
    {
        let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        add_summary(&kb, "BUG-1", &[1.0, 0.0]);
        add_summary(&kb, "BUG-2", &[0.0, 1.0]);
        assert!(kb.verify().is_consistent());
    }
    std::fs::remove_file(metadata_path(&temp_dir)).unwrap();

    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    let report = kb.verify();
    assert!(!report.is_consistent());
    assert_eq!(
        report.orphans[&Facet::Summary],
        vec![RowId::new(0), RowId::new(1)]
    );

    // Orphans never surface as hits
    let response = kb
        .search(&vectors(&[(Facet::Summary, &[1.0, 0.0])]), &WeightOverride::Auto, 5)
        .unwrap();
    assert!(response.hits.is_empty());
}
