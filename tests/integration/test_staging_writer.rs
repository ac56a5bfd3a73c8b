//! Background staging writer: batching, explicit flush and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bugscout::{Facet, KnowledgeBase, StagingWriter, WeightOverride};
use tempfile::TempDir;

use crate::common::{record, toy_settings, vectors};

fn shared_kb(temp_dir: &TempDir) -> Arc<KnowledgeBase> {
    Arc::new(KnowledgeBase::open(toy_settings(temp_dir, 2)).unwrap())
}

fn wait_for_records(kb: &KnowledgeBase, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if kb.stats().records >= expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_threshold_applies_batch() {
    let temp_dir = TempDir::new().unwrap();
    let kb = shared_kb(&temp_dir);
    let writer = StagingWriter::spawn(Arc::clone(&kb), 3, Duration::from_secs(60));

    for i in 0..3 {
        assert!(writer.submit(
            record(&format!("BUG-{i}"), "staged"),
            vectors(&[(Facet::Summary, &[1.0, i as f32])]),
        ));
    }

    assert!(wait_for_records(&kb, 3), "batch never landed");
    let response = kb
        .search(&vectors(&[(Facet::Summary, &[1.0, 0.0])]), &WeightOverride::Auto, 5)
        .unwrap();
    assert_eq!(response.hits.len(), 3);
    writer.shutdown();
}

#[test]
fn test_pending_records_invisible_until_flush() {
    let temp_dir = TempDir::new().unwrap();
    let kb = shared_kb(&temp_dir);
    let writer = StagingWriter::spawn(Arc::clone(&kb), 100, Duration::from_secs(60));

    writer.submit(
        record("BUG-1", "staged"),
        vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::Code, &[0.0, 1.0])]),
    );
    writer.submit(
        record("BUG-2", "staged"),
        vectors(&[(Facet::Summary, &[0.0, 1.0])]),
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(kb.stats().records, 0);

    let report = writer.flush().unwrap();
    assert_eq!(report.row_ids.len(), 2);
    assert!(report.is_complete());
    assert_eq!(kb.stats().records, 2);

    // Nothing pending: empty report
    let report = writer.flush().unwrap();
    assert!(report.row_ids.is_empty());
    assert!(report.facets.is_empty());
}

#[test]
fn test_interval_flushes_partial_batch() {
    let temp_dir = TempDir::new().unwrap();
    let kb = shared_kb(&temp_dir);
    let writer = StagingWriter::spawn(Arc::clone(&kb), 100, Duration::from_millis(50));

    writer.submit(
        record("BUG-1", "staged"),
        vectors(&[(Facet::Summary, &[1.0, 0.0])]),
    );
    assert!(wait_for_records(&kb, 1), "interval flush never happened");
    drop(writer);
}

#[test]
fn test_shutdown_applies_pending_work() {
    let temp_dir = TempDir::new().unwrap();
    let kb = shared_kb(&temp_dir);
    let writer = StagingWriter::spawn(Arc::clone(&kb), 100, Duration::from_secs(60));

    writer.submit(
        record("BUG-1", "staged"),
        vectors(&[(Facet::LogInfo, &[1.0, 0.0])]),
    );
    writer.shutdown();

    assert_eq!(kb.stats().records, 1);
    assert!(kb.find_by_identifier("BUG-1").is_some());
}

#[test]
fn test_from_settings_uses_staging_section() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = toy_settings(&temp_dir, 2);
    settings.staging.batch_threshold = 1;
    let kb = Arc::new(KnowledgeBase::open(settings).unwrap());
    let writer = StagingWriter::from_settings(Arc::clone(&kb));

    writer.submit(
        record("BUG-1", "staged"),
        vectors(&[(Facet::Summary, &[1.0, 0.0])]),
    );
    assert!(wait_for_records(&kb, 1));
    writer.shutdown();
}
